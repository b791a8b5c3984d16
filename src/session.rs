//! iSCSI session parameters and sequence number state
//!
//! This module holds the operational parameters negotiated during login and
//! the command/status sequence counters of a session, based on RFC 3720:
//! https://datatracker.ietf.org/doc/html/rfc3720

use crate::pdu::{serial_le, serial_lt, serial_max, RESERVED_TAG};
use std::fmt;

/// Session type (RFC 3720 Section 5.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[derive(Default)]
pub enum SessionType {
    /// Normal session for SCSI commands
    #[default]
    Normal,
    /// Discovery session for target discovery (SendTargets)
    Discovery,
}

impl SessionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionType::Normal => "Normal",
            SessionType::Discovery => "Discovery",
        }
    }
}

/// Digest in force for a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[derive(Default)]
pub enum DigestType {
    #[default]
    None,
    CRC32C,
}

/// Header digest offer sent during operational negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[derive(Default)]
pub enum HeaderDigestPreference {
    None,
    #[default]
    NoneCrc32c,
    Crc32cNone,
    Crc32c,
}

impl HeaderDigestPreference {
    /// Value of the `HeaderDigest=` login key
    pub fn as_str(&self) -> &'static str {
        match self {
            HeaderDigestPreference::None => "None",
            HeaderDigestPreference::NoneCrc32c => "None,CRC32C",
            HeaderDigestPreference::Crc32cNone => "CRC32C,None",
            HeaderDigestPreference::Crc32c => "CRC32C",
        }
    }
}

/// Login stage (CSG/NSG values, RFC 3720 Section 10.12.3)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[derive(Default)]
pub enum LoginStage {
    #[default]
    SecurityNegotiation,
    OperationalNegotiation,
    FullFeature,
}

impl LoginStage {
    /// Stage encoded as CSG (bits 2-3 of byte 1)
    pub fn csg(&self) -> u8 {
        self.nsg() << 2
    }

    /// Stage encoded as NSG (bits 0-1 of byte 1)
    pub fn nsg(&self) -> u8 {
        match self {
            LoginStage::SecurityNegotiation => 0,
            LoginStage::OperationalNegotiation => 1,
            LoginStage::FullFeature => 3,
        }
    }

    pub fn from_nsg(nsg: u8) -> Self {
        match nsg & 0x03 {
            0 => LoginStage::SecurityNegotiation,
            1 => LoginStage::OperationalNegotiation,
            _ => LoginStage::FullFeature,
        }
    }
}

/// Negotiated session parameters (RFC 3720 Section 12)
#[derive(Debug, Clone)]
pub struct SessionParams {
    /// Largest data segment we accept from the target
    pub initiator_max_recv_data_segment_length: u32,
    /// Largest data segment the target accepts from us
    pub target_max_recv_data_segment_length: u32,
    /// Maximum burst length for solicited data
    pub max_burst_length: u32,
    /// First burst length for unsolicited data
    pub first_burst_length: u32,
    /// Immediate data allowed
    pub immediate_data: bool,
    /// Initial R2T required
    pub initial_r2t: bool,
}

impl Default for SessionParams {
    fn default() -> Self {
        SessionParams {
            initiator_max_recv_data_segment_length: 262_144,
            target_max_recv_data_segment_length: 8192,
            max_burst_length: 262_144,
            first_burst_length: 262_144,
            immediate_data: true,
            initial_r2t: true,
        }
    }
}

impl SessionParams {
    /// Apply a key returned by the target in a login response.
    ///
    /// Returns false for keys this struct does not track.
    pub fn apply_target_param(&mut self, key: &str, value: &str) -> bool {
        match key {
            "MaxRecvDataSegmentLength" => {
                if let Ok(v) = value.parse::<u32>() {
                    self.target_max_recv_data_segment_length = v;
                }
            }
            "MaxBurstLength" => {
                if let Ok(v) = value.parse::<u32>() {
                    self.max_burst_length = v.min(self.max_burst_length);
                }
            }
            "FirstBurstLength" => {
                if let Ok(v) = value.parse::<u32>() {
                    self.first_burst_length = v.min(self.first_burst_length);
                }
            }
            "ImmediateData" => {
                // AND: only when both sides want it
                self.immediate_data = self.immediate_data && value == "Yes";
            }
            "InitialR2T" => {
                // OR: when either side wants it
                self.initial_r2t = self.initial_r2t || value == "Yes";
            }
            _ => return false,
        }
        log::debug!("Negotiated {}={}", key, value);
        true
    }
}

/// Task tag and sequence number counters of a session
#[derive(Debug, Clone, Default)]
pub struct SequenceState {
    /// Next initiator task tag
    pub itt: u32,
    /// Next CmdSN to assign
    pub cmdsn: u32,
    /// Lowest CmdSN the target expects
    pub expcmdsn: u32,
    /// Highest CmdSN the target accepts
    pub maxcmdsn: u32,
    /// Last StatSN received
    pub statsn: u32,
    statsn_valid: bool,
}

impl SequenceState {
    /// Allocate the next task tag, skipping the reserved value and any tag
    /// for which `in_use` returns true.
    pub fn next_itt(&mut self, in_use: impl Fn(u32) -> bool) -> u32 {
        loop {
            let itt = self.itt;
            self.itt = self.itt.wrapping_add(1);
            if self.itt == RESERVED_TAG {
                self.itt = 0;
            }
            if itt != RESERVED_TAG && !in_use(itt) {
                return itt;
            }
        }
    }

    /// Take the next CmdSN
    pub fn consume_cmdsn(&mut self) -> u32 {
        let sn = self.cmdsn;
        self.cmdsn = self.cmdsn.wrapping_add(1);
        sn
    }

    /// Whether `cmdsn` may be sent under the target's current window
    pub fn in_window(&self, cmdsn: u32) -> bool {
        serial_le(self.expcmdsn, cmdsn) && serial_le(cmdsn, self.maxcmdsn)
    }

    /// Advance the command window from a response. Stale values are ignored.
    pub fn update_window(&mut self, expcmdsn: u32, maxcmdsn: u32) {
        // RFC 3720 3.2.2.1: ignore if MaxCmdSN < ExpCmdSN - 1
        if serial_lt(maxcmdsn, expcmdsn.wrapping_sub(1)) {
            return;
        }
        self.expcmdsn = serial_max(self.expcmdsn, expcmdsn);
        self.maxcmdsn = serial_max(self.maxcmdsn, maxcmdsn);
    }

    /// Record a StatSN. Returns false if it would move backwards.
    pub fn advance_statsn(&mut self, statsn: u32) -> bool {
        if self.statsn_valid && serial_lt(statsn, self.statsn) {
            return false;
        }
        self.statsn = statsn;
        self.statsn_valid = true;
        true
    }

    /// Take the StatSN of a login response unconditionally
    pub fn set_statsn(&mut self, statsn: u32) {
        self.statsn = statsn;
        self.statsn_valid = true;
    }

    /// ExpStatSN to place in the next outbound PDU
    pub fn expstatsn(&self) -> u32 {
        if self.statsn_valid {
            self.statsn.wrapping_add(1)
        } else {
            0
        }
    }

    /// Forget all window and status state for a fresh login.
    /// The task tag counter carries on so old and new tags never mix.
    pub fn reset_for_login(&mut self) {
        self.expcmdsn = self.cmdsn;
        self.maxcmdsn = self.cmdsn;
        self.statsn = 0;
        self.statsn_valid = false;
    }

    /// Start the window from the values of a successful login response
    pub fn set_login_window(&mut self, expcmdsn: u32, maxcmdsn: u32) {
        self.cmdsn = expcmdsn;
        self.expcmdsn = expcmdsn;
        self.maxcmdsn = maxcmdsn;
    }
}

impl fmt::Display for SequenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "itt=0x{:08x} cmdsn={} window=[{}, {}] statsn={}",
            self.itt, self.cmdsn, self.expcmdsn, self.maxcmdsn, self.statsn
        )
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
