//! iSCSI PDU (Protocol Data Unit) building and assembly
//!
//! Outbound PDUs are built incrementally by the login, discovery, task
//! management, nop and SCSI layers and encoded into their wire image only when
//! the session starts writing them. Inbound PDUs are assembled from a
//! non-blocking socket a few bytes at a time.
//!
//! Wire format is RFC 3720: https://datatracker.ietf.org/doc/html/rfc3720

use crate::context::CommandCallback;
use crate::error::{IscsiError, IscsiResult};
use crate::scsi::ScsiTask;
use crate::session::DigestType;
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use crc::crc32;
use std::fmt;
use std::time::{Duration, Instant};

/// BHS (Basic Header Segment) size in bytes
pub const BHS_SIZE: usize = 48;

/// Size of a header or data digest
pub const DIGEST_SIZE: usize = 4;

/// Reserved tag value, never used as an ITT for a tracked task
pub const RESERVED_TAG: u32 = 0xffff_ffff;

/// Immediate delivery bit in byte 0
pub const IMMEDIATE_BIT: u8 = 0x40;

/// Response opcode used for PDUs that never get a reply (Data-Out, ping replies)
pub const NO_PDU: u8 = 0xff;

/// iSCSI PDU Opcodes (RFC 3720 Section 10)
pub mod opcode {
    // Initiator opcodes (initiator → target)
    pub const NOP_OUT: u8 = 0x00;
    pub const SCSI_COMMAND: u8 = 0x01;
    pub const TASK_MANAGEMENT_REQUEST: u8 = 0x02;
    pub const LOGIN_REQUEST: u8 = 0x03;
    pub const TEXT_REQUEST: u8 = 0x04;
    pub const SCSI_DATA_OUT: u8 = 0x05;
    pub const LOGOUT_REQUEST: u8 = 0x06;

    // Target opcodes (target → initiator)
    pub const NOP_IN: u8 = 0x20;
    pub const SCSI_RESPONSE: u8 = 0x21;
    pub const TASK_MANAGEMENT_RESPONSE: u8 = 0x22;
    pub const LOGIN_RESPONSE: u8 = 0x23;
    pub const TEXT_RESPONSE: u8 = 0x24;
    pub const SCSI_DATA_IN: u8 = 0x25;
    pub const LOGOUT_RESPONSE: u8 = 0x26;
    pub const R2T: u8 = 0x31;
    pub const ASYNC_MESSAGE: u8 = 0x32;
    pub const REJECT: u8 = 0x3F;
}

/// iSCSI PDU header flags (byte 1)
pub mod flags {
    // Common flags
    pub const FINAL: u8 = 0x80;
    pub const CONTINUE: u8 = 0x40;

    // SCSI command flags
    pub const READ: u8 = 0x40;
    pub const WRITE: u8 = 0x20;
    pub const ATTR_SIMPLE: u8 = 0x01;

    // Data-In / SCSI Response flags
    pub const STATUS: u8 = 0x01;
    pub const RESIDUAL_UNDERFLOW: u8 = 0x02;
    pub const RESIDUAL_OVERFLOW: u8 = 0x04;

    // Login flags
    pub const TRANSIT: u8 = 0x80;
    pub const CONTINUE_LOGIN: u8 = 0x40;

    // Login stages (CSG/NSG in bits 2-3 and 0-1)
    pub const CSG_SECURITY_NEG: u8 = 0x00;
    pub const CSG_LOGIN_OP_NEG: u8 = 0x04;
    pub const CSG_FULL_FEATURE: u8 = 0x0C;
    pub const NSG_SECURITY_NEG: u8 = 0x00;
    pub const NSG_LOGIN_OP_NEG: u8 = 0x01;
    pub const NSG_FULL_FEATURE: u8 = 0x03;
}

/// Engine-side PDU handling flags. These never go on the wire.
pub mod pdu_flags {
    /// Free the PDU once written instead of waiting for a response
    pub const DELETE_WHEN_SENT: u32 = 0x01;
    /// The PDU carries no callback
    pub const NO_CALLBACK: u32 = 0x02;
    /// Cancel instead of retransmitting after a reconnect
    pub const DROP_ON_RECONNECT: u32 = 0x04;
    /// Stop transmitting after this PDU until the context is uncorked
    pub const CORK_WHEN_SENT: u32 = 0x08;
    /// Sent while re-establishing a session; never held in the reconnect backlog
    pub const RECOVERY: u32 = 0x10;
}

/// Login status classes (RFC 3720 Section 10.13.5)
pub mod login_status {
    pub const SUCCESS: u8 = 0x00;
    pub const REDIRECTION: u8 = 0x01;
    pub const INITIATOR_ERROR: u8 = 0x02;
    pub const TARGET_ERROR: u8 = 0x03;

    pub const TARGET_MOVED_TEMPORARILY: u16 = 0x0101;
    pub const TARGET_MOVED_PERMANENTLY: u16 = 0x0102;
    pub const AUTH_FAILURE: u16 = 0x0201;
    pub const TARGET_NOT_FOUND: u16 = 0x0203;
}

/// SCSI response status codes
pub mod scsi_status {
    pub const GOOD: u8 = 0x00;
    pub const CHECK_CONDITION: u8 = 0x02;
    pub const CONDITION_MET: u8 = 0x04;
    pub const BUSY: u8 = 0x08;
    pub const RESERVATION_CONFLICT: u8 = 0x18;
    pub const TASK_SET_FULL: u8 = 0x28;
    pub const ACA_ACTIVE: u8 = 0x30;
    pub const TASK_ABORTED: u8 = 0x40;
}

/// Human readable opcode name for logs
pub fn opcode_name(op: u8) -> &'static str {
    match op & 0x3f {
        opcode::NOP_OUT => "NOP-Out",
        opcode::SCSI_COMMAND => "SCSI Command",
        opcode::TASK_MANAGEMENT_REQUEST => "Task Management Request",
        opcode::LOGIN_REQUEST => "Login Request",
        opcode::TEXT_REQUEST => "Text Request",
        opcode::SCSI_DATA_OUT => "SCSI Data-Out",
        opcode::LOGOUT_REQUEST => "Logout Request",
        opcode::NOP_IN => "NOP-In",
        opcode::SCSI_RESPONSE => "SCSI Response",
        opcode::TASK_MANAGEMENT_RESPONSE => "Task Management Response",
        opcode::LOGIN_RESPONSE => "Login Response",
        opcode::TEXT_RESPONSE => "Text Response",
        opcode::SCSI_DATA_IN => "SCSI Data-In",
        opcode::LOGOUT_RESPONSE => "Logout Response",
        opcode::R2T => "R2T",
        opcode::ASYNC_MESSAGE => "Async Message",
        opcode::REJECT => "Reject",
        _ => "Unknown",
    }
}

/// CRC32C (Castagnoli) digest as used for iSCSI header digests
pub fn crc32c(bytes: &[u8]) -> u32 {
    crc32::checksum_castagnoli(bytes)
}

/// Number of zero bytes needed to pad `len` to a 4-byte boundary
pub fn pad_len(len: usize) -> usize {
    (4 - (len % 4)) % 4
}

// ============================================================================
// Serial number arithmetic (RFC 1982, 32-bit)
// ============================================================================

/// `a < b` in 32-bit serial number arithmetic
pub fn serial_lt(a: u32, b: u32) -> bool {
    a != b && (a.wrapping_sub(b) as i32) < 0
}

/// `a <= b` in 32-bit serial number arithmetic
pub fn serial_le(a: u32, b: u32) -> bool {
    a == b || serial_lt(a, b)
}

/// The later of two serial numbers
pub fn serial_max(a: u32, b: u32) -> u32 {
    if serial_lt(a, b) {
        b
    } else {
        a
    }
}

// ============================================================================
// Outbound PDU
// ============================================================================

/// An outbound PDU.
///
/// ```text
/// Byte/     0       |       1       |       2       |       3       |
///    +---------------+---------------+---------------+---------------+
///   0|.|I| Opcode    |F|  Opcode-specific fields                     |
///   4|TotalAHSLength | DataSegmentLength                             |
///   8| LUN or Opcode-specific fields                                 |
///  16| Initiator Task Tag                                            |
///  20| TTT / ExpectedDataTransferLength / Referenced Task Tag        |
///  24| CmdSN                                                         |
///  28| ExpStatSN                                                     |
///  32| CDB / RefCmdSN                                                |
///  36| DataSN                                                        |
///  40| Buffer Offset                                                 |
///    +---------------+---------------+---------------+---------------+
/// ```
pub struct Pdu {
    opcode: u8,
    response_opcode: u8,
    flags: u32,
    itt: u32,
    cmdsn: u32,
    datasn: u32,
    header: [u8; BHS_SIZE],
    data: Vec<u8>,
    wire: Vec<u8>,
    written: usize,
    pub(crate) callback: Option<CommandCallback>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) deadline: Option<Instant>,
    pub(crate) seq: u64,
    pub(crate) task: Option<ScsiTask>,
    /// Callback already resolved while the tail was still being written
    pub(crate) detached: bool,
}

impl fmt::Debug for Pdu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pdu")
            .field("opcode", &opcode_name(self.opcode))
            .field("itt", &format_args!("0x{:08x}", self.itt))
            .field("cmdsn", &self.cmdsn)
            .field("flags", &self.flags)
            .field("data_len", &self.data.len())
            .field("written", &self.written)
            .finish()
    }
}

impl Pdu {
    /// Allocate a PDU for `opcode`, expecting `response_opcode` in reply.
    pub fn new(opcode: u8, response_opcode: u8, itt: u32, flags: u32) -> Self {
        let mut header = [0u8; BHS_SIZE];
        header[0] = opcode & 0x3f;
        BigEndian::write_u32(&mut header[16..20], itt);
        Pdu {
            opcode: opcode & 0x3f,
            response_opcode,
            flags,
            itt,
            cmdsn: 0,
            datasn: 0,
            header,
            data: Vec::new(),
            wire: Vec::new(),
            written: 0,
            callback: None,
            timeout: None,
            deadline: None,
            seq: 0,
            task: None,
            detached: false,
        }
    }

    /// Like [`Pdu::new`], but rejects opcodes an initiator never sends
    pub fn allocate(opcode: u8, response_opcode: u8, itt: u32, flags: u32) -> IscsiResult<Self> {
        if opcode & 0x3f > opcode::LOGOUT_REQUEST {
            return Err(IscsiError::InvalidPdu(format!(
                "{} is not an initiator opcode",
                opcode_name(opcode & 0x3f)
            )));
        }
        Ok(Pdu::new(opcode, response_opcode, itt, flags))
    }

    pub fn opcode(&self) -> u8 {
        self.opcode
    }

    pub fn response_opcode(&self) -> u8 {
        self.response_opcode
    }

    pub fn itt(&self) -> u32 {
        self.itt
    }

    pub fn cmdsn(&self) -> u32 {
        self.cmdsn
    }

    pub fn datasn(&self) -> u32 {
        self.datasn
    }

    pub fn header(&self) -> &[u8; BHS_SIZE] {
        &self.header
    }

    /// Payload without padding
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    pub fn add_flags(&mut self, flag: u32) {
        self.flags |= flag;
    }

    pub fn is_immediate(&self) -> bool {
        self.header[0] & IMMEDIATE_BIT != 0
    }

    /// Whether queueing this PDU consumes a CmdSN slot
    pub fn consumes_cmdsn(&self) -> bool {
        !self.is_immediate() && self.opcode != opcode::SCSI_DATA_OUT
    }

    pub fn set_immediate(&mut self) {
        self.header[0] |= IMMEDIATE_BIT;
    }

    pub fn set_pdu_flags(&mut self, flags: u8) {
        self.header[1] = flags;
    }

    /// Single level LUN addressing
    pub fn set_lun(&mut self, lun: u32) {
        self.header[8] = (lun >> 8) as u8;
        self.header[9] = (lun & 0xff) as u8;
    }

    /// Copy an 8-byte LUN field verbatim
    pub fn set_raw_lun(&mut self, lun: &[u8]) {
        let n = lun.len().min(8);
        self.header[8..8 + n].copy_from_slice(&lun[..n]);
    }

    pub fn set_itt(&mut self, itt: u32) {
        self.itt = itt;
        BigEndian::write_u32(&mut self.header[16..20], itt);
    }

    pub fn set_ritt(&mut self, ritt: u32) {
        BigEndian::write_u32(&mut self.header[20..24], ritt);
    }

    pub fn set_ttt(&mut self, ttt: u32) {
        BigEndian::write_u32(&mut self.header[20..24], ttt);
    }

    pub fn set_expxferlen(&mut self, len: u32) {
        BigEndian::write_u32(&mut self.header[20..24], len);
    }

    pub fn set_cmdsn(&mut self, cmdsn: u32) {
        self.cmdsn = cmdsn;
        BigEndian::write_u32(&mut self.header[24..28], cmdsn);
    }

    pub fn set_expstatsn(&mut self, expstatsn: u32) {
        BigEndian::write_u32(&mut self.header[28..32], expstatsn);
    }

    pub fn set_rcmdsn(&mut self, rcmdsn: u32) {
        BigEndian::write_u32(&mut self.header[32..36], rcmdsn);
    }

    pub fn set_datasn(&mut self, datasn: u32) {
        self.datasn = datasn;
        BigEndian::write_u32(&mut self.header[36..40], datasn);
    }

    pub fn set_bufferoffset(&mut self, offset: u32) {
        BigEndian::write_u32(&mut self.header[40..44], offset);
    }

    /// Write a CDB of up to 16 bytes into bytes 32..48
    pub fn set_cdb(&mut self, cdb: &[u8]) -> IscsiResult<()> {
        if cdb.len() > 16 {
            return Err(IscsiError::InvalidPdu(format!(
                "CDB too long: {} bytes (max 16)",
                cdb.len()
            )));
        }
        self.header[32..48].fill(0);
        self.header[32..32 + cdb.len()].copy_from_slice(cdb);
        Ok(())
    }

    /// Per-PDU timeout; zero disables the timeout scanner for this PDU
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = if timeout.is_zero() { None } else { Some(timeout) };
    }

    pub fn set_callback(&mut self, callback: CommandCallback) {
        self.callback = Some(callback);
    }

    /// Append bytes to the data segment.
    ///
    /// On allocation failure the PDU is left exactly as it was.
    pub fn add_data(&mut self, bytes: &[u8]) -> IscsiResult<()> {
        if bytes.is_empty() {
            return Err(IscsiError::InvalidPdu(
                "trying to add zero bytes of data".to_string(),
            ));
        }
        let new_len = self.data.len() + bytes.len();
        if new_len > 0x00ff_ffff {
            return Err(IscsiError::InvalidPdu(format!(
                "data segment of {} bytes does not fit in 24 bits",
                new_len
            )));
        }
        self.data
            .try_reserve(bytes.len() + pad_len(new_len))
            .map_err(|e| IscsiError::OutOfMemory(format!("pdu data: {}", e)))?;
        self.data.extend_from_slice(bytes);
        BigEndian::write_u24(&mut self.header[5..8], new_len as u32);
        Ok(())
    }

    /// Append a `key=value\0` text record
    pub fn add_text(&mut self, key: &str, value: &str) -> IscsiResult<()> {
        let record = format!("{}={}\0", key, value);
        self.add_data(record.as_bytes())
    }

    pub fn data_segment_length(&self) -> u32 {
        BigEndian::read_u24(&self.header[5..8])
    }

    /// Produce the wire image: header, optional header digest, padded data.
    pub(crate) fn encode(&mut self, digest: DigestType) -> IscsiResult<()> {
        let digest_len = if digest == DigestType::CRC32C { DIGEST_SIZE } else { 0 };
        let total = BHS_SIZE + digest_len + self.data.len() + pad_len(self.data.len());

        let mut wire = Vec::new();
        wire.try_reserve_exact(total)
            .map_err(|e| IscsiError::OutOfMemory(format!("pdu wire image: {}", e)))?;
        wire.extend_from_slice(&self.header);
        if digest == DigestType::CRC32C {
            let mut crc = [0u8; DIGEST_SIZE];
            LittleEndian::write_u32(&mut crc, crc32c(&self.header));
            wire.extend_from_slice(&crc);
        }
        wire.extend_from_slice(&self.data);
        wire.resize(total, 0);

        self.wire = wire;
        self.written = 0;
        Ok(())
    }

    pub(crate) fn unwritten(&self) -> &[u8] {
        &self.wire[self.written..]
    }

    pub(crate) fn advance(&mut self, n: usize) {
        self.written = (self.written + n).min(self.wire.len());
    }

    pub(crate) fn bytes_written(&self) -> usize {
        self.written
    }

    pub(crate) fn is_fully_written(&self) -> bool {
        !self.wire.is_empty() && self.written == self.wire.len()
    }

    /// Forget any transmission progress so the PDU can be sent again
    pub(crate) fn reset_for_retransmit(&mut self) {
        self.wire = Vec::new();
        self.written = 0;
        self.detached = false;
        if let Some(task) = self.task.as_mut() {
            task.reset();
        }
    }
}

// ============================================================================
// Inbound PDU assembly
// ============================================================================

/// A PDU being assembled from the socket
#[derive(Debug)]
pub struct InPdu {
    hdr: [u8; BHS_SIZE + DIGEST_SIZE],
    hdr_len: usize,
    hdr_pos: usize,
    /// AHS, data segment and padding
    body: Vec<u8>,
    body_pos: usize,
    data_len: usize,
    ahs_len: usize,
    prepared: bool,
}

impl InPdu {
    /// Start assembling a PDU whose header is `hdr_len` bytes (48 or 52)
    pub fn new(hdr_len: usize) -> Self {
        InPdu {
            hdr: [0u8; BHS_SIZE + DIGEST_SIZE],
            hdr_len: hdr_len.min(BHS_SIZE + DIGEST_SIZE),
            hdr_pos: 0,
            body: Vec::new(),
            body_pos: 0,
            data_len: 0,
            ahs_len: 0,
            prepared: false,
        }
    }

    /// The part of the buffer still waiting for bytes
    pub(crate) fn unfilled_mut(&mut self) -> &mut [u8] {
        if self.hdr_pos < self.hdr_len {
            &mut self.hdr[self.hdr_pos..self.hdr_len]
        } else {
            &mut self.body[self.body_pos..]
        }
    }

    pub(crate) fn advance(&mut self, n: usize) {
        if self.hdr_pos < self.hdr_len {
            self.hdr_pos = (self.hdr_pos + n).min(self.hdr_len);
        } else {
            self.body_pos = (self.body_pos + n).min(self.body.len());
        }
    }

    pub(crate) fn header_complete(&self) -> bool {
        self.hdr_pos == self.hdr_len
    }

    pub(crate) fn is_prepared(&self) -> bool {
        self.prepared
    }

    /// Validate the completed header and size the body buffer.
    pub(crate) fn prepare_body(&mut self, max_data_len: u32) -> IscsiResult<()> {
        if self.hdr_len == BHS_SIZE + DIGEST_SIZE {
            let expected = crc32c(&self.hdr[..BHS_SIZE]);
            let received = LittleEndian::read_u32(&self.hdr[BHS_SIZE..BHS_SIZE + DIGEST_SIZE]);
            if expected != received {
                return Err(IscsiError::InvalidPdu(format!(
                    "header digest mismatch: expected 0x{:08x}, got 0x{:08x}",
                    expected, received
                )));
            }
        }

        let data_len = BigEndian::read_u24(&self.hdr[5..8]);
        if data_len > max_data_len {
            return Err(IscsiError::InvalidPdu(format!(
                "data segment of {} bytes exceeds MaxRecvDataSegmentLength {}",
                data_len, max_data_len
            )));
        }
        self.ahs_len = self.hdr[4] as usize * 4;
        self.data_len = data_len as usize;

        let body_len = self.ahs_len + self.data_len + pad_len(self.data_len);
        let mut body = Vec::new();
        body.try_reserve_exact(body_len)
            .map_err(|e| IscsiError::OutOfMemory(format!("inbound pdu: {}", e)))?;
        body.resize(body_len, 0);
        self.body = body;
        self.body_pos = 0;
        self.prepared = true;
        Ok(())
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.header_complete() && self.prepared && self.body_pos == self.body.len()
    }

    /// The 48-byte basic header segment
    pub fn header(&self) -> &[u8] {
        &self.hdr[..BHS_SIZE]
    }

    /// The data segment without AHS or padding
    pub fn data(&self) -> &[u8] {
        &self.body[self.ahs_len..self.ahs_len + self.data_len]
    }

    pub fn opcode(&self) -> u8 {
        self.hdr[0] & 0x3f
    }

    pub fn flags(&self) -> u8 {
        self.hdr[1]
    }

    pub fn byte(&self, offset: usize) -> u8 {
        self.hdr[offset]
    }

    pub fn u32_at(&self, offset: usize) -> u32 {
        BigEndian::read_u32(&self.hdr[offset..offset + 4])
    }

    pub fn itt(&self) -> u32 {
        self.u32_at(16)
    }

    pub fn ttt(&self) -> u32 {
        self.u32_at(20)
    }

    pub fn statsn(&self) -> u32 {
        self.u32_at(24)
    }

    pub fn expcmdsn(&self) -> u32 {
        self.u32_at(28)
    }

    pub fn maxcmdsn(&self) -> u32 {
        self.u32_at(32)
    }
}

// ============================================================================
// Text parameters
// ============================================================================

/// Parse NUL-terminated `key=value` records.
///
/// An empty record ends the list. A trailing record without its NUL, or a
/// record without `=`, is an error.
pub fn parse_text_records(data: &[u8]) -> IscsiResult<Vec<(String, String)>> {
    let mut records = Vec::new();
    let mut rest = data;

    while !rest.is_empty() {
        let end = rest.iter().position(|&b| b == 0).ok_or_else(|| {
            IscsiError::Protocol(format!(
                "unterminated text record '{}'",
                String::from_utf8_lossy(rest)
            ))
        })?;
        let record = &rest[..end];
        if record.is_empty() {
            break;
        }

        let text = String::from_utf8_lossy(record);
        let eq = text.find('=').ok_or_else(|| {
            IscsiError::Protocol(format!("text record without '=': '{}'", text))
        })?;
        records.push((text[..eq].to_string(), text[eq + 1..].to_string()));
        rest = &rest[end + 1..];
    }

    Ok(records)
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pdu_new() {
        let pdu = Pdu::new(opcode::NOP_OUT, opcode::NOP_IN, 0x1234_5678, 0);
        assert_eq!(pdu.opcode(), opcode::NOP_OUT);
        assert_eq!(pdu.itt(), 0x1234_5678);
        assert_eq!(&pdu.header()[16..20], &[0x12, 0x34, 0x56, 0x78]);
        assert!(!pdu.is_immediate());
        assert!(pdu.data().is_empty());
    }

    #[test]
    fn test_allocate_rejects_target_opcodes() {
        assert!(Pdu::allocate(opcode::TEXT_REQUEST, opcode::TEXT_RESPONSE, 1, 0).is_ok());
        assert!(matches!(
            Pdu::allocate(opcode::SCSI_RESPONSE, opcode::SCSI_RESPONSE, 1, 0),
            Err(IscsiError::InvalidPdu(_))
        ));
    }

    #[test]
    fn test_setters_write_fields() {
        let mut pdu = Pdu::new(opcode::SCSI_COMMAND, opcode::SCSI_RESPONSE, 7, 0);
        pdu.set_immediate();
        pdu.set_pdu_flags(flags::FINAL | flags::READ);
        pdu.set_lun(0x0102);
        pdu.set_expxferlen(4096);
        pdu.set_cmdsn(9);
        pdu.set_expstatsn(3);
        pdu.set_cdb(&[0x28, 0, 0, 0, 0, 1]).unwrap();

        let hdr = pdu.header();
        assert_eq!(hdr[0], opcode::SCSI_COMMAND | IMMEDIATE_BIT);
        assert_eq!(hdr[1], 0xc0);
        assert_eq!(&hdr[8..10], &[0x01, 0x02]);
        assert_eq!(BigEndian::read_u32(&hdr[20..24]), 4096);
        assert_eq!(BigEndian::read_u32(&hdr[24..28]), 9);
        assert_eq!(BigEndian::read_u32(&hdr[28..32]), 3);
        assert_eq!(hdr[32], 0x28);
        assert_eq!(hdr[37], 1);
        assert_eq!(pdu.cmdsn(), 9);
    }

    #[test]
    fn test_cdb_too_long() {
        let mut pdu = Pdu::new(opcode::SCSI_COMMAND, opcode::SCSI_RESPONSE, 1, 0);
        assert!(pdu.set_cdb(&[0u8; 17]).is_err());
    }

    #[test]
    fn test_add_data_updates_length() {
        let mut pdu = Pdu::new(opcode::TEXT_REQUEST, opcode::TEXT_RESPONSE, 1, 0);
        pdu.add_text("SendTargets", "All").unwrap();
        assert_eq!(pdu.data(), b"SendTargets=All\0");
        assert_eq!(pdu.data_segment_length(), 16);

        pdu.add_data(b"abc").unwrap();
        assert_eq!(pdu.data_segment_length(), 19);
    }

    #[test]
    fn test_add_empty_data_rejected() {
        let mut pdu = Pdu::new(opcode::NOP_OUT, opcode::NOP_IN, 1, 0);
        assert!(pdu.add_data(&[]).is_err());
        assert_eq!(pdu.data_segment_length(), 0);
    }

    #[test]
    fn test_encode_pads_data() {
        let mut pdu = Pdu::new(opcode::NOP_OUT, opcode::NOP_IN, 1, 0);
        pdu.add_data(b"hello").unwrap();
        pdu.encode(DigestType::None).unwrap();
        assert_eq!(pdu.unwritten().len(), BHS_SIZE + 8);
        assert_eq!(&pdu.unwritten()[BHS_SIZE..BHS_SIZE + 5], b"hello");
        assert_eq!(&pdu.unwritten()[BHS_SIZE + 5..], &[0, 0, 0]);
    }

    #[test]
    fn test_encode_with_header_digest() {
        let mut pdu = Pdu::new(opcode::NOP_OUT, opcode::NOP_IN, 1, 0);
        pdu.encode(DigestType::CRC32C).unwrap();
        let wire = pdu.unwritten().to_vec();
        assert_eq!(wire.len(), BHS_SIZE + DIGEST_SIZE);
        let crc = LittleEndian::read_u32(&wire[BHS_SIZE..]);
        assert_eq!(crc, crc32c(&wire[..BHS_SIZE]));
    }

    #[test]
    fn test_partial_write_tracking() {
        let mut pdu = Pdu::new(opcode::NOP_OUT, opcode::NOP_IN, 1, 0);
        pdu.encode(DigestType::None).unwrap();
        pdu.advance(20);
        assert_eq!(pdu.bytes_written(), 20);
        assert_eq!(pdu.unwritten().len(), BHS_SIZE - 20);
        assert!(!pdu.is_fully_written());
        pdu.advance(100);
        assert!(pdu.is_fully_written());

        pdu.reset_for_retransmit();
        assert_eq!(pdu.bytes_written(), 0);
        assert!(!pdu.is_fully_written());
    }

    #[test]
    fn test_crc32c_check_value() {
        assert_eq!(crc32c(b"123456789"), 0xe306_9283);
    }

    #[test]
    fn test_serial_compare() {
        assert!(serial_lt(1, 2));
        assert!(!serial_lt(2, 1));
        assert!(serial_lt(0xffff_fff0, 5));
        assert!(serial_le(5, 5));
        assert_eq!(serial_max(0xffff_fffe, 1), 1);
        assert_eq!(serial_max(10, 3), 10);
    }

    #[test]
    fn test_inpdu_assembly() {
        let mut hdr = [0u8; BHS_SIZE];
        hdr[0] = opcode::NOP_IN;
        hdr[7] = 5;
        BigEndian::write_u32(&mut hdr[16..20], 42);

        let mut wire = hdr.to_vec();
        wire.extend_from_slice(b"hello\0\0\0");

        let mut pdu = InPdu::new(BHS_SIZE);
        let mut pos = 0;
        while !pdu.is_complete() {
            let buf = pdu.unfilled_mut();
            let n = buf.len().min(7).min(wire.len() - pos);
            buf[..n].copy_from_slice(&wire[pos..pos + n]);
            pos += n;
            pdu.advance(n);
            if pdu.header_complete() && !pdu.is_prepared() {
                pdu.prepare_body(8192).unwrap();
            }
        }
        assert_eq!(pdu.opcode(), opcode::NOP_IN);
        assert_eq!(pdu.itt(), 42);
        assert_eq!(pdu.data(), b"hello");
    }

    #[test]
    fn test_inpdu_rejects_oversized_data() {
        let mut pdu = InPdu::new(BHS_SIZE);
        let buf = pdu.unfilled_mut();
        buf[5] = 0x10; // 1 MiB
        pdu.advance(BHS_SIZE);
        assert!(pdu.prepare_body(262_144).is_err());
    }

    #[test]
    fn test_inpdu_bad_header_digest() {
        let mut pdu = InPdu::new(BHS_SIZE + DIGEST_SIZE);
        let buf = pdu.unfilled_mut();
        buf[0] = opcode::NOP_IN;
        buf[BHS_SIZE] = 0xaa;
        pdu.advance(BHS_SIZE + DIGEST_SIZE);
        assert!(pdu.prepare_body(8192).is_err());
    }

    #[test]
    fn test_parse_text_records() {
        let params = parse_text_records(b"Key1=Value1\0Key2=Value2\0").unwrap();
        assert_eq!(params.len(), 2);
        assert_eq!(params[0], ("Key1".to_string(), "Value1".to_string()));
        assert_eq!(params[1], ("Key2".to_string(), "Value2".to_string()));
    }

    #[test]
    fn test_parse_text_records_stops_at_empty() {
        let params = parse_text_records(b"A=1\0\0B=2\0").unwrap();
        assert_eq!(params, vec![("A".to_string(), "1".to_string())]);
    }

    #[test]
    fn test_parse_text_records_unterminated() {
        assert!(parse_text_records(b"A=1\0B=2").is_err());
        assert!(parse_text_records(b"novalue\0").is_err());
    }
}
