//! Login and logout (RFC 3720 Sections 5.3, 10.12, 10.14)
//!
//! Without CHAP credentials the login goes straight to operational
//! negotiation and asks for full feature phase in one exchange. With
//! credentials it first walks the CHAP sub-state machine in security
//! negotiation:
//!
//! ```text
//! OfferChap ──AuthMethod=CHAP──> SelectAlgorithm ──CHAP_A/I/C──> SendResponse ──> OpNeg
//! ```

use crate::auth::{parse_chap_hex, ChapAlgorithm, ChapChallenge, ChapPhase, MutualChallenge};
use crate::context::{CommandCallback, CommandData, CommandStatus, IscsiContext, Reply};
use crate::error::{decode_login_status, IscsiError, IscsiResult};
use crate::pdu::{flags, login_status, opcode, parse_text_records, pdu_flags, InPdu, Pdu};
use crate::session::{DigestType, LoginStage, SessionParams, SessionType};
use byteorder::{BigEndian, ByteOrder};
use log::{debug, info, warn};

/// Give up after this many login PDUs without reaching full feature phase
pub const MAX_LOGIN_ATTEMPTS: u32 = 10;

/// Logout reason code "close the session"
const LOGOUT_CLOSE_SESSION: u8 = 0x80;

/// Login progress of the current connection
#[derive(Debug, Default)]
pub(crate) struct LoginState {
    pub(crate) logged_in: bool,
    pub(crate) stage: LoginStage,
    pub(crate) chap: ChapPhase,
    pub(crate) challenge: ChapChallenge,
    pub(crate) attempts: u32,
    pub(crate) target_address: Option<String>,
    /// Digest the target agreed to; in force once logged in
    pub(crate) negotiated_digest: DigestType,
}

impl LoginState {
    /// Forget everything tied to the connection that just went away
    pub(crate) fn reset(&mut self) {
        self.logged_in = false;
        self.stage = LoginStage::default();
        self.chap = ChapPhase::default();
        self.challenge = ChapChallenge::default();
        self.negotiated_digest = DigestType::None;
    }
}

impl IscsiContext {
    /// Start logging in on a connected transport.
    ///
    /// Fails synchronously when already logged in, when no session type is
    /// set, when a normal session has no target name, or after too many
    /// login attempts. `cb` receives `Good`, `Redirect` (with the new
    /// address) or `Error`.
    pub fn login_async(&mut self, cb: CommandCallback) -> IscsiResult<()> {
        if self.login.logged_in {
            let msg = "Trying to login while already logged in".to_string();
            self.set_error(msg.clone());
            return Err(IscsiError::Session(msg));
        }
        match self.session_type {
            None => {
                let msg = "Trying to login without setting session type".to_string();
                self.set_error(msg.clone());
                return Err(IscsiError::Config(msg));
            }
            Some(SessionType::Normal) if self.target_name.is_none() => {
                let msg = "Trying normal login but target name not set".to_string();
                self.set_error(msg.clone());
                return Err(IscsiError::Config(msg));
            }
            Some(_) => {}
        }

        self.login.stage = if self.chap.is_some() {
            LoginStage::SecurityNegotiation
        } else {
            LoginStage::OperationalNegotiation
        };
        self.login.chap = ChapPhase::OfferChap;
        self.login.challenge = ChapChallenge::default();
        self.login.negotiated_digest = DigestType::None;
        self.mutual_chap_state = None;
        // Every login negotiates from our own offer, not from the last session
        self.params = SessionParams::default();

        let mut pdu = self.build_login_pdu()?;
        pdu.set_callback(cb);
        self.queue(pdu)
    }

    /// Build the next login request for the current stage and CHAP phase
    fn build_login_pdu(&mut self) -> IscsiResult<Pdu> {
        self.login.attempts += 1;
        if self.login.attempts > MAX_LOGIN_ATTEMPTS {
            let msg = "Login took too many tries, giving up".to_string();
            self.set_error(msg.clone());
            return Err(IscsiError::Session(msg));
        }

        let stage = self.login.stage;
        let phase = self.login.chap;
        let (transit, next) = match stage {
            LoginStage::SecurityNegotiation => (
                phase != ChapPhase::SelectAlgorithm,
                LoginStage::OperationalNegotiation,
            ),
            _ => (true, LoginStage::FullFeature),
        };

        let engine_flags = if self.reconnect.attempt_in_flight {
            pdu_flags::RECOVERY
        } else {
            0
        };
        let mut pdu = Pdu::new(opcode::LOGIN_REQUEST, opcode::LOGIN_RESPONSE, self.seq.itt, engine_flags);
        pdu.set_immediate();
        let mut login_flags = stage.csg() | next.nsg();
        if transit {
            login_flags |= flags::TRANSIT;
        }
        pdu.set_pdu_flags(login_flags);
        // ISID in bytes 8..14, TSIH 0 for a new session
        pdu.set_raw_lun(&self.isid);

        let first_leg = stage == LoginStage::OperationalNegotiation
            || (stage == LoginStage::SecurityNegotiation && phase == ChapPhase::OfferChap);
        let session_type = self.session_type.unwrap_or_default();

        if first_leg {
            pdu.add_text("InitiatorName", &self.initiator_name)?;
            if let Some(alias) = &self.alias {
                pdu.add_text("InitiatorAlias", alias)?;
            }
            if session_type == SessionType::Normal {
                let target = self.target_name.as_deref().ok_or_else(|| {
                    IscsiError::Config("Trying normal login but target name not set".to_string())
                })?;
                pdu.add_text("TargetName", target)?;
            }
            pdu.add_text("SessionType", session_type.as_str())?;
        }

        if stage == LoginStage::OperationalNegotiation {
            pdu.add_text("HeaderDigest", self.want_header_digest.as_str())?;
        }

        if stage == LoginStage::SecurityNegotiation {
            self.add_chap_keys(&mut pdu, phase)?;
        }

        if stage == LoginStage::OperationalNegotiation {
            add_operational_keys(&mut pdu)?;
        }

        debug!(
            "Login request itt=0x{:08x} stage={:?} chap={:?} transit={} attempt={}",
            pdu.itt(),
            stage,
            phase,
            transit,
            self.login.attempts
        );
        Ok(pdu)
    }

    fn add_chap_keys(&mut self, pdu: &mut Pdu, phase: ChapPhase) -> IscsiResult<()> {
        match phase {
            ChapPhase::OfferChap => pdu.add_text("AuthMethod", "CHAP,None"),
            ChapPhase::SelectAlgorithm => pdu.add_text("CHAP_A", &(ChapAlgorithm::Md5 as u8).to_string()),
            ChapPhase::SendResponse => {
                let creds = self
                    .chap
                    .as_ref()
                    .ok_or_else(|| IscsiError::Auth("CHAP requested but no credentials set".to_string()))?;
                if self.login.challenge.challenge.is_empty() {
                    return Err(IscsiError::Auth("No CHAP challenge found".to_string()));
                }
                pdu.add_text("CHAP_N", &creds.username)?;
                pdu.add_text("CHAP_R", &self.login.challenge.response_hex(&creds.secret))?;

                if self.target_chap.is_some() {
                    let ours = MutualChallenge::generate();
                    pdu.add_text("CHAP_I", &ours.identifier_value())?;
                    pdu.add_text("CHAP_C", &ours.challenge_value())?;
                    self.mutual_chap_state = Some(ours);
                }
                Ok(())
            }
        }
    }

    /// Handle a login response for `pdu`
    pub(crate) fn process_login_reply(&mut self, pdu: &mut Pdu, inpdu: &InPdu) -> Reply {
        let status = BigEndian::read_u16(&inpdu.header()[36..38]);
        self.seq.set_statsn(inpdu.statsn());

        let records = match parse_text_records(inpdu.data()) {
            Ok(records) => records,
            Err(e) => return self.login_failed(format!("Malformed login response: {}", e)),
        };

        let mut target_chap_name = None;
        let mut target_chap_response = None;
        for (key, value) in records {
            match key.as_str() {
                "TargetAddress" => self.login.target_address = Some(value),
                "HeaderDigest" => {
                    self.login.negotiated_digest = if value == "CRC32C" {
                        DigestType::CRC32C
                    } else {
                        DigestType::None
                    };
                }
                "AuthMethod" => {
                    if value == "CHAP" {
                        self.login.chap = ChapPhase::SelectAlgorithm;
                    }
                }
                "CHAP_A" => {
                    self.login.challenge.algorithm = ChapAlgorithm::from_str(&value);
                    if self.login.challenge.algorithm.is_none() {
                        return self.login_failed(format!("Unsupported CHAP algorithm {}", value));
                    }
                    self.login.chap = ChapPhase::SendResponse;
                }
                "CHAP_I" => match value.parse::<u8>() {
                    Ok(id) => {
                        self.login.challenge.identifier = id;
                        self.login.chap = ChapPhase::SendResponse;
                    }
                    Err(_) => return self.login_failed(format!("Invalid CHAP_I value '{}'", value)),
                },
                "CHAP_C" => match parse_chap_hex(&value) {
                    Ok(challenge) => {
                        self.login.challenge.challenge = challenge;
                        self.login.chap = ChapPhase::SendResponse;
                    }
                    Err(e) => return self.login_failed(e.to_string()),
                },
                "CHAP_N" => target_chap_name = Some(value),
                "CHAP_R" => target_chap_response = Some(value),
                _ => {
                    if !self.params.apply_target_param(&key, &value) {
                        debug!("Ignoring login key {}={}", key, value);
                    }
                }
            }
        }

        if status == login_status::TARGET_MOVED_TEMPORARILY || status == login_status::TARGET_MOVED_PERMANENTLY {
            if let Some(address) = self.login.target_address.clone() {
                info!("Target requests redirect to {}", address);
                return Reply::Complete(CommandStatus::Redirect, CommandData::Redirect(address));
            }
        }

        if status != 0 {
            return self.login_failed(format!(
                "Failed to log in to target: {}",
                decode_login_status((status >> 8) as u8, status as u8)
            ));
        }

        if let Some(response) = target_chap_response {
            if let Err(msg) = self.verify_target_chap(target_chap_name.as_deref(), &response) {
                return self.login_failed(msg);
            }
        }

        let hdr_flags = inpdu.flags();
        let transit = hdr_flags & flags::TRANSIT != 0;
        if transit {
            let leaving = self.login.stage;
            self.login.stage = LoginStage::from_nsg(hdr_flags & flags::NSG_FULL_FEATURE);
            if leaving == LoginStage::SecurityNegotiation && self.mutual_chap_state.is_some() {
                return self.login_failed("Target did not answer the mutual CHAP challenge".to_string());
            }
        }

        if transit && hdr_flags & flags::NSG_FULL_FEATURE == flags::NSG_FULL_FEATURE {
            self.login.logged_in = true;
            self.login.attempts = 0;
            self.seq.set_login_window(inpdu.expcmdsn(), inpdu.maxcmdsn());
            // the login itt is never handed out again
            let _ = self.seq.next_itt(|_| false);
            self.header_digest = self.login.negotiated_digest;
            self.corked = false;
            info!(
                "Logged in to {} as {} ({:?} header digest)",
                self.target_name.as_deref().unwrap_or("discovery session"),
                self.initiator_name,
                self.header_digest
            );
            return Reply::Complete(CommandStatus::Good, CommandData::None);
        }

        match self.build_login_pdu() {
            Ok(mut next) => {
                next.callback = pdu.callback.take();
                self.queue_or_fail(next);
                Reply::Consumed
            }
            Err(e) => self.login_failed(format!("Failed to send continuation login pdu: {}", e)),
        }
    }

    fn verify_target_chap(&mut self, name: Option<&str>, response: &str) -> Result<(), String> {
        let state = self
            .mutual_chap_state
            .take()
            .ok_or_else(|| "Target sent CHAP_R without being challenged".to_string())?;
        let expected = self
            .target_chap
            .as_ref()
            .ok_or_else(|| "Target sent CHAP_R but no target credentials are set".to_string())?;
        if name != Some(expected.username.as_str()) {
            return Err(format!(
                "Target CHAP name '{}' does not match '{}'",
                name.unwrap_or(""),
                expected.username
            ));
        }
        if !state.verify(response, &expected.secret).map_err(|e| e.to_string())? {
            return Err("Target failed mutual CHAP authentication".to_string());
        }
        debug!("Target passed mutual CHAP authentication");
        Ok(())
    }

    fn login_failed(&mut self, msg: String) -> Reply {
        warn!("{}", msg);
        self.set_error(msg.clone());
        Reply::Complete(CommandStatus::Error, CommandData::Message(msg))
    }

    /// Close the session. The context corks once the request is on the wire.
    pub fn logout_async(&mut self, cb: CommandCallback) -> IscsiResult<()> {
        self.login.attempts = 0;
        if !self.login.logged_in {
            let msg = "Trying to logout while not logged in".to_string();
            self.set_error(msg.clone());
            return Err(IscsiError::Session(msg));
        }

        let itt = self.next_itt();
        let mut pdu = Pdu::new(
            opcode::LOGOUT_REQUEST,
            opcode::LOGOUT_RESPONSE,
            itt,
            pdu_flags::CORK_WHEN_SENT | pdu_flags::DROP_ON_RECONNECT,
        );
        pdu.set_immediate();
        pdu.set_pdu_flags(LOGOUT_CLOSE_SESSION);
        pdu.set_callback(cb);
        self.queue(pdu)
    }

    pub(crate) fn process_logout_reply(&mut self, inpdu: &InPdu) -> Reply {
        let response = inpdu.byte(2);
        if response != 0 {
            debug!("Logout response code {}", response);
        }
        self.login.logged_in = false;
        info!("Logged out of {}", self.target_name.as_deref().unwrap_or("discovery session"));
        Reply::Complete(CommandStatus::Good, CommandData::None)
    }
}

/// Operational keys we always offer (RFC 3720 Section 12)
fn add_operational_keys(pdu: &mut Pdu) -> IscsiResult<()> {
    const KEYS: &[(&str, &str)] = &[
        ("DataDigest", "None"),
        ("InitialR2T", "Yes"),
        ("ImmediateData", "Yes"),
        ("MaxBurstLength", "262144"),
        ("FirstBurstLength", "262144"),
        ("DefaultTime2Wait", "2"),
        ("DefaultTime2Retain", "0"),
        ("MaxOutstandingR2T", "1"),
        ("ErrorRecoveryLevel", "0"),
        ("IFMarker", "No"),
        ("OFMarker", "No"),
        ("MaxConnections", "1"),
        ("MaxRecvDataSegmentLength", "262144"),
        ("DataPDUInOrder", "Yes"),
        ("DataSequenceInOrder", "Yes"),
    ];
    for (key, value) in KEYS {
        pdu.add_text(key, value)?;
    }
    Ok(())
}
