//! Connection setup: connect, connect-plus-login, redirects
//!
//! `full_connect_async` chains the steps through callbacks:
//!
//! ```text
//! connect ──> login ──Redirect──> disconnect, connect to TargetAddress ──> login
//!               │
//!               └──Good──> TEST UNIT READY (repeated while UNIT ATTENTION) ──> caller
//! ```

use crate::context::{CommandCallback, CommandData, CommandStatus, IscsiContext};
use crate::error::IscsiResult;
use crate::scsi::{asc, sense_key, ScsiCommand};
use crate::session::SessionType;
use log::{debug, info, warn};
use std::sync::{Arc, Mutex};

/// Unit attentions absorbed before a full connect gives up
const MAX_UNIT_ATTENTIONS: u32 = 10;

/// The caller's callback, shared between the next step's callback and the
/// error path of the call that queues that step
#[derive(Clone)]
struct Handoff(Arc<Mutex<Option<CommandCallback>>>);

impl Handoff {
    fn new(cb: CommandCallback) -> Self {
        Handoff(Arc::new(Mutex::new(Some(cb))))
    }

    fn take(&self) -> Option<CommandCallback> {
        self.0.lock().ok().and_then(|mut slot| slot.take())
    }

    /// Report a step that could not be queued
    fn fail(&self, ctx: &mut IscsiContext, msg: String) {
        warn!("{}", msg);
        if let Some(cb) = self.take() {
            ctx.set_error(msg.clone());
            cb(ctx, CommandStatus::Error, CommandData::Message(msg));
        }
    }
}

impl IscsiContext {
    /// Start connecting to `portal` (`host[:port][,tpgt]`).
    ///
    /// The callback fires from [`service`](Self::service) once the socket is
    /// writable, with `Good` or `Error`.
    pub fn connect_async(&mut self, portal: &str, cb: CommandCallback) -> IscsiResult<()> {
        self.start_connect(portal, cb)
    }

    /// Connect, log in and make sure `lun` answers TEST UNIT READY.
    ///
    /// Login redirects are followed. `lun` is also the LUN used to absorb
    /// unit attentions after a reconnect.
    pub fn full_connect_async(&mut self, portal: &str, lun: u32, cb: CommandCallback) -> IscsiResult<()> {
        self.lun = lun;
        self.start_connect(
            portal,
            Box::new(move |ctx, status, data| ctx.full_connect_connected(status, data, cb)),
        )
    }

    fn full_connect_connected(&mut self, status: CommandStatus, data: CommandData, cb: CommandCallback) {
        if status != CommandStatus::Good {
            return cb(self, status, data);
        }
        let handoff = Handoff::new(cb);
        let next = handoff.clone();
        let login_cb: CommandCallback = Box::new(move |ctx, status, data| {
            if let Some(cb) = next.take() {
                ctx.full_connect_logged_in(status, data, cb);
            }
        });
        if let Err(e) = self.login_async(login_cb) {
            handoff.fail(self, format!("Login after connect failed: {}", e));
        }
    }

    fn full_connect_logged_in(&mut self, status: CommandStatus, data: CommandData, cb: CommandCallback) {
        match (status, data) {
            (CommandStatus::Good, _) => {}
            (CommandStatus::Redirect, CommandData::Redirect(address)) => {
                info!("Login redirected to {}", address);
                self.disconnect();
                let lun = self.lun;
                let handoff = Handoff::new(cb);
                let next = handoff.clone();
                let redirect_cb: CommandCallback = Box::new(move |ctx, status, data| {
                    if let Some(cb) = next.take() {
                        cb(ctx, status, data);
                    }
                });
                if let Err(e) = self.full_connect_async(&address, lun, redirect_cb) {
                    handoff.fail(self, format!("Connecting to redirected portal {} failed: {}", address, e));
                }
                return;
            }
            (status, data) => return cb(self, status, data),
        }

        if self.session_type != Some(SessionType::Normal) {
            return cb(self, CommandStatus::Good, CommandData::None);
        }
        self.full_connect_tur(0, cb);
    }

    fn full_connect_tur(&mut self, attentions: u32, cb: CommandCallback) {
        let lun = self.lun;
        let handoff = Handoff::new(cb);
        let next = handoff.clone();
        let tur_cb: CommandCallback = Box::new(move |ctx, status, data| {
            if let Some(cb) = next.take() {
                ctx.full_connect_tur_done(status, data, attentions, cb);
            }
        });
        if let Err(e) = self.scsi_command_async(lun, ScsiCommand::test_unit_ready(), tur_cb) {
            handoff.fail(self, format!("TEST UNIT READY after login could not be queued: {}", e));
        }
    }

    fn full_connect_tur_done(
        &mut self,
        status: CommandStatus,
        data: CommandData,
        attentions: u32,
        cb: CommandCallback,
    ) {
        if status != CommandStatus::CheckCondition {
            let data = match status {
                CommandStatus::Good => CommandData::None,
                _ => data,
            };
            return cb(self, status, data);
        }

        let sense = match &data {
            CommandData::Scsi(result) => result.sense.clone(),
            _ => None,
        };
        match sense {
            Some(sense) if sense.sense_key == sense_key::UNIT_ATTENTION && attentions < MAX_UNIT_ATTENTIONS => {
                debug!("Unit attention after login ({}), retrying TEST UNIT READY", sense);
                self.full_connect_tur(attentions + 1, cb);
            }
            Some(sense) if sense.sense_key == sense_key::NOT_READY && sense.asc == asc::MEDIUM_NOT_PRESENT => {
                debug!("No medium in LUN {}, connect still succeeds", self.lun);
                cb(self, CommandStatus::Good, CommandData::None)
            }
            Some(sense) => {
                let msg = format!("TEST UNIT READY failed: {}", sense);
                self.set_error(msg.clone());
                cb(self, CommandStatus::Error, CommandData::Message(msg))
            }
            None => cb(self, CommandStatus::Error, data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::{opcode, BHS_SIZE};
    use crate::scsi::{scsi_status, SenseData};
    use crate::testing::{fixed_sense, login_response, MockTransport};
    use crate::transport::Readiness;
    use byteorder::{BigEndian, ByteOrder};

    type Seen = Arc<Mutex<Vec<(CommandStatus, CommandData)>>>;

    fn capture() -> (Seen, CommandCallback) {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        (seen, Box::new(move |_ctx, status, data| seen2.lock().unwrap().push((status, data))))
    }

    fn context() -> (IscsiContext, crate::testing::Peer) {
        let (transport, peer) = MockTransport::new();
        let ctx = IscsiContext::builder("iqn.2024-01.test:initiator")
            .target_name("iqn.2024-01.test:target")
            .session_type(SessionType::Normal)
            .build_with_transport(Box::new(transport))
            .unwrap();
        (ctx, peer)
    }

    fn answer_login(ctx: &mut IscsiContext, peer: &crate::testing::Peer) {
        ctx.service(Readiness::WRITABLE).unwrap();
        let frame = peer.take_written_pdus().remove(0);
        let itt = BigEndian::read_u32(&frame[16..20]);
        let (hdr, data) = login_response(itt, 0x87, 0, 10, 1, 32, &[]);
        peer.push_pdu(&hdr, &data);
        ctx.service(Readiness::READABLE).unwrap();
    }

    fn answer_tur(ctx: &mut IscsiContext, peer: &crate::testing::Peer, sense: Option<SenseData>) {
        ctx.service(Readiness::WRITABLE).unwrap();
        let frame = peer.take_written_pdus().remove(0);
        assert_eq!(frame[0] & 0x3f, opcode::SCSI_COMMAND);
        let mut hdr = [0u8; BHS_SIZE];
        hdr[0] = opcode::SCSI_RESPONSE;
        hdr[1] = 0x80;
        BigEndian::write_u32(&mut hdr[16..20], BigEndian::read_u32(&frame[16..20]));
        BigEndian::write_u32(&mut hdr[24..28], ctx.sequence().statsn.wrapping_add(1));
        BigEndian::write_u32(&mut hdr[28..32], ctx.sequence().expcmdsn);
        BigEndian::write_u32(&mut hdr[32..36], ctx.sequence().maxcmdsn);
        let mut data = Vec::new();
        if let Some(sense) = sense {
            hdr[3] = scsi_status::CHECK_CONDITION;
            let bytes = fixed_sense(sense.sense_key, sense.asc, sense.ascq);
            data.extend_from_slice(&[0, bytes.len() as u8]);
            data.extend_from_slice(&bytes);
        }
        peer.push_pdu(&hdr, &data);
        ctx.service(Readiness::READABLE).unwrap();
    }

    #[test]
    fn test_connect_callback_fires_from_service() {
        let (mut ctx, peer) = context();
        let (seen, cb) = capture();
        ctx.connect_async("10.0.0.1:3260", cb).unwrap();
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(ctx.which_events(), crate::transport::Interest::WRITE);

        ctx.service(Readiness::WRITABLE).unwrap();
        assert_eq!(seen.lock().unwrap()[0].0, CommandStatus::Good);
        assert!(ctx.is_connected());
        assert_eq!(peer.connected_to(), vec!["10.0.0.1:3260".to_string()]);
    }

    #[test]
    fn test_full_connect_absorbs_unit_attention() {
        let (mut ctx, peer) = context();
        let (seen, cb) = capture();
        ctx.full_connect_async("10.0.0.1", 1, cb).unwrap();
        ctx.service(Readiness::WRITABLE).unwrap();
        answer_login(&mut ctx, &peer);
        assert!(ctx.is_logged_in());

        answer_tur(&mut ctx, &peer, Some(SenseData::new(sense_key::UNIT_ATTENTION, asc::POWER_ON_RESET, 0)));
        assert!(seen.lock().unwrap().is_empty());
        answer_tur(&mut ctx, &peer, None);
        assert_eq!(*seen.lock().unwrap(), vec![(CommandStatus::Good, CommandData::None)]);
    }

    #[test]
    fn test_full_connect_tolerates_missing_medium() {
        let (mut ctx, peer) = context();
        let (seen, cb) = capture();
        ctx.full_connect_async("10.0.0.1", 0, cb).unwrap();
        ctx.service(Readiness::WRITABLE).unwrap();
        answer_login(&mut ctx, &peer);
        answer_tur(&mut ctx, &peer, Some(SenseData::new(sense_key::NOT_READY, asc::MEDIUM_NOT_PRESENT, 0)));
        assert_eq!(seen.lock().unwrap()[0].0, CommandStatus::Good);
    }

    #[test]
    fn test_full_connect_follows_redirect() {
        let (mut ctx, peer) = context();
        let (seen, cb) = capture();
        ctx.full_connect_async("10.0.0.1", 0, cb).unwrap();
        ctx.service(Readiness::WRITABLE).unwrap();
        ctx.service(Readiness::WRITABLE).unwrap();
        let frame = peer.take_written_pdus().remove(0);
        let itt = BigEndian::read_u32(&frame[16..20]);
        let (hdr, data) = login_response(itt, 0x83, 0x0101, 0, 1, 1, &[("TargetAddress", "10.0.0.2:3260,1")]);
        peer.push_pdu(&hdr, &data);
        ctx.service(Readiness::READABLE).unwrap();

        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(ctx.portal(), Some("10.0.0.2:3260,1"));
        ctx.service(Readiness::WRITABLE).unwrap();
        answer_login(&mut ctx, &peer);
        answer_tur(&mut ctx, &peer, None);

        assert_eq!(seen.lock().unwrap()[0].0, CommandStatus::Good);
        assert_eq!(
            peer.connected_to(),
            vec!["10.0.0.1".to_string(), "10.0.0.2:3260,1".to_string()]
        );
    }

    #[test]
    fn test_full_connect_reports_login_failure() {
        let (mut ctx, peer) = context();
        let (seen, cb) = capture();
        ctx.full_connect_async("10.0.0.1", 0, cb).unwrap();
        ctx.service(Readiness::WRITABLE).unwrap();
        ctx.service(Readiness::WRITABLE).unwrap();
        let frame = peer.take_written_pdus().remove(0);
        let itt = BigEndian::read_u32(&frame[16..20]);
        let (hdr, data) = login_response(itt, 0x83, 0x0201, 0, 1, 1, &[]);
        peer.push_pdu(&hdr, &data);
        ctx.service(Readiness::READABLE).unwrap();
        assert_eq!(seen.lock().unwrap()[0].0, CommandStatus::Error);
    }
}
