//! SendTargets discovery over a discovery session

use crate::context::{CommandCallback, CommandData, CommandStatus, IscsiContext, Reply};
use crate::error::{IscsiError, IscsiResult};
use crate::pdu::{flags, opcode, parse_text_records, InPdu, Pdu, RESERVED_TAG};
use crate::session::SessionType;
use log::{debug, warn};

/// One portal a discovered target can be reached on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryPortal {
    /// `host:port,tpgt` as reported by the target
    pub portal: String,
}

/// A target returned by SendTargets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryAddress {
    pub target_name: String,
    pub portals: Vec<DiscoveryPortal>,
}

/// Build the target list from SendTargets records.
///
/// Each new target and each portal is placed in front of the ones seen
/// before it.
pub fn parse_send_targets(data: &[u8]) -> IscsiResult<Vec<DiscoveryAddress>> {
    let mut targets: Vec<DiscoveryAddress> = Vec::new();

    for (key, value) in parse_text_records(data)? {
        match key.as_str() {
            "TargetName" => targets.push(DiscoveryAddress {
                target_name: value,
                portals: Vec::new(),
            }),
            "TargetAddress" => match targets.last_mut() {
                Some(target) => target.portals.push(DiscoveryPortal { portal: value }),
                None => {
                    return Err(IscsiError::Protocol(format!(
                        "TargetAddress={} without a preceding TargetName",
                        value
                    )))
                }
            },
            _ => {
                return Err(IscsiError::Protocol(format!(
                    "Don't know how to handle discovery string: {}={}",
                    key, value
                )))
            }
        }
    }

    targets.reverse();
    for target in &mut targets {
        target.portals.reverse();
    }
    Ok(targets)
}

impl IscsiContext {
    /// Ask the target for `SendTargets=All`.
    ///
    /// Only valid on a logged-in discovery session. The callback receives
    /// [`CommandData::Discovery`].
    pub fn discovery_async(&mut self, cb: CommandCallback) -> IscsiResult<()> {
        if self.session_type != Some(SessionType::Discovery) {
            let msg = "Trying to do discovery on non-discovery session.".to_string();
            self.set_error(msg.clone());
            return Err(IscsiError::Session(msg));
        }
        if !self.login.logged_in {
            let msg = "Trying to do discovery while not logged in.".to_string();
            self.set_error(msg.clone());
            return Err(IscsiError::Session(msg));
        }

        let itt = self.next_itt();
        let mut pdu = Pdu::new(opcode::TEXT_REQUEST, opcode::TEXT_RESPONSE, itt, 0);
        pdu.set_immediate();
        pdu.set_pdu_flags(flags::FINAL);
        pdu.set_ttt(RESERVED_TAG);
        pdu.add_text("SendTargets", "All")?;
        pdu.set_callback(cb);
        self.queue(pdu)
    }

    pub(crate) fn process_text_reply(&mut self, inpdu: &InPdu) -> Reply {
        if inpdu.flags() != flags::FINAL {
            let msg = format!("unsupported flags in text reply {:02x}", inpdu.flags());
            warn!("{}", msg);
            self.set_error(msg.clone());
            return Reply::Complete(CommandStatus::Error, CommandData::Message(msg));
        }

        match parse_send_targets(inpdu.data()) {
            Ok(targets) => {
                debug!("Discovery returned {} target(s)", targets.len());
                Reply::Complete(CommandStatus::Good, CommandData::Discovery(targets))
            }
            Err(e) => {
                let msg = e.to_string();
                warn!("Discovery reply rejected: {}", msg);
                self.set_error(msg.clone());
                Reply::Complete(CommandStatus::Error, CommandData::Message(msg))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::BHS_SIZE;
    use crate::testing::{connected_context, logged_in_context, text_keys};
    use crate::transport::Readiness;
    use byteorder::{BigEndian, ByteOrder};
    use std::sync::{Arc, Mutex};

    type Seen = Arc<Mutex<Vec<(CommandStatus, CommandData)>>>;

    fn capture() -> (Seen, CommandCallback) {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        (seen, Box::new(move |_ctx, status, data| seen2.lock().unwrap().push((status, data))))
    }

    fn discovery_context() -> (IscsiContext, crate::testing::Peer) {
        let (mut ctx, peer) = logged_in_context();
        ctx.session_type = Some(SessionType::Discovery);
        (ctx, peer)
    }

    fn text_response(ctx: &IscsiContext, itt: u32, hdr_flags: u8) -> [u8; BHS_SIZE] {
        let mut hdr = [0u8; BHS_SIZE];
        hdr[0] = opcode::TEXT_RESPONSE;
        hdr[1] = hdr_flags;
        BigEndian::write_u32(&mut hdr[16..20], itt);
        BigEndian::write_u32(&mut hdr[20..24], RESERVED_TAG);
        BigEndian::write_u32(&mut hdr[24..28], ctx.sequence().statsn.wrapping_add(1));
        BigEndian::write_u32(&mut hdr[28..32], ctx.sequence().expcmdsn);
        BigEndian::write_u32(&mut hdr[32..36], ctx.sequence().maxcmdsn);
        hdr
    }

    fn send_discovery(ctx: &mut IscsiContext, peer: &crate::testing::Peer, cb: CommandCallback) -> u32 {
        ctx.discovery_async(cb).unwrap();
        ctx.service(Readiness::WRITABLE).unwrap();
        let frame = peer.take_written_pdus().remove(0);
        BigEndian::read_u32(&frame[16..20])
    }

    #[test]
    fn test_parse_single_target() {
        let targets = parse_send_targets(b"TargetName=iqn.test\0TargetAddress=10.0.0.1:3260\0\0").unwrap();
        assert_eq!(
            targets,
            vec![DiscoveryAddress {
                target_name: "iqn.test".to_string(),
                portals: vec![DiscoveryPortal {
                    portal: "10.0.0.1:3260".to_string()
                }],
            }]
        );
    }

    #[test]
    fn test_parse_prepends_targets_and_portals() {
        let data = b"TargetName=iqn.a\0TargetAddress=10.0.0.1:3260,1\0TargetAddress=10.0.0.2:3260,1\0\
TargetName=iqn.b\0TargetAddress=10.0.0.3:3260,2\0";
        let targets = parse_send_targets(data).unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].target_name, "iqn.b");
        assert_eq!(targets[1].target_name, "iqn.a");
        assert_eq!(targets[1].portals[0].portal, "10.0.0.2:3260,1");
        assert_eq!(targets[1].portals[1].portal, "10.0.0.1:3260,1");
    }

    #[test]
    fn test_parse_address_without_name() {
        assert!(parse_send_targets(b"TargetAddress=10.0.0.1:3260\0").is_err());
    }

    #[test]
    fn test_parse_unknown_key() {
        assert!(parse_send_targets(b"TargetName=iqn.a\0TargetAlias=disk\0").is_err());
    }

    #[test]
    fn test_parse_missing_nul() {
        assert!(parse_send_targets(b"TargetName=iqn.test\0TargetAddress=10.0.0.1:3260").is_err());
    }

    #[test]
    fn test_discovery_requires_discovery_session() {
        let (mut ctx, _peer) = logged_in_context();
        let (seen, cb) = capture();
        assert!(ctx.discovery_async(cb).is_err());
        assert!(seen.lock().unwrap().is_empty());

        let (mut ctx, _peer) = connected_context(SessionType::Discovery);
        let (_seen, cb) = capture();
        assert!(ctx.discovery_async(cb).is_err());
        assert_eq!(ctx.outbound_len(), 0);
    }

    #[test]
    fn test_discovery_request_format() {
        let (mut ctx, peer) = discovery_context();
        let start = ctx.sequence().cmdsn;
        let (_seen, cb) = capture();
        ctx.discovery_async(cb).unwrap();
        ctx.service(Readiness::WRITABLE).unwrap();

        let frame = peer.take_written_pdus().remove(0);
        assert_eq!(frame[0], opcode::TEXT_REQUEST | 0x40);
        assert_eq!(frame[1], flags::FINAL);
        assert_eq!(BigEndian::read_u32(&frame[20..24]), RESERVED_TAG);
        assert_eq!(
            text_keys(&frame[BHS_SIZE..]),
            vec![("SendTargets".to_string(), "All".to_string())]
        );
        assert_eq!(ctx.sequence().cmdsn, start);
    }

    #[test]
    fn test_discovery_reply_delivers_targets() {
        let (mut ctx, peer) = discovery_context();
        let (seen, cb) = capture();
        let itt = send_discovery(&mut ctx, &peer, cb);

        let hdr = text_response(&ctx, itt, flags::FINAL);
        peer.push_pdu(&hdr, b"TargetName=iqn.test\0TargetAddress=10.0.0.1:3260\0");
        ctx.service(Readiness::READABLE).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].0, CommandStatus::Good);
        match &seen[0].1 {
            CommandData::Discovery(targets) => {
                assert_eq!(targets.len(), 1);
                assert_eq!(targets[0].target_name, "iqn.test");
            }
            other => panic!("unexpected data {:?}", other),
        }
    }

    #[test]
    fn test_discovery_reply_without_final() {
        let (mut ctx, peer) = discovery_context();
        let (seen, cb) = capture();
        let itt = send_discovery(&mut ctx, &peer, cb);

        let hdr = text_response(&ctx, itt, flags::CONTINUE);
        peer.push_pdu(&hdr, b"TargetName=iqn.test\0");
        ctx.service(Readiness::READABLE).unwrap();

        assert_eq!(seen.lock().unwrap()[0].0, CommandStatus::Error);
        assert!(ctx.is_connected());
    }
}
