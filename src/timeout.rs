//! Per-PDU timeouts
//!
//! Runs at the start of every [`IscsiContext::service`] call. Expired PDUs are
//! resolved with [`CommandStatus::Timeout`]; the connection itself is left
//! alone.

use crate::context::{CommandStatus, IscsiContext};
use crate::pdu::{opcode, opcode_name, Pdu};
use log::warn;
use std::collections::HashSet;
use std::time::Instant;

fn expired(pdu: &Pdu, now: Instant) -> bool {
    pdu.deadline.map_or(false, |deadline| deadline <= now)
}

impl IscsiContext {
    /// Resolve every PDU whose deadline has passed.
    ///
    /// A PDU with no timeout has no deadline and is never selected. The PDU
    /// currently being written is only considered before its first byte goes
    /// out.
    pub(crate) fn scan_timeouts(&mut self, now: Instant) {
        let mut timed_out = self.remove_queued(&|pdu| expired(pdu, now));
        if let Some(pdu) = self.take_current(&|pdu| pdu.bytes_written() == 0 && expired(pdu, now)) {
            timed_out.push(pdu);
        }
        if timed_out.is_empty() {
            return;
        }

        // Data-Out bursts of an expired command go with it
        let dead_tasks: HashSet<u32> = timed_out
            .iter()
            .filter(|pdu| pdu.opcode() == opcode::SCSI_COMMAND)
            .map(|pdu| pdu.itt())
            .collect();
        if !dead_tasks.is_empty() {
            let orphans =
                self.remove_queued(&|pdu| pdu.opcode() == opcode::SCSI_DATA_OUT && dead_tasks.contains(&pdu.itt()));
            drop(orphans);
        }

        for pdu in &timed_out {
            warn!(
                "{} itt=0x{:08x} cmdsn={} timed out",
                opcode_name(pdu.opcode()),
                pdu.itt(),
                pdu.cmdsn()
            );
        }
        self.set_error(format!("{} PDU(s) timed out", timed_out.len()));
        self.resolve_all(timed_out, CommandStatus::Timeout, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CommandCallback;
    use crate::pdu::flags;
    use crate::testing::logged_in_context;
    use crate::transport::Readiness;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn nop(ctx: &mut IscsiContext, timeout: Duration, seen: &Arc<Mutex<Vec<CommandStatus>>>) {
        let itt = ctx.next_itt();
        let mut pdu = Pdu::new(opcode::NOP_OUT, opcode::NOP_IN, itt, 0);
        pdu.set_immediate();
        pdu.set_pdu_flags(flags::FINAL);
        pdu.set_timeout(timeout);
        let seen = seen.clone();
        let cb: CommandCallback = Box::new(move |_ctx, status, _data| seen.lock().unwrap().push(status));
        pdu.set_callback(cb);
        ctx.queue(pdu).unwrap();
    }

    #[test]
    fn test_expired_pdu_times_out() {
        let (mut ctx, _peer) = logged_in_context();
        let seen = Arc::new(Mutex::new(Vec::new()));
        nop(&mut ctx, Duration::from_millis(10), &seen);
        ctx.service(Readiness::WRITABLE).unwrap();
        assert_eq!(ctx.awaiting_len(), 1);

        ctx.scan_timeouts(Instant::now() + Duration::from_secs(1));
        assert_eq!(*seen.lock().unwrap(), vec![CommandStatus::Timeout]);
        assert_eq!(ctx.awaiting_len(), 0);
        assert!(ctx.is_connected());
    }

    #[test]
    fn test_zero_timeout_never_expires() {
        let (mut ctx, _peer) = logged_in_context();
        let seen = Arc::new(Mutex::new(Vec::new()));
        nop(&mut ctx, Duration::ZERO, &seen);
        ctx.scan_timeouts(Instant::now() + Duration::from_secs(365 * 24 * 3600));
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(ctx.outbound_len(), 1);
    }

    #[test]
    fn test_pending_pdu_times_out() {
        let (mut ctx, _peer) = logged_in_context();
        let seen = Arc::new(Mutex::new(Vec::new()));
        nop(&mut ctx, Duration::from_millis(5), &seen);
        ctx.scan_timeouts(Instant::now() + Duration::from_secs(1));
        assert_eq!(*seen.lock().unwrap(), vec![CommandStatus::Timeout]);
        assert_eq!(ctx.outbound_len(), 0);
    }

    #[test]
    fn test_started_write_is_not_timed_out() {
        let (mut ctx, peer) = logged_in_context();
        peer.set_write_limit(Some(4));
        let seen = Arc::new(Mutex::new(Vec::new()));
        nop(&mut ctx, Duration::from_millis(5), &seen);
        ctx.service(Readiness::WRITABLE).unwrap();
        assert!(ctx.current.is_some());

        ctx.scan_timeouts(Instant::now() + Duration::from_secs(1));
        assert!(seen.lock().unwrap().is_empty());
    }
}
