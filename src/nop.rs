//! NOP-Out pings and replies to target pings

use crate::context::{CommandCallback, CommandData, CommandStatus, IscsiContext, Reply};
use crate::error::{IscsiError, IscsiResult};
use crate::pdu::{flags, opcode, pdu_flags, InPdu, Pdu, NO_PDU, RESERVED_TAG};
use log::{debug, warn};

impl IscsiContext {
    /// Ping the target. The callback receives [`CommandData::NopIn`] with
    /// whatever data the target echoed back.
    pub fn nop_out_async(&mut self, data: Option<&[u8]>, cb: CommandCallback) -> IscsiResult<()> {
        if !self.login.logged_in {
            let msg = "trying to send nop-out while not logged in".to_string();
            self.set_error(msg.clone());
            return Err(IscsiError::Session(msg));
        }

        let itt = self.next_itt();
        let mut pdu = Pdu::new(opcode::NOP_OUT, opcode::NOP_IN, itt, pdu_flags::DROP_ON_RECONNECT);
        pdu.set_immediate();
        pdu.set_pdu_flags(flags::FINAL);
        pdu.set_ttt(RESERVED_TAG);
        if let Some(data) = data.filter(|d| !d.is_empty()) {
            pdu.add_data(data)?;
        }
        pdu.set_callback(cb);
        self.queue(pdu)?;
        self.nops_in_flight += 1;
        Ok(())
    }

    pub(crate) fn process_nop_out_reply(&mut self, inpdu: &InPdu) -> Reply {
        Reply::Complete(CommandStatus::Good, CommandData::NopIn(inpdu.data().to_vec()))
    }

    /// NOP-In the target sent on its own. A ttt other than 0xffffffff asks
    /// for a NOP-Out echoing it.
    pub(crate) fn process_target_nop_in(&mut self, inpdu: &InPdu) {
        if !self.seq.advance_statsn(inpdu.statsn()) {
            warn!(
                "Target NOP-In with StatSN {} behind {}",
                inpdu.statsn(),
                self.seq.statsn
            );
        }

        let ttt = inpdu.ttt();
        if ttt == RESERVED_TAG {
            return;
        }
        debug!("Answering target NOP-In ttt=0x{:08x}", ttt);

        let mut pdu = Pdu::new(
            opcode::NOP_OUT,
            NO_PDU,
            RESERVED_TAG,
            pdu_flags::DELETE_WHEN_SENT | pdu_flags::NO_CALLBACK | pdu_flags::DROP_ON_RECONNECT,
        );
        pdu.set_immediate();
        pdu.set_pdu_flags(flags::FINAL);
        pdu.set_raw_lun(&inpdu.header()[8..16]);
        pdu.set_ttt(ttt);
        if !inpdu.data().is_empty() {
            if let Err(e) = pdu.add_data(inpdu.data()) {
                warn!("Failed to echo NOP-In data: {}", e);
                return;
            }
        }
        self.queue_or_fail(pdu);
    }
}
