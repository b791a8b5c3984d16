//! Task management functions (RFC 3720 Section 10.5)
//!
//! Resets and abort-task-set cancel every local SCSI task before the request
//! goes out, since the target discards those tasks anyway.

use crate::context::{CommandCallback, CommandData, CommandStatus, IscsiContext, Reply};
use crate::error::{IscsiError, IscsiResult};
use crate::pdu::{opcode, pdu_flags, InPdu, Pdu, RESERVED_TAG};
use crate::scsi::TaskRef;
use log::{debug, info};

/// Task management function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskMgmtFunction {
    AbortTask = 1,
    AbortTaskSet = 2,
    ClearAca = 3,
    ClearTaskSet = 4,
    LunReset = 5,
    TargetWarmReset = 6,
    TargetColdReset = 7,
    TaskReassign = 8,
}

/// Response codes carried in byte 2 of a Task Management Response
pub mod tmf_response {
    pub const FUNCTION_COMPLETE: u8 = 0;
    pub const TASK_DOES_NOT_EXIST: u8 = 1;
    pub const LUN_DOES_NOT_EXIST: u8 = 2;
    pub const TASK_STILL_ALLEGIANT: u8 = 3;
    pub const REASSIGNMENT_NOT_SUPPORTED: u8 = 4;
    pub const NOT_SUPPORTED: u8 = 5;
    pub const AUTHORIZATION_FAILED: u8 = 6;
    pub const FUNCTION_REJECTED: u8 = 255;
}

fn is_task_pdu(pdu: &Pdu) -> bool {
    pdu.opcode() == opcode::SCSI_COMMAND || pdu.opcode() == opcode::SCSI_DATA_OUT
}

impl IscsiContext {
    /// Send a task management request.
    ///
    /// `ritt` and `rcmdsn` identify the referenced task; pass
    /// `0xffffffff` and 0 for functions that do not name one.
    pub fn task_mgmt_async(
        &mut self,
        lun: u32,
        function: TaskMgmtFunction,
        ritt: u32,
        rcmdsn: u32,
        cb: CommandCallback,
    ) -> IscsiResult<()> {
        if !self.login.logged_in {
            let msg = "trying to send task-mgmt while not logged in".to_string();
            self.set_error(msg.clone());
            return Err(IscsiError::Session(msg));
        }

        let itt = self.next_itt();
        let mut pdu = Pdu::new(
            opcode::TASK_MANAGEMENT_REQUEST,
            opcode::TASK_MANAGEMENT_RESPONSE,
            itt,
            pdu_flags::DROP_ON_RECONNECT,
        );
        pdu.set_immediate();
        pdu.set_pdu_flags(0x80 | function as u8);
        pdu.set_lun(lun);
        pdu.set_ritt(ritt);
        pdu.set_rcmdsn(rcmdsn);
        pdu.set_callback(cb);
        debug!("Task management {:?} lun={} ritt=0x{:08x}", function, lun, ritt);
        self.queue(pdu)
    }

    pub fn abort_task_async(&mut self, task: &TaskRef, cb: CommandCallback) -> IscsiResult<()> {
        self.task_mgmt_async(task.lun, TaskMgmtFunction::AbortTask, task.itt, task.cmdsn, cb)
    }

    pub fn abort_task_set_async(&mut self, lun: u32, cb: CommandCallback) -> IscsiResult<()> {
        self.reset_with(lun, TaskMgmtFunction::AbortTaskSet, cb)
    }

    pub fn lun_reset_async(&mut self, lun: u32, cb: CommandCallback) -> IscsiResult<()> {
        self.reset_with(lun, TaskMgmtFunction::LunReset, cb)
    }

    pub fn target_warm_reset_async(&mut self, cb: CommandCallback) -> IscsiResult<()> {
        self.reset_with(0, TaskMgmtFunction::TargetWarmReset, cb)
    }

    pub fn target_cold_reset_async(&mut self, cb: CommandCallback) -> IscsiResult<()> {
        self.reset_with(0, TaskMgmtFunction::TargetColdReset, cb)
    }

    fn reset_with(&mut self, lun: u32, function: TaskMgmtFunction, cb: CommandCallback) -> IscsiResult<()> {
        if !self.login.logged_in {
            let msg = "trying to send task-mgmt while not logged in".to_string();
            self.set_error(msg.clone());
            return Err(IscsiError::Session(msg));
        }
        self.cancel_all_tasks();
        self.task_mgmt_async(lun, function, RESERVED_TAG, 0, cb)
    }

    /// Cancel every SCSI task this context knows about.
    ///
    /// Returns the number of commands whose callbacks fired.
    pub fn cancel_all_tasks(&mut self) -> usize {
        self.cancel_matching(&is_task_pdu)
    }

    /// Cancel one SCSI task and its Data-Out PDUs locally. Nothing is sent
    /// to the target.
    pub fn cancel_task(&mut self, itt: u32) -> IscsiResult<()> {
        if self.cancel_matching(&|pdu| is_task_pdu(pdu) && pdu.itt() == itt) == 0 {
            return Err(IscsiError::Session(format!("no task with itt 0x{:08x}", itt)));
        }
        Ok(())
    }

    fn cancel_matching(&mut self, pred: &dyn Fn(&Pdu) -> bool) -> usize {
        let mut pdus = self.remove_queued(pred);
        if let Some(pdu) = self.take_current(pred) {
            pdus.push(pdu);
        }
        let commands = pdus.iter().filter(|p| p.opcode() == opcode::SCSI_COMMAND).count();
        if commands > 0 {
            info!("Cancelling {} SCSI task(s)", commands);
        }
        self.resolve_all(pdus, CommandStatus::Cancelled, None);
        commands
    }

    pub(crate) fn process_task_mgmt_reply(&mut self, inpdu: &InPdu) -> Reply {
        let response = inpdu.byte(2);
        debug!("Task management response 0x{:02x}", response);
        Reply::Complete(CommandStatus::Good, CommandData::TaskMgmt(response))
    }
}
