//! Blocking wrappers around the async API
//!
//! Each wrapper queues the async operation with a callback that posts its
//! outcome on a channel, then runs the event loop itself until the outcome
//! arrives:
//!
//! ```no_run
//! use iscsi_initiator::{IscsiContext, SessionType};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut ctx = IscsiContext::builder("iqn.2024-01.com.example:initiator")
//!     .session_type(SessionType::Discovery)
//!     .build()?;
//! ctx.connect_sync("192.168.1.10:3260")?;
//! ctx.login_sync()?;
//! for target in ctx.discovery_sync()? {
//!     println!("{}", target.target_name);
//! }
//! ctx.logout_sync()?;
//! # Ok(())
//! # }
//! ```

use crate::context::{CommandCallback, CommandData, CommandStatus, IscsiContext};
use crate::discovery::DiscoveryAddress;
use crate::error::{IscsiError, IscsiResult};
use crate::scsi::{ScsiCommand, ScsiTaskResult, TaskRef};
use crate::task_mgmt::TaskMgmtFunction;
use log::debug;
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::time::Duration;

/// Longest a blocking call sleeps before running the timeout scanner again
const POLL_INTERVAL: Duration = Duration::from_millis(1000);

type Outcome = (CommandStatus, CommandData);

fn channel() -> (CommandCallback, Receiver<Outcome>) {
    let (tx, rx) = mpsc::channel();
    let cb: CommandCallback = Box::new(move |_ctx, status, data| {
        // receiver gone means the caller stopped waiting
        let _ = tx.send((status, data));
    });
    (cb, rx)
}

/// `Ok(data)` for `Good`, an error carrying the message otherwise
fn into_result((status, data): Outcome) -> IscsiResult<CommandData> {
    match status {
        CommandStatus::Good => Ok(data),
        status => {
            let message = match data {
                CommandData::Message(msg) => msg,
                CommandData::Redirect(address) => format!("redirected to {}", address),
                _ => format!("{:?}", status),
            };
            Err(IscsiError::Operation { status, message })
        }
    }
}

impl IscsiContext {
    /// Run the event loop until `rx` yields
    fn wait_for(&mut self, rx: Receiver<Outcome>) -> IscsiResult<Outcome> {
        loop {
            match rx.try_recv() {
                Ok(outcome) => return Ok(outcome),
                Err(TryRecvError::Disconnected) => {
                    return Err(IscsiError::Session("operation dropped without completing".to_string()))
                }
                Err(TryRecvError::Empty) => {}
            }

            let interest = self.which_events();
            let revents = self.wait_events(interest, POLL_INTERVAL)?;
            if let Err(e) = self.service(revents) {
                // the failure may already have resolved our operation
                return match rx.try_recv() {
                    Ok(outcome) => Ok(outcome),
                    Err(_) => Err(e),
                };
            }
        }
    }

    fn run_sync(&mut self, start: impl FnOnce(&mut Self, CommandCallback) -> IscsiResult<()>) -> IscsiResult<CommandData> {
        let (cb, rx) = channel();
        start(self, cb)?;
        let outcome = self.wait_for(rx)?;
        debug!("Blocking call finished with {:?}", outcome.0);
        into_result(outcome)
    }

    pub fn connect_sync(&mut self, portal: &str) -> IscsiResult<()> {
        self.run_sync(|ctx, cb| ctx.connect_async(portal, cb)).map(|_| ())
    }

    /// Connect, log in and wait for `lun` to become ready
    pub fn full_connect_sync(&mut self, portal: &str, lun: u32) -> IscsiResult<()> {
        self.run_sync(|ctx, cb| ctx.full_connect_async(portal, lun, cb)).map(|_| ())
    }

    pub fn login_sync(&mut self) -> IscsiResult<()> {
        self.run_sync(|ctx, cb| ctx.login_async(cb)).map(|_| ())
    }

    pub fn logout_sync(&mut self) -> IscsiResult<()> {
        self.run_sync(|ctx, cb| ctx.logout_async(cb)).map(|_| ())
    }

    pub fn discovery_sync(&mut self) -> IscsiResult<Vec<DiscoveryAddress>> {
        match self.run_sync(|ctx, cb| ctx.discovery_async(cb))? {
            CommandData::Discovery(targets) => Ok(targets),
            _ => Ok(Vec::new()),
        }
    }

    /// Ping the target and return the data it echoed
    pub fn nop_out_sync(&mut self, data: Option<&[u8]>) -> IscsiResult<Vec<u8>> {
        match self.run_sync(|ctx, cb| ctx.nop_out_async(data, cb))? {
            CommandData::NopIn(data) => Ok(data),
            _ => Ok(Vec::new()),
        }
    }

    /// Run a task management function and return the target's response code
    pub fn task_mgmt_sync(&mut self, lun: u32, function: TaskMgmtFunction, ritt: u32, rcmdsn: u32) -> IscsiResult<u8> {
        tmf_response(self.run_sync(|ctx, cb| ctx.task_mgmt_async(lun, function, ritt, rcmdsn, cb))?)
    }

    pub fn abort_task_sync(&mut self, task: &TaskRef) -> IscsiResult<u8> {
        tmf_response(self.run_sync(|ctx, cb| ctx.abort_task_async(task, cb))?)
    }

    pub fn abort_task_set_sync(&mut self, lun: u32) -> IscsiResult<u8> {
        tmf_response(self.run_sync(|ctx, cb| ctx.abort_task_set_async(lun, cb))?)
    }

    pub fn lun_reset_sync(&mut self, lun: u32) -> IscsiResult<u8> {
        tmf_response(self.run_sync(|ctx, cb| ctx.lun_reset_async(lun, cb))?)
    }

    pub fn target_warm_reset_sync(&mut self) -> IscsiResult<u8> {
        tmf_response(self.run_sync(|ctx, cb| ctx.target_warm_reset_async(cb))?)
    }

    pub fn target_cold_reset_sync(&mut self) -> IscsiResult<u8> {
        tmf_response(self.run_sync(|ctx, cb| ctx.target_cold_reset_async(cb))?)
    }

    /// Run a SCSI command to completion.
    ///
    /// CHECK CONDITION is returned as `Ok` so the caller can inspect the
    /// sense data.
    pub fn scsi_command_sync(&mut self, lun: u32, command: ScsiCommand) -> IscsiResult<ScsiTaskResult> {
        let (cb, rx) = channel();
        self.scsi_command_async(lun, command, cb)?;
        match self.wait_for(rx)? {
            (CommandStatus::Good, CommandData::Scsi(result))
            | (CommandStatus::CheckCondition, CommandData::Scsi(result)) => Ok(result),
            outcome => {
                let data = into_result(outcome)?;
                Err(IscsiError::Protocol(format!("unexpected SCSI completion {:?}", data)))
            }
        }
    }

    /// Re-establish the session and wait until it is usable again
    pub fn reconnect_sync(&mut self) -> IscsiResult<()> {
        self.run_sync(|ctx, cb| ctx.reconnect_async(cb)).map(|_| ())
    }
}

fn tmf_response(data: CommandData) -> IscsiResult<u8> {
    match data {
        CommandData::TaskMgmt(response) => Ok(response),
        other => Err(IscsiError::Protocol(format!("unexpected task management completion {:?}", other))),
    }
}
