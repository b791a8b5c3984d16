//! Session re-establishment after a lost connection
//!
//! When a logged-in connection fails, PDUs marked drop-on-reconnect are
//! cancelled and everything else is parked in a backlog in its original
//! queue order. Attempts run from [`IscsiContext::service`]: connect, log in,
//! optionally absorb the unit attention with a TEST UNIT READY, then requeue
//! the backlog with fresh task tags and command numbers.

use crate::context::{CommandCallback, CommandData, CommandStatus, ConnState, IscsiContext};
use crate::error::{IscsiError, IscsiResult};
use crate::pdu::{opcode, pdu_flags, Pdu};
use crate::scsi::ScsiCommand;
use crate::session::SessionType;
use log::{debug, error, info, warn};
use std::time::{Duration, Instant};

/// How a context reacts to a lost connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Reconnect automatically when a logged-in connection fails
    pub auto_reconnect: bool,
    /// Failed attempts before outstanding operations get `Fatal`
    pub max_retries: u32,
    /// Delay before the first attempt, doubled after each failure
    pub backoff: Duration,
    /// Upper bound for the delay between attempts
    pub max_backoff: Duration,
    /// Absorb the unit attention a target reports after a new login
    pub suppress_unit_attention: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            auto_reconnect: true,
            max_retries: 10,
            backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            suppress_unit_attention: true,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before attempt number `retries + 1`
    pub fn delay_for(&self, retries: u32) -> Duration {
        let factor = 1u32 << retries.min(16);
        self.backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

#[derive(Default)]
pub(crate) struct ReconnectState {
    /// Session is being re-established
    pub(crate) active: bool,
    /// Connection was lost with auto reconnect off
    pub(crate) deferred: bool,
    /// A connect/login/TUR sequence is running
    pub(crate) attempt_in_flight: bool,
    pub(crate) retries: u32,
    pub(crate) next_attempt: Option<Instant>,
    pub(crate) backlog: Vec<Pdu>,
    /// Caller of `reconnect_async`
    pub(crate) waiter: Option<CommandCallback>,
}

impl IscsiContext {
    /// Whether the session is currently being re-established
    pub fn is_reconnecting(&self) -> bool {
        self.reconnect.active
    }

    /// Whether a lost connection is waiting for `reconnect()` or for auto
    /// reconnect to be turned back on
    pub fn is_reconnect_deferred(&self) -> bool {
        self.reconnect.deferred
    }

    pub fn reconnect_policy(&self) -> &ReconnectPolicy {
        &self.reconnect_policy
    }

    /// Turn automatic reconnect on or off. Turning it on while a reconnect is
    /// deferred starts that reconnect.
    pub fn set_auto_reconnect(&mut self, enabled: bool) -> IscsiResult<()> {
        self.reconnect_policy.auto_reconnect = enabled;
        if enabled && self.reconnect.deferred {
            info!("Auto reconnect enabled, starting deferred reconnect");
            return self.start_reconnect(None);
        }
        Ok(())
    }

    /// Re-establish the session now, dropping the current connection if any
    pub fn reconnect(&mut self) -> IscsiResult<()> {
        self.start_reconnect(None)
    }

    /// Like [`reconnect`](Self::reconnect), with `cb` fired with `Good` once
    /// logged in again or `Fatal` when the retries run out
    pub fn reconnect_async(&mut self, cb: CommandCallback) -> IscsiResult<()> {
        self.start_reconnect(Some(cb))
    }

    fn start_reconnect(&mut self, cb: Option<CommandCallback>) -> IscsiResult<()> {
        if self.reconnect.attempt_in_flight || self.reconnect.waiter.is_some() {
            return Err(IscsiError::Session("reconnect already in progress".to_string()));
        }
        let portal = self
            .portal
            .clone()
            .ok_or_else(|| IscsiError::Config("no portal to reconnect to".to_string()))?;

        if self.conn != ConnState::Disconnected {
            self.close_transport();
        }
        self.reconnect.deferred = false;
        if !self.reconnect.active {
            self.reconnect.active = true;
            self.park_for_reconnect();
        }
        self.reconnect.retries = 0;
        self.reconnect.waiter = cb;
        debug!("Reconnecting to {}", portal);
        self.reconnect_attempt();
        Ok(())
    }

    /// Connection lost while logged in with auto reconnect on
    pub(crate) fn begin_reconnect(&mut self, reason: &str) {
        let retrying = self.reconnect.attempt_in_flight;
        self.reconnect.active = true;
        self.park_for_reconnect();

        if retrying {
            self.reconnect_attempt_failed(reason);
            return;
        }
        self.reconnect.retries = 0;
        let delay = self.reconnect_policy.delay_for(0);
        self.reconnect.next_attempt = Some(Instant::now() + delay);
        warn!(
            "Lost connection to {} ({}), reconnecting in {:?} with {} PDUs held",
            self.portal.as_deref().unwrap_or("target"),
            reason,
            delay,
            self.reconnect.backlog.len()
        );
    }

    /// Cancel drop-on-reconnect PDUs and move everything else to the backlog
    fn park_for_reconnect(&mut self) {
        let mut pdus = self.remove_all();
        pdus.sort_by_key(|p| p.seq);

        let mut dropped = Vec::new();
        let mut kept = Vec::with_capacity(pdus.len());
        for mut pdu in pdus {
            if pdu.has_flag(pdu_flags::DROP_ON_RECONNECT)
                || pdu.has_flag(pdu_flags::RECOVERY)
                || pdu.opcode() == opcode::SCSI_DATA_OUT
                || pdu.opcode() == opcode::NOP_OUT
            {
                dropped.push(pdu);
            } else {
                pdu.reset_for_retransmit();
                kept.push(pdu);
            }
        }
        self.reconnect.backlog = kept;

        if !dropped.is_empty() {
            debug!("Cancelling {} PDUs that cannot be retransmitted", dropped.len());
        }
        self.resolve_all(dropped, CommandStatus::Cancelled, None);
    }

    /// Run a scheduled attempt once its time has come
    pub(crate) fn drive_reconnect(&mut self, now: Instant) {
        if !self.reconnect.active || self.reconnect.attempt_in_flight {
            return;
        }
        match self.reconnect.next_attempt {
            Some(when) if when <= now => self.reconnect_attempt(),
            _ => {}
        }
    }

    fn reconnect_attempt(&mut self) {
        self.reconnect.next_attempt = None;
        self.reconnect.attempt_in_flight = true;

        let portal = match self.portal.clone() {
            Some(portal) => portal,
            None => return self.reconnect_attempt_failed("no portal to reconnect to"),
        };
        info!(
            "Reconnect attempt {} to {}",
            self.reconnect.retries + 1,
            portal
        );
        let cb: CommandCallback = Box::new(|ctx, status, data| ctx.reconnect_connected(status, data));
        if let Err(e) = self.start_connect(&portal, cb) {
            self.reconnect_attempt_failed(&e.to_string());
        }
    }

    fn reconnect_connected(&mut self, status: CommandStatus, data: CommandData) {
        if !self.reconnect.attempt_in_flight || status == CommandStatus::Cancelled {
            return;
        }
        if status != CommandStatus::Good {
            return self.reconnect_attempt_failed(&describe(&data, "connect failed"));
        }
        let cb: CommandCallback = Box::new(|ctx, status, data| ctx.reconnect_logged_in(status, data));
        if let Err(e) = self.login_async(cb) {
            self.reconnect_attempt_failed(&e.to_string());
        }
    }

    fn reconnect_logged_in(&mut self, status: CommandStatus, data: CommandData) {
        if !self.reconnect.attempt_in_flight || status == CommandStatus::Cancelled {
            return;
        }
        match (status, data) {
            (CommandStatus::Good, _) => {}
            (CommandStatus::Redirect, CommandData::Redirect(address)) => {
                info!("Reconnect redirected to {}", address);
                self.close_transport();
                self.portal = Some(address);
                self.reconnect.attempt_in_flight = false;
                self.reconnect.next_attempt = Some(Instant::now());
                return;
            }
            (_, data) => return self.reconnect_attempt_failed(&describe(&data, "login failed")),
        }

        let wants_tur = self.reconnect_policy.suppress_unit_attention
            && self.session_type == Some(SessionType::Normal);
        if !wants_tur {
            return self.finish_reconnect();
        }

        let cb: CommandCallback = Box::new(|ctx, status, _data| {
            if !matches!(status, CommandStatus::Cancelled | CommandStatus::Fatal) {
                ctx.finish_reconnect();
            }
        });
        let lun = self.lun;
        if let Err(e) = self.queue_scsi(lun, ScsiCommand::test_unit_ready(), pdu_flags::RECOVERY | pdu_flags::DROP_ON_RECONNECT, cb) {
            warn!("Could not send TEST UNIT READY after reconnect: {}", e);
            self.finish_reconnect();
        }
    }

    /// Logged in again: release the backlog in its original order
    fn finish_reconnect(&mut self) {
        if !self.reconnect.attempt_in_flight {
            return;
        }
        self.reconnect.active = false;
        self.reconnect.attempt_in_flight = false;
        self.reconnect.deferred = false;
        self.reconnect.retries = 0;
        self.reconnect.next_attempt = None;

        let backlog = std::mem::take(&mut self.reconnect.backlog);
        info!(
            "Reconnected to {}, resubmitting {} PDUs",
            self.portal.as_deref().unwrap_or("target"),
            backlog.len()
        );
        for mut pdu in backlog {
            let itt = self.next_itt();
            pdu.set_itt(itt);
            pdu.reset_for_retransmit();
            self.queue_or_fail(pdu);
        }

        if let Some(cb) = self.reconnect.waiter.take() {
            cb(self, CommandStatus::Good, CommandData::None);
        }
    }

    /// One attempt failed; schedule the next or give up
    pub(crate) fn reconnect_attempt_failed(&mut self, reason: &str) {
        if !self.reconnect.attempt_in_flight {
            return;
        }
        self.reconnect.attempt_in_flight = false;
        if self.conn != ConnState::Disconnected {
            self.close_transport();
        }
        let leftovers = self.remove_connection_pdus();
        self.resolve_all(leftovers, CommandStatus::Cancelled, None);

        self.reconnect.retries += 1;
        if self.reconnect.retries >= self.reconnect_policy.max_retries {
            return self.reconnect_gave_up(reason);
        }

        let delay = self.reconnect_policy.delay_for(self.reconnect.retries);
        self.reconnect.next_attempt = Some(Instant::now() + delay);
        warn!(
            "Reconnect attempt {} failed: {}; retrying in {:?}",
            self.reconnect.retries, reason, delay
        );
    }

    fn reconnect_gave_up(&mut self, reason: &str) {
        let msg = format!(
            "Giving up reconnecting to {} after {} attempts: {}",
            self.portal.as_deref().unwrap_or("target"),
            self.reconnect.retries,
            reason
        );
        error!("{}", msg);
        self.set_error(msg.clone());
        self.reconnect.active = false;
        self.reconnect.next_attempt = None;

        let backlog = std::mem::take(&mut self.reconnect.backlog);
        self.resolve_all(backlog, CommandStatus::Fatal, Some(&msg));
        if let Some(cb) = self.reconnect.waiter.take() {
            cb(self, CommandStatus::Fatal, CommandData::Message(msg));
        }
    }
}

fn describe(data: &CommandData, fallback: &str) -> String {
    match data {
        CommandData::Message(msg) => msg.clone(),
        _ => fallback.to_string(),
    }
}
