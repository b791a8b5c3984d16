//! iSCSI session context
//!
//! One [`IscsiContext`] drives one connection to a target. It owns the four
//! PDU queues (outbound-pending, outbound-current, awaiting-response and
//! inbound-assembly), the sequence counters and the negotiated parameters,
//! and is driven entirely by the caller's event loop through
//! [`IscsiContext::which_events`] and [`IscsiContext::service`].

use crate::auth::{ChapCredentials, MutualChallenge};
use crate::discovery::DiscoveryAddress;
use crate::error::{IscsiError, IscsiResult};
use crate::login::LoginState;
use crate::pdu::{flags, opcode, opcode_name, pdu_flags, InPdu, Pdu, BHS_SIZE, DIGEST_SIZE, RESERVED_TAG};
use crate::reconnect::{ReconnectPolicy, ReconnectState};
use crate::scsi::ScsiTaskResult;
use crate::session::{DigestType, HeaderDigestPreference, SequenceState, SessionParams, SessionType};
use crate::transport::{Interest, Readiness, TcpOptions, TcpTransport, Transport};
use crate::url::IscsiUrl;
use byteorder::{BigEndian, ByteOrder};
use log::{debug, info, warn};
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

/// Final status handed to a command callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    /// Operation completed successfully
    Good,
    /// SCSI command finished with CHECK CONDITION; sense is in the result
    CheckCondition,
    /// Operation failed; detail in [`CommandData::Message`] when available
    Error,
    /// Operation was cancelled locally (task management, reconnect, destroy)
    Cancelled,
    /// Operation exceeded its per-PDU timeout
    Timeout,
    /// Login was redirected to another portal
    Redirect,
    /// Session could not be re-established
    Fatal,
}

/// Result payload handed to a command callback
#[derive(Debug, Clone, PartialEq)]
pub enum CommandData {
    None,
    Discovery(Vec<DiscoveryAddress>),
    NopIn(Vec<u8>),
    TaskMgmt(u8),
    Scsi(ScsiTaskResult),
    Redirect(String),
    Message(String),
}

/// Completion callback. Invoked exactly once per queued operation, never
/// from inside the call that queued it.
pub type CommandCallback = Box<dyn FnOnce(&mut IscsiContext, CommandStatus, CommandData) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnState {
    Disconnected,
    Connecting,
    Connected,
}

/// What a reply processor decided about the PDU it was handed
pub(crate) enum Reply {
    /// Exchange finished; fire the callback
    Complete(CommandStatus, CommandData),
    /// More replies expected for this ITT
    Pending,
    /// The processor took over the callback
    Consumed,
}

/// Builder for [`IscsiContext`]
#[derive(Debug, Clone)]
pub struct ContextBuilder {
    initiator_name: String,
    alias: Option<String>,
    target_name: Option<String>,
    portal: Option<String>,
    session_type: Option<SessionType>,
    header_digest: HeaderDigestPreference,
    chap: Option<ChapCredentials>,
    target_chap: Option<ChapCredentials>,
    isid: Option<[u8; 6]>,
    lun: u32,
    reconnect: ReconnectPolicy,
    scsi_timeout: Option<Duration>,
    tcp: TcpOptions,
}

impl ContextBuilder {
    pub fn new(initiator_name: impl Into<String>) -> Self {
        ContextBuilder {
            initiator_name: initiator_name.into(),
            alias: None,
            target_name: None,
            portal: None,
            session_type: None,
            header_digest: HeaderDigestPreference::default(),
            chap: None,
            target_chap: None,
            isid: None,
            lun: 0,
            reconnect: ReconnectPolicy::default(),
            scsi_timeout: None,
            tcp: TcpOptions::default(),
        }
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn target_name(mut self, name: impl Into<String>) -> Self {
        self.target_name = Some(name.into());
        self
    }

    pub fn portal(mut self, portal: impl Into<String>) -> Self {
        self.portal = Some(portal.into());
        self
    }

    pub fn session_type(mut self, session_type: SessionType) -> Self {
        self.session_type = Some(session_type);
        self
    }

    pub fn header_digest(mut self, digest: HeaderDigestPreference) -> Self {
        self.header_digest = digest;
        self
    }

    /// One-way CHAP: the initiator authenticates to the target
    pub fn chap(mut self, credentials: ChapCredentials) -> Self {
        self.chap = Some(credentials);
        self
    }

    /// Mutual CHAP: the target must also prove these credentials
    pub fn mutual_chap(mut self, initiator: ChapCredentials, target: ChapCredentials) -> Self {
        self.chap = Some(initiator);
        self.target_chap = Some(target);
        self
    }

    pub fn isid(mut self, isid: [u8; 6]) -> Self {
        self.isid = Some(isid);
        self
    }

    /// LUN used for the post-login TEST UNIT READY
    pub fn lun(mut self, lun: u32) -> Self {
        self.lun = lun;
        self
    }

    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Default timeout for SCSI commands; zero disables it
    pub fn scsi_timeout(mut self, timeout: Duration) -> Self {
        self.scsi_timeout = if timeout.is_zero() { None } else { Some(timeout) };
        self
    }

    pub fn tcp(mut self, options: TcpOptions) -> Self {
        self.tcp = options;
        self
    }

    /// Build a context talking TCP
    pub fn build(self) -> IscsiResult<IscsiContext> {
        let transport = TcpTransport::new(self.tcp.clone());
        self.build_with_transport(Box::new(transport))
    }

    /// Build a context on top of a custom transport
    pub fn build_with_transport(self, transport: Box<dyn Transport + Send>) -> IscsiResult<IscsiContext> {
        if self.initiator_name.is_empty() {
            return Err(IscsiError::Config("initiator name must not be empty".to_string()));
        }
        if self.session_type == Some(SessionType::Normal) && self.target_name.is_none() {
            log::debug!("Normal session built without a target name; login will fail until one is set");
        }
        let isid = self.isid.unwrap_or_else(random_isid);

        Ok(IscsiContext {
            initiator_name: self.initiator_name,
            alias: self.alias,
            target_name: self.target_name,
            portal: self.portal,
            session_type: self.session_type,
            want_header_digest: self.header_digest,
            chap: self.chap,
            target_chap: self.target_chap,
            isid,
            lun: self.lun,
            reconnect_policy: self.reconnect,
            scsi_timeout: self.scsi_timeout,
            params: SessionParams::default(),
            header_digest: DigestType::None,
            seq: SequenceState::default(),
            login: LoginState::default(),
            mutual_chap_state: None,
            transport,
            conn: ConnState::Disconnected,
            connect_cb: None,
            connect_deadline: None,
            pending: VecDeque::new(),
            current: None,
            waiting: HashMap::new(),
            incoming: None,
            next_seq: 0,
            corked: false,
            destroying: false,
            nops_in_flight: 0,
            reconnect: ReconnectState::default(),
            last_error: None,
        })
    }
}

/// Random-type ISID (RFC 3720 Section 10.12.5): T=10b, 24 random bits
fn random_isid() -> [u8; 6] {
    let mut rng = rand::thread_rng();
    let rnd: u32 = rng.gen();
    [
        0x80,
        (rnd >> 16) as u8,
        (rnd >> 8) as u8,
        rnd as u8,
        0,
        0,
    ]
}

/// The per-connection session state.
pub struct IscsiContext {
    pub(crate) initiator_name: String,
    pub(crate) alias: Option<String>,
    pub(crate) target_name: Option<String>,
    pub(crate) portal: Option<String>,
    pub(crate) session_type: Option<SessionType>,
    pub(crate) want_header_digest: HeaderDigestPreference,
    pub(crate) chap: Option<ChapCredentials>,
    pub(crate) target_chap: Option<ChapCredentials>,
    pub(crate) isid: [u8; 6],
    pub(crate) lun: u32,
    pub(crate) reconnect_policy: ReconnectPolicy,
    pub(crate) scsi_timeout: Option<Duration>,

    pub(crate) params: SessionParams,
    pub(crate) header_digest: DigestType,
    pub(crate) seq: SequenceState,
    pub(crate) login: LoginState,
    pub(crate) mutual_chap_state: Option<MutualChallenge>,

    transport: Box<dyn Transport + Send>,
    pub(crate) conn: ConnState,
    pub(crate) connect_cb: Option<CommandCallback>,
    connect_deadline: Option<Instant>,

    pub(crate) pending: VecDeque<Pdu>,
    pub(crate) current: Option<Pdu>,
    pub(crate) waiting: HashMap<u32, Pdu>,
    incoming: Option<InPdu>,
    next_seq: u64,
    pub(crate) corked: bool,
    pub(crate) destroying: bool,
    pub(crate) nops_in_flight: u32,
    pub(crate) reconnect: ReconnectState,
    pub(crate) last_error: Option<String>,
}

impl IscsiContext {
    /// Start building a context for `initiator_name`
    pub fn builder(initiator_name: impl Into<String>) -> ContextBuilder {
        ContextBuilder::new(initiator_name)
    }

    /// Configure a normal session from an `iscsi://` URL
    pub fn from_url(initiator_name: impl Into<String>, url: &IscsiUrl) -> IscsiResult<Self> {
        let mut builder = ContextBuilder::new(initiator_name)
            .target_name(url.target.clone())
            .portal(url.portal.clone())
            .session_type(SessionType::Normal)
            .lun(url.lun);
        if let Some(chap) = url.credentials.clone() {
            builder = builder.chap(chap);
        }
        builder.tcp(TcpOptions::from_env()).build()
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn initiator_name(&self) -> &str {
        &self.initiator_name
    }

    pub fn target_name(&self) -> Option<&str> {
        self.target_name.as_deref()
    }

    pub fn set_target_name(&mut self, name: impl Into<String>) -> IscsiResult<()> {
        if self.login.logged_in {
            return Err(IscsiError::Session("cannot change target name while logged in".to_string()));
        }
        self.target_name = Some(name.into());
        Ok(())
    }

    pub fn session_type(&self) -> Option<SessionType> {
        self.session_type
    }

    pub fn set_session_type(&mut self, session_type: SessionType) -> IscsiResult<()> {
        if self.login.logged_in {
            return Err(IscsiError::Session("cannot change session type while logged in".to_string()));
        }
        self.session_type = Some(session_type);
        Ok(())
    }

    pub fn set_header_digest(&mut self, digest: HeaderDigestPreference) -> IscsiResult<()> {
        if self.login.logged_in {
            return Err(IscsiError::Session("cannot change header digest while logged in".to_string()));
        }
        self.want_header_digest = digest;
        Ok(())
    }

    pub fn set_chap(&mut self, credentials: Option<ChapCredentials>) -> IscsiResult<()> {
        if self.login.logged_in {
            return Err(IscsiError::Session("cannot change CHAP credentials while logged in".to_string()));
        }
        self.chap = credentials;
        Ok(())
    }

    pub fn portal(&self) -> Option<&str> {
        self.portal.as_deref()
    }

    /// `TargetAddress` returned by the target during login, if any
    pub fn target_address(&self) -> Option<&str> {
        self.login.target_address.as_deref()
    }

    pub fn isid(&self) -> [u8; 6] {
        self.isid
    }

    pub fn is_logged_in(&self) -> bool {
        self.login.logged_in
    }

    pub fn is_connected(&self) -> bool {
        self.conn == ConnState::Connected
    }

    pub fn is_corked(&self) -> bool {
        self.corked
    }

    /// Header digest in force on the wire
    pub fn header_digest(&self) -> DigestType {
        self.header_digest
    }

    pub fn params(&self) -> &SessionParams {
        &self.params
    }

    pub fn sequence(&self) -> &SequenceState {
        &self.seq
    }

    pub fn nops_in_flight(&self) -> u32 {
        self.nops_in_flight
    }

    /// PDUs not yet fully written (pending plus in-progress)
    pub fn outbound_len(&self) -> usize {
        self.pending.len() + usize::from(self.current.is_some())
    }

    /// PDUs written and waiting for a response
    pub fn awaiting_len(&self) -> usize {
        self.waiting.len()
    }

    /// Most recent error message recorded by the engine
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub(crate) fn set_error(&mut self, msg: impl Into<String>) {
        let msg = msg.into();
        debug!("{}", msg);
        self.last_error = Some(msg);
    }

    /// File descriptor for external event loops
    pub fn get_fd(&self) -> Option<RawFd> {
        self.transport.raw_fd()
    }

    /// Block on the transport until it is ready for `interest` or `timeout`
    /// passes
    pub(crate) fn wait_events(&mut self, interest: Interest, timeout: Duration) -> io::Result<Readiness> {
        self.transport.wait(interest, timeout)
    }

    /// Let a corked context transmit again
    pub fn uncork(&mut self) {
        self.corked = false;
    }

    // ------------------------------------------------------------------
    // Queueing
    // ------------------------------------------------------------------

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Allocate a task tag not used by any queued PDU
    pub(crate) fn next_itt(&mut self) -> u32 {
        let waiting = &self.waiting;
        let pending = &self.pending;
        let current = self.current.as_ref();
        self.seq.next_itt(|itt| {
            waiting.contains_key(&itt)
                || current.map_or(false, |p| p.itt() == itt)
                || pending.iter().any(|p| p.itt() == itt && p.opcode() != opcode::SCSI_DATA_OUT)
        })
    }

    /// Queue a PDU for transmission.
    ///
    /// Non-immediate PDUs take the next CmdSN. The callback never runs
    /// before this returns.
    pub fn queue(&mut self, mut pdu: Pdu) -> IscsiResult<()> {
        if self.destroying {
            return Err(IscsiError::Session("context is being destroyed".to_string()));
        }
        if pdu.deadline.is_none() {
            pdu.deadline = pdu.timeout.map(|t| Instant::now() + t);
        }

        if self.reconnect.active && !pdu.has_flag(pdu_flags::RECOVERY) {
            self.reconnect
                .backlog
                .try_reserve(1)
                .map_err(|e| IscsiError::OutOfMemory(format!("reconnect backlog: {}", e)))?;
            pdu.seq = self.bump_seq();
            debug!("Holding {} itt=0x{:08x} until reconnected", opcode_name(pdu.opcode()), pdu.itt());
            self.reconnect.backlog.push(pdu);
            return Ok(());
        }

        self.pending
            .try_reserve(1)
            .map_err(|e| IscsiError::OutOfMemory(format!("outbound queue: {}", e)))?;
        if pdu.consumes_cmdsn() {
            let cmdsn = self.seq.consume_cmdsn();
            pdu.set_cmdsn(cmdsn);
        } else if pdu.opcode() != opcode::SCSI_DATA_OUT {
            pdu.set_cmdsn(self.seq.cmdsn);
        }
        pdu.seq = self.bump_seq();

        debug!(
            "Queued {} itt=0x{:08x} cmdsn={}{}",
            opcode_name(pdu.opcode()),
            pdu.itt(),
            pdu.cmdsn(),
            if pdu.is_immediate() { " (immediate)" } else { "" }
        );
        self.pending.push_back(pdu);
        Ok(())
    }

    /// Queue a PDU built by the engine itself. If it cannot be queued its
    /// callback is resolved here instead of being lost.
    pub(crate) fn queue_or_fail(&mut self, pdu: Pdu) {
        if self.destroying {
            return self.complete(pdu, CommandStatus::Cancelled, CommandData::None);
        }
        let backlog = self.reconnect.active && !pdu.has_flag(pdu_flags::RECOVERY);
        let room = if backlog {
            self.reconnect.backlog.try_reserve(1)
        } else {
            self.pending.try_reserve(1)
        };
        if let Err(e) = room {
            let msg = format!("failed to queue {}: {}", opcode_name(pdu.opcode()), e);
            self.set_error(msg.clone());
            return self.complete(pdu, CommandStatus::Error, CommandData::Message(msg));
        }
        if let Err(e) = self.queue(pdu) {
            warn!("Queueing failed after reserving room: {}", e);
        }
    }

    /// Index of the next PDU allowed on the wire
    fn next_eligible(&self) -> Option<usize> {
        if self.corked || self.conn != ConnState::Connected {
            return None;
        }
        self.pending.iter().position(|pdu| {
            if !self.login.logged_in {
                return pdu.opcode() == opcode::LOGIN_REQUEST;
            }
            !pdu.consumes_cmdsn() || self.seq.in_window(pdu.cmdsn())
        })
    }

    /// Readiness the caller's event loop should wait for
    pub fn which_events(&self) -> Interest {
        match self.conn {
            ConnState::Disconnected => Interest::NONE,
            ConnState::Connecting => Interest::WRITE,
            ConnState::Connected => Interest {
                read: true,
                write: self.current.is_some() || self.next_eligible().is_some(),
            },
        }
    }

    // ------------------------------------------------------------------
    // Service loop
    // ------------------------------------------------------------------

    /// Drive the engine after the event loop reported `revents`.
    ///
    /// Also runs the timeout scanner and any scheduled reconnect, so it may be
    /// called with [`Readiness::NONE`] on a timer.
    pub fn service(&mut self, revents: Readiness) -> IscsiResult<()> {
        let now = Instant::now();
        self.scan_timeouts(now);
        self.drive_reconnect(now);

        if self.conn == ConnState::Disconnected {
            return Ok(());
        }

        if self.conn == ConnState::Connecting && self.connect_deadline.map_or(false, |deadline| deadline <= now) {
            return self.transport_failed("connect timed out".to_string());
        }

        if revents.error {
            let reason = match self.transport.take_error() {
                Ok(Some(e)) => e.to_string(),
                Ok(None) => "socket error".to_string(),
                Err(e) => e.to_string(),
            };
            return self.transport_failed(reason);
        }

        if self.conn == ConnState::Connecting {
            if revents.hangup {
                return self.transport_failed("connection refused".to_string());
            }
            if revents.writable {
                self.finish_connect()?;
            }
            return Ok(());
        }

        if revents.writable {
            if let Err(e) = self.write_pending() {
                return self.transport_failed(e.to_string());
            }
        }

        if revents.readable && self.conn == ConnState::Connected {
            if let Err(e) = self.read_incoming() {
                return self.transport_failed(e.to_string());
            }
        }

        if revents.hangup && !revents.readable && self.conn == ConnState::Connected {
            return self.transport_failed("connection closed by target".to_string());
        }
        Ok(())
    }

    /// Begin connecting the transport; `cb` fires from `service()`
    pub(crate) fn start_connect(&mut self, portal: &str, cb: CommandCallback) -> IscsiResult<()> {
        if self.conn != ConnState::Disconnected {
            return Err(IscsiError::Session("already connected".to_string()));
        }
        self.transport.connect(portal).map_err(|e| {
            self.set_error(format!("failed to connect to {}: {}", portal, e));
            IscsiError::Io(e)
        })?;
        self.portal = Some(portal.to_string());
        self.conn = ConnState::Connecting;
        self.connect_deadline = self.transport.connect_timeout().map(|t| Instant::now() + t);
        self.connect_cb = Some(cb);
        Ok(())
    }

    fn finish_connect(&mut self) -> IscsiResult<()> {
        match self.transport.take_error() {
            Ok(None) => {}
            Ok(Some(e)) | Err(e) => return self.transport_failed(format!("connect failed: {}", e)),
        }
        self.conn = ConnState::Connected;
        self.connect_deadline = None;
        info!("Connected to {}", self.portal.as_deref().unwrap_or("target"));
        if let Some(cb) = self.connect_cb.take() {
            cb(self, CommandStatus::Good, CommandData::None);
        }
        Ok(())
    }

    fn write_pending(&mut self) -> io::Result<()> {
        loop {
            if self.current.is_none() {
                let idx = match self.next_eligible() {
                    Some(idx) => idx,
                    None => return Ok(()),
                };
                let mut pdu = match self.pending.remove(idx) {
                    Some(pdu) => pdu,
                    None => return Ok(()),
                };
                pdu.set_expstatsn(self.seq.expstatsn());
                if let Err(e) = pdu.encode(self.header_digest) {
                    self.complete(pdu, CommandStatus::Error, CommandData::Message(e.to_string()));
                    continue;
                }
                self.current = Some(pdu);
            }

            let pdu = match self.current.as_mut() {
                Some(pdu) => pdu,
                None => return Ok(()),
            };
            match self.transport.write(pdu.unwritten()) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "transport accepted no bytes"));
                }
                Ok(n) => pdu.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            if pdu.is_fully_written() {
                if let Some(pdu) = self.current.take() {
                    self.pdu_sent(pdu);
                }
            }
        }
    }

    fn pdu_sent(&mut self, pdu: Pdu) {
        debug!("Sent {} itt=0x{:08x}", opcode_name(pdu.opcode()), pdu.itt());
        if pdu.has_flag(pdu_flags::CORK_WHEN_SENT) {
            self.corked = true;
        }
        if pdu.has_flag(pdu_flags::DELETE_WHEN_SENT) || pdu.detached {
            return;
        }
        if let Some(old) = self.waiting.insert(pdu.itt(), pdu) {
            warn!("Replaced outstanding PDU with duplicate itt 0x{:08x}", old.itt());
            self.complete(old, CommandStatus::Error, CommandData::Message("duplicate task tag".to_string()));
        }
    }

    fn read_incoming(&mut self) -> IscsiResult<()> {
        loop {
            let hdr_len = match self.header_digest {
                DigestType::CRC32C => BHS_SIZE + DIGEST_SIZE,
                DigestType::None => BHS_SIZE,
            };
            let max_data = self.params.initiator_max_recv_data_segment_length;
            let inpdu = self.incoming.get_or_insert_with(|| InPdu::new(hdr_len));

            let n = match self.transport.read(inpdu.unfilled_mut()) {
                Ok(0) => {
                    return Err(IscsiError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed by target",
                    )))
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            inpdu.advance(n);

            if inpdu.header_complete() && !inpdu.is_prepared() {
                inpdu.prepare_body(max_data)?;
            }
            if inpdu.is_complete() {
                if let Some(done) = self.incoming.take() {
                    self.dispatch(done);
                }
                if self.conn != ConnState::Connected {
                    return Ok(());
                }
            }
        }
    }

    /// Connection lost or unusable
    pub(crate) fn transport_failed(&mut self, reason: String) -> IscsiResult<()> {
        warn!(
            "Connection to {} failed: {}",
            self.portal.as_deref().unwrap_or("target"),
            reason
        );
        self.set_error(reason.clone());
        let was_logged_in = self.login.logged_in;
        self.close_transport();

        if was_logged_in {
            if self.reconnect_policy.auto_reconnect {
                self.begin_reconnect(&reason);
                return Ok(());
            }
            self.reconnect.deferred = true;
            let pdus = self.remove_all();
            self.resolve_all(pdus, CommandStatus::Cancelled, None);
            return Err(IscsiError::Session(format!("session dropped: {}", reason)));
        }

        let in_reconnect = self.reconnect.attempt_in_flight;
        if let Some(cb) = self.connect_cb.take() {
            cb(self, CommandStatus::Error, CommandData::Message(reason.clone()));
        }
        let pdus = self.remove_connection_pdus();
        self.resolve_all(pdus, CommandStatus::Error, Some(&reason));
        if in_reconnect {
            self.reconnect_attempt_failed(&reason);
            return Ok(());
        }
        Err(IscsiError::Session(format!("connection failed: {}", reason)))
    }

    /// Close the socket and forget connection-scoped state. Queued PDUs stay.
    pub(crate) fn close_transport(&mut self) {
        self.transport.disconnect();
        self.conn = ConnState::Disconnected;
        self.connect_deadline = None;
        self.incoming = None;
        self.login.reset();
        self.mutual_chap_state = None;
        self.header_digest = DigestType::None;
        self.seq.reset_for_login();
        self.corked = false;
        if let Some(mut pdu) = self.current.take() {
            if !pdu.detached {
                pdu.reset_for_retransmit();
                self.pending.push_front(pdu);
            }
        }
    }

    /// Close the connection without cancelling anything
    pub fn disconnect(&mut self) {
        info!("Disconnecting from {}", self.portal.as_deref().unwrap_or("target"));
        if let Some(cb) = self.connect_cb.take() {
            cb(self, CommandStatus::Cancelled, CommandData::None);
        }
        self.close_transport();
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    pub(crate) fn dispatch(&mut self, inpdu: InPdu) {
        let op = inpdu.opcode();
        let itt = inpdu.itt();
        debug!(
            "Received {} itt=0x{:08x} flags=0x{:02x} datalen={}",
            opcode_name(op),
            itt,
            inpdu.flags(),
            inpdu.data().len()
        );

        self.seq.update_window(inpdu.expcmdsn(), inpdu.maxcmdsn());

        match op {
            opcode::NOP_IN if itt == RESERVED_TAG => return self.process_target_nop_in(&inpdu),
            opcode::REJECT => return self.process_reject(&inpdu),
            opcode::ASYNC_MESSAGE => return self.process_async_message(&inpdu),
            _ => {}
        }

        let mut pdu = match self.waiting.remove(&itt) {
            Some(pdu) => pdu,
            None => {
                warn!("No outstanding PDU for {} itt=0x{:08x}, ignoring", opcode_name(op), itt);
                return;
            }
        };

        if carries_status(&inpdu) && !self.seq.advance_statsn(inpdu.statsn()) {
            let msg = format!(
                "StatSN {} is lower than previously seen {}",
                inpdu.statsn(),
                self.seq.statsn
            );
            warn!("{} for itt 0x{:08x}", msg, itt);
            return self.complete(pdu, CommandStatus::Error, CommandData::Message(msg));
        }

        let expected = pdu.response_opcode();
        let scsi_reply = expected == opcode::SCSI_RESPONSE && (op == opcode::SCSI_DATA_IN || op == opcode::R2T);
        if op != expected && !scsi_reply {
            let msg = format!(
                "Got {} for itt 0x{:08x}, expected {}",
                opcode_name(op),
                itt,
                opcode_name(expected)
            );
            warn!("{}", msg);
            return self.complete(pdu, CommandStatus::Error, CommandData::Message(msg));
        }

        let reply = match op {
            opcode::LOGIN_RESPONSE => self.process_login_reply(&mut pdu, &inpdu),
            opcode::TEXT_RESPONSE => self.process_text_reply(&inpdu),
            opcode::LOGOUT_RESPONSE => self.process_logout_reply(&inpdu),
            opcode::TASK_MANAGEMENT_RESPONSE => self.process_task_mgmt_reply(&inpdu),
            opcode::NOP_IN => self.process_nop_out_reply(&inpdu),
            opcode::SCSI_RESPONSE => self.process_scsi_reply(&mut pdu, &inpdu),
            opcode::SCSI_DATA_IN => self.process_data_in(&mut pdu, &inpdu),
            opcode::R2T => self.process_r2t(&mut pdu, &inpdu),
            _ => Reply::Complete(
                CommandStatus::Error,
                CommandData::Message(format!("unsupported opcode 0x{:02x}", op)),
            ),
        };

        match reply {
            Reply::Complete(status, data) => self.complete(pdu, status, data),
            Reply::Pending => {
                self.waiting.insert(itt, pdu);
            }
            Reply::Consumed => {}
        }
    }

    fn process_reject(&mut self, inpdu: &InPdu) {
        let reason = inpdu.byte(2);
        let data = inpdu.data();
        if data.len() < BHS_SIZE {
            warn!("Reject (reason 0x{:02x}) without the rejected header", reason);
            return;
        }
        let itt = BigEndian::read_u32(&data[16..20]);
        match self.waiting.remove(&itt) {
            Some(pdu) => {
                warn!(
                    "Target rejected {} itt=0x{:08x}, reason 0x{:02x}",
                    opcode_name(pdu.opcode()),
                    itt,
                    reason
                );
                self.complete(
                    pdu,
                    CommandStatus::Error,
                    CommandData::Message(format!("rejected by target, reason 0x{:02x}", reason)),
                );
            }
            None => warn!("Reject for unknown itt 0x{:08x}, reason 0x{:02x}", itt, reason),
        }
    }

    fn process_async_message(&mut self, inpdu: &InPdu) {
        let event = inpdu.byte(36);
        match event {
            0 => info!("Target reported a SCSI asynchronous event"),
            1 => warn!("Target requests logout"),
            2 => warn!("Target will drop this connection"),
            3 => warn!("Target will drop all connections of this session"),
            4 => info!("Target requests parameter negotiation"),
            _ => debug!("Async message event {}", event),
        }
    }

    // ------------------------------------------------------------------
    // Resolution helpers
    // ------------------------------------------------------------------

    /// Resolve one PDU and fire its callback
    pub(crate) fn complete(&mut self, mut pdu: Pdu, status: CommandStatus, data: CommandData) {
        if pdu.opcode() == opcode::NOP_OUT && pdu.itt() != RESERVED_TAG {
            self.nops_in_flight = self.nops_in_flight.saturating_sub(1);
        }
        if let Some(cb) = pdu.callback.take() {
            cb(self, status, data);
        }
    }

    /// Resolve many PDUs in their original queue order
    pub(crate) fn resolve_all(&mut self, mut pdus: Vec<Pdu>, status: CommandStatus, reason: Option<&str>) {
        pdus.sort_by_key(|p| p.seq);
        for pdu in pdus {
            let data = match reason {
                Some(msg) => CommandData::Message(msg.to_string()),
                None => CommandData::None,
            };
            self.complete(pdu, status, data);
        }
    }

    /// Remove matching PDUs from pending, awaiting-response and the reconnect
    /// backlog. Outbound-current is handled separately.
    pub(crate) fn remove_queued(&mut self, pred: &dyn Fn(&Pdu) -> bool) -> Vec<Pdu> {
        let mut removed = Vec::new();

        let mut kept = VecDeque::with_capacity(self.pending.len());
        for pdu in self.pending.drain(..) {
            if pred(&pdu) {
                removed.push(pdu);
            } else {
                kept.push_back(pdu);
            }
        }
        self.pending = kept;

        let itts: Vec<u32> = self
            .waiting
            .iter()
            .filter(|(_, pdu)| pred(pdu))
            .map(|(itt, _)| *itt)
            .collect();
        for itt in itts {
            if let Some(pdu) = self.waiting.remove(&itt) {
                removed.push(pdu);
            }
        }

        let mut kept = Vec::with_capacity(self.reconnect.backlog.len());
        for pdu in self.reconnect.backlog.drain(..) {
            if pred(&pdu) {
                removed.push(pdu);
            } else {
                kept.push(pdu);
            }
        }
        self.reconnect.backlog = kept;

        removed
    }

    /// Pull the callback off outbound-current if it matches `pred`.
    ///
    /// A PDU whose bytes are partly on the wire keeps draining so the stream
    /// stays framed; only a stub carrying its callback is returned.
    pub(crate) fn take_current(&mut self, pred: &dyn Fn(&Pdu) -> bool) -> Option<Pdu> {
        let matches = self.current.as_ref().map_or(false, |p| !p.detached && pred(p));
        if !matches {
            return None;
        }
        let started = self.current.as_ref().map_or(false, |p| p.bytes_written() > 0);
        if !started || self.conn != ConnState::Connected {
            return self.current.take();
        }
        let cur = self.current.as_mut()?;
        let mut stub = Pdu::new(cur.opcode(), cur.response_opcode(), cur.itt(), 0);
        stub.callback = cur.callback.take();
        stub.seq = cur.seq;
        cur.detached = true;
        Some(stub)
    }

    /// Remove the PDUs tied to the current connection, leaving the reconnect
    /// backlog alone
    pub(crate) fn remove_connection_pdus(&mut self) -> Vec<Pdu> {
        let mut pdus: Vec<Pdu> = self.pending.drain(..).collect();
        pdus.extend(self.waiting.drain().map(|(_, pdu)| pdu));
        if let Some(pdu) = self.current.take() {
            if !pdu.detached {
                pdus.push(pdu);
            }
        }
        pdus
    }

    /// Remove every queued PDU, including outbound-current
    pub(crate) fn remove_all(&mut self) -> Vec<Pdu> {
        let mut pdus = self.remove_queued(&|_| true);
        if let Some(pdu) = self.current.take() {
            if !pdu.detached {
                pdus.push(pdu);
            }
        }
        pdus
    }

    /// Tear the context down, cancelling every outstanding operation
    pub fn destroy(self) {
        info!("Destroying context for {}", self.initiator_name);
        drop(self);
    }
}

/// Responses whose StatSN field is meaningful
fn carries_status(inpdu: &InPdu) -> bool {
    match inpdu.opcode() {
        opcode::SCSI_RESPONSE
        | opcode::TASK_MANAGEMENT_RESPONSE
        | opcode::TEXT_RESPONSE
        | opcode::LOGOUT_RESPONSE
        | opcode::NOP_IN => true,
        opcode::SCSI_DATA_IN => inpdu.flags() & flags::STATUS != 0,
        _ => false,
    }
}

impl Drop for IscsiContext {
    fn drop(&mut self) {
        self.destroying = true;
        self.transport.disconnect();
        self.conn = ConnState::Disconnected;
        if let Some(cb) = self.connect_cb.take() {
            cb(self, CommandStatus::Cancelled, CommandData::None);
        }
        if let Some(cb) = self.reconnect.waiter.take() {
            cb(self, CommandStatus::Cancelled, CommandData::None);
        }
        let pdus = self.remove_all();
        if !pdus.is_empty() {
            debug!("Cancelling {} outstanding PDUs on destroy", pdus.len());
        }
        self.resolve_all(pdus, CommandStatus::Cancelled, None);
    }
}

impl std::fmt::Debug for IscsiContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IscsiContext")
            .field("initiator_name", &self.initiator_name)
            .field("target_name", &self.target_name)
            .field("portal", &self.portal)
            .field("logged_in", &self.login.logged_in)
            .field("seq", &self.seq)
            .field("pending", &self.pending.len())
            .field("waiting", &self.waiting.len())
            .finish()
    }
}
