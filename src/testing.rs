//! In-memory transport and fixtures for unit tests

use crate::context::{CommandCallback, IscsiContext};
use crate::pdu::{opcode, pad_len, parse_text_records, BHS_SIZE};
use crate::session::SessionType;
use crate::transport::{Interest, Readiness, Transport};
use byteorder::{BigEndian, ByteOrder};
use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub(crate) const INITIATOR: &str = "iqn.2024-01.test:initiator";
pub(crate) const TARGET: &str = "iqn.2024-01.test:target";

type Responder = Box<dyn FnMut(&[u8]) -> Option<([u8; BHS_SIZE], Vec<u8>)> + Send>;

#[derive(Default)]
struct PeerState {
    connected: bool,
    closed: bool,
    refuse_connect: bool,
    connect_timeout: Option<Duration>,
    connected_to: Vec<String>,
    inbound: VecDeque<u8>,
    written: Vec<u8>,
    unscanned: Vec<u8>,
    write_limit: Option<usize>,
    responder: Option<Responder>,
}

/// Length of the first complete frame in `buf`, if any
fn frame_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < BHS_SIZE {
        return None;
    }
    let data_len = BigEndian::read_u24(&buf[5..8]) as usize;
    let len = BHS_SIZE + buf[4] as usize * 4 + data_len + pad_len(data_len);
    if buf.len() < len {
        None
    } else {
        Some(len)
    }
}

/// The target's side of a [`MockTransport`]
#[derive(Clone, Default)]
pub(crate) struct Peer(Arc<Mutex<PeerState>>);

impl Peer {
    fn state(&self) -> MutexGuard<'_, PeerState> {
        self.0.lock().unwrap()
    }

    /// Queue a PDU for the initiator to read. The data segment length is
    /// taken from `data` and the data is padded.
    pub(crate) fn push_pdu(&self, hdr: &[u8; BHS_SIZE], data: &[u8]) {
        let mut hdr = *hdr;
        BigEndian::write_u24(&mut hdr[5..8], data.len() as u32);
        let mut state = self.state();
        state.inbound.extend(hdr.iter());
        state.inbound.extend(data.iter());
        state.inbound.extend(std::iter::repeat(0u8).take(pad_len(data.len())));
    }

    /// Everything written since the last take
    pub(crate) fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut self.state().written)
    }

    /// Complete frames written since the last take. A trailing partial frame
    /// stays behind.
    pub(crate) fn take_written_pdus(&self) -> Vec<Vec<u8>> {
        let mut state = self.state();
        let mut frames = Vec::new();
        while let Some(len) = frame_len(&state.written) {
            frames.push(state.written.drain(..len).collect());
        }
        frames
    }

    /// Limit how many more bytes the transport accepts; `None` lifts it
    pub(crate) fn set_write_limit(&self, limit: Option<usize>) {
        self.state().write_limit = limit;
    }

    /// Answer every written frame with whatever `f` returns
    pub(crate) fn on_write(&self, f: impl FnMut(&[u8]) -> Option<([u8; BHS_SIZE], Vec<u8>)> + Send + 'static) {
        self.state().responder = Some(Box::new(f));
    }

    /// Portals the initiator connected to, in order
    pub(crate) fn connected_to(&self) -> Vec<String> {
        self.state().connected_to.clone()
    }

    /// Target hangs up: reads return end of stream
    pub(crate) fn close(&self) {
        self.state().closed = true;
    }

    pub(crate) fn refuse_connect(&self, refuse: bool) {
        self.state().refuse_connect = refuse;
    }

    pub(crate) fn set_connect_timeout(&self, timeout: Option<Duration>) {
        self.state().connect_timeout = timeout;
    }
}

/// [`Transport`] backed by in-memory buffers
pub(crate) struct MockTransport {
    peer: Peer,
}

impl MockTransport {
    pub(crate) fn new() -> (MockTransport, Peer) {
        let peer = Peer::default();
        (MockTransport { peer: peer.clone() }, peer)
    }
}

impl Transport for MockTransport {
    fn connect(&mut self, portal: &str) -> io::Result<()> {
        let mut state = self.peer.state();
        if state.refuse_connect {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused"));
        }
        state.connected_to.push(portal.to_string());
        state.connected = true;
        state.closed = false;
        state.inbound.clear();
        state.unscanned.clear();
        Ok(())
    }

    fn connect_timeout(&self) -> Option<Duration> {
        self.peer.state().connect_timeout
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.peer.state();
        if state.inbound.is_empty() {
            if state.closed {
                return Ok(0);
            }
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(state.inbound.len());
        for (slot, byte) in buf.iter_mut().zip(state.inbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.peer.state();
        if !state.connected || state.closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        let n = match state.write_limit {
            Some(0) => return Err(io::ErrorKind::WouldBlock.into()),
            Some(limit) => limit.min(buf.len()),
            None => buf.len(),
        };
        if let Some(limit) = state.write_limit.as_mut() {
            *limit -= n;
        }
        state.written.extend_from_slice(&buf[..n]);
        state.unscanned.extend_from_slice(&buf[..n]);

        while let Some(len) = frame_len(&state.unscanned) {
            let frame: Vec<u8> = state.unscanned.drain(..len).collect();
            let reply = match state.responder.as_mut() {
                Some(responder) => responder(&frame),
                None => None,
            };
            if let Some((mut hdr, data)) = reply {
                BigEndian::write_u24(&mut hdr[5..8], data.len() as u32);
                state.inbound.extend(hdr.iter());
                state.inbound.extend(data.iter());
                state.inbound.extend(std::iter::repeat(0u8).take(pad_len(data.len())));
            }
        }
        Ok(n)
    }

    fn disconnect(&mut self) {
        self.peer.state().connected = false;
    }

    fn raw_fd(&self) -> Option<RawFd> {
        None
    }

    fn wait(&mut self, interest: Interest, _timeout: Duration) -> io::Result<Readiness> {
        let state = self.peer.state();
        Ok(Readiness {
            readable: interest.read && (!state.inbound.is_empty() || state.closed),
            writable: interest.write && state.write_limit != Some(0),
            error: false,
            hangup: false,
        })
    }
}

/// Login Response header and key=value data
pub(crate) fn login_response(
    itt: u32,
    hdr_flags: u8,
    status: u16,
    statsn: u32,
    expcmdsn: u32,
    maxcmdsn: u32,
    keys: &[(&str, &str)],
) -> ([u8; BHS_SIZE], Vec<u8>) {
    let mut hdr = [0u8; BHS_SIZE];
    hdr[0] = opcode::LOGIN_RESPONSE;
    hdr[1] = hdr_flags;
    BigEndian::write_u32(&mut hdr[16..20], itt);
    BigEndian::write_u32(&mut hdr[24..28], statsn);
    BigEndian::write_u32(&mut hdr[28..32], expcmdsn);
    BigEndian::write_u32(&mut hdr[32..36], maxcmdsn);
    BigEndian::write_u16(&mut hdr[36..38], status);

    let mut data = Vec::new();
    for (key, value) in keys {
        data.extend_from_slice(key.as_bytes());
        data.push(b'=');
        data.extend_from_slice(value.as_bytes());
        data.push(0);
    }
    (hdr, data)
}

/// 18-byte fixed format sense data
pub(crate) fn fixed_sense(sense_key: u8, asc: u8, ascq: u8) -> Vec<u8> {
    let mut data = vec![0u8; 18];
    data[0] = 0x70;
    data[2] = sense_key & 0x0f;
    data[7] = 10;
    data[12] = asc;
    data[13] = ascq;
    data
}

/// Decode the text records of a written frame's data segment
pub(crate) fn text_keys(data: &[u8]) -> Vec<(String, String)> {
    parse_text_records(data).unwrap()
}

fn noop() -> CommandCallback {
    Box::new(|_ctx, _status, _data| {})
}

/// Context with a connected transport that has not logged in
pub(crate) fn connected_context(session_type: SessionType) -> (IscsiContext, Peer) {
    let (transport, peer) = MockTransport::new();
    let mut ctx = IscsiContext::builder(INITIATOR)
        .target_name(TARGET)
        .session_type(session_type)
        .isid([0x80, 0x12, 0x34, 0x56, 0x00, 0x00])
        .build_with_transport(Box::new(transport))
        .unwrap();
    ctx.connect_async("127.0.0.1:3260", noop()).unwrap();
    ctx.service(Readiness::WRITABLE).unwrap();
    assert!(ctx.is_connected());
    (ctx, peer)
}

/// Context logged in to a normal session with the window [1, 16] and
/// StatSN 1
pub(crate) fn logged_in_context() -> (IscsiContext, Peer) {
    let (mut ctx, peer) = connected_context(SessionType::Normal);
    ctx.login_async(noop()).unwrap();
    ctx.service(Readiness::WRITABLE).unwrap();
    let frames = peer.take_written_pdus();
    let itt = BigEndian::read_u32(&frames[0][16..20]);
    let (hdr, data) = login_response(itt, 0x87, 0, 1, 1, 16, &[]);
    peer.push_pdu(&hdr, &data);
    ctx.service(Readiness::READABLE).unwrap();
    assert!(ctx.is_logged_in());
    peer.take_written();
    (ctx, peer)
}
