//! MCTP-over-TCP transport endpoint.
//!
//! Each frame on the stream is a 4-byte little-endian length followed by
//! the 4-byte message header (`dst`, `src`, `tag`, `type`) and the payload.
//! The endpoint runs an accept loop serving one peer at a time, worker
//! threads draining the receive queue into the dispatcher, a writer
//! draining the transmit queue back onto the socket, and a reclaim drain
//! for failed actions.

pub mod queue;

pub use queue::{Action, MctpMessage, MsgPool, Transport};
pub use queue::{MAX_MSG_SIZE, MT_CXL_CCI, MT_CXL_FMAPI, MT_EMULATOR, POOL_SLOTS};

use crossbeam_channel::RecvTimeoutError;
use log::{debug, error, info, warn};
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;

/// Transport verbosity bit: log every received frame.
pub const VB_FRAMES: u64 = 1 << 0;
/// Transport verbosity bit: log peer connects and disconnects.
pub const VB_PEERS: u64 = 1 << 1;

static VERBOSITY: AtomicU64 = AtomicU64::new(0);

/// Set the transport verbosity bitfield (`-Z` / `emulator.verbosity-mctp`).
/// The bits gate the per-frame and per-peer chatter independently of the
/// process log level.
pub fn set_verbosity(bits: u64) {
    VERBOSITY.store(bits, Ordering::SeqCst);
}

fn verbose(bit: u64) -> bool {
    VERBOSITY.load(Ordering::SeqCst) & bit != 0
}

/// Transport frame overhead: dst, src, tag, type.
const FRAME_HDR: usize = 4;

/// Poll interval for stop-flag checks while blocked on I/O or queues.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Worker threads running the dispatcher.
const NUM_WORKERS: usize = 2;

/// Our endpoint id on the management network.
pub const OWN_EID: u8 = 0x10;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("listener configuration: {0}")]
    Listener(#[source] io::Error),
}

static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn stop_handler(_sig: libc::c_int) {
    STOP.store(true, Ordering::SeqCst);
}

/// Install SIGINT/SIGTERM handlers that raise the stop flag.
pub fn register_stop_signals() {
    let handler = stop_handler as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }
}

pub fn stop_requested() -> bool {
    STOP.load(Ordering::SeqCst)
}

pub fn request_stop() {
    STOP.store(true, Ordering::SeqCst);
}

/// Receiver side of the endpoint: anything that consumes inbound actions.
pub trait ActionHandler: Send + Sync {
    fn handle(&self, action: Action);
}

enum ReadOutcome {
    Full,
    Eof,
    Stopped,
}

/// Fill `buf` from the stream, polling the stop flag across read timeouts.
/// EOF is only clean at a frame boundary (`pos == 0`).
fn read_with_stop(stream: &mut TcpStream, buf: &mut [u8]) -> io::Result<ReadOutcome> {
    let mut pos = 0;
    while pos < buf.len() {
        if stop_requested() {
            return Ok(ReadOutcome::Stopped);
        }
        match stream.read(&mut buf[pos..]) {
            Ok(0) => {
                if pos == 0 {
                    return Ok(ReadOutcome::Eof);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed mid-frame",
                ));
            }
            Ok(n) => pos += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => {
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(ReadOutcome::Full)
}

/// Read one frame. `Ok(None)` means clean EOF or shutdown.
pub fn read_frame(stream: &mut TcpStream) -> io::Result<Option<MctpMessage>> {
    let mut lenbuf = [0u8; 4];
    match read_with_stop(stream, &mut lenbuf)? {
        ReadOutcome::Full => {}
        ReadOutcome::Eof | ReadOutcome::Stopped => return Ok(None),
    }
    let len = u32::from_le_bytes(lenbuf) as usize;
    if !(FRAME_HDR..=FRAME_HDR + MAX_MSG_SIZE).contains(&len) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame length {len} out of range"),
        ));
    }
    let mut hdr = [0u8; FRAME_HDR];
    match read_with_stop(stream, &mut hdr)? {
        ReadOutcome::Full => {}
        ReadOutcome::Eof => {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed mid-frame",
            ))
        }
        ReadOutcome::Stopped => return Ok(None),
    }
    let mut payload = vec![0u8; len - FRAME_HDR];
    match read_with_stop(stream, &mut payload)? {
        ReadOutcome::Full => {}
        ReadOutcome::Eof => {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed mid-frame",
            ))
        }
        ReadOutcome::Stopped => return Ok(None),
    }
    let len = payload.len();
    Ok(Some(MctpMessage {
        dst: hdr[0],
        src: hdr[1],
        tag: hdr[2],
        mtype: hdr[3],
        payload,
        len,
    }))
}

/// Write one frame.
pub fn write_frame(stream: &mut TcpStream, msg: &MctpMessage) -> io::Result<()> {
    let total = (FRAME_HDR + msg.len) as u32;
    stream.write_all(&total.to_le_bytes())?;
    stream.write_all(&[msg.dst, msg.src, msg.tag, msg.mtype])?;
    stream.write_all(msg.body())?;
    stream.flush()
}

/// The MCTP endpoint: owns the listening socket and the I/O threads.
pub struct Endpoint {
    listener: TcpListener,
    local: SocketAddr,
}

impl Endpoint {
    /// Bind the server socket. Port 0 selects an ephemeral port.
    pub fn bind(addr: Ipv4Addr, port: u16) -> Result<Self, TransportError> {
        let want: SocketAddr = (addr, port).into();
        let listener = TcpListener::bind(want).map_err(|source| TransportError::Bind {
            addr: want,
            source,
        })?;
        listener
            .set_nonblocking(true)
            .map_err(TransportError::Listener)?;
        let local = listener.local_addr().map_err(TransportError::Listener)?;
        Ok(Endpoint { listener, local })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Start all transport threads. Returns their join handles; they exit
    /// once the stop flag is raised.
    pub fn start(
        self,
        transport: &Transport,
        handler: Arc<dyn ActionHandler>,
    ) -> Vec<JoinHandle<()>> {
        let Endpoint { listener, local } = self;
        let mut handles = Vec::new();
        let peer: Arc<Mutex<Option<TcpStream>>> = Arc::new(Mutex::new(None));

        for i in 0..NUM_WORKERS {
            let rxq = transport.rxq_rx.clone();
            let handler = Arc::clone(&handler);
            handles.push(
                thread::Builder::new()
                    .name(format!("mctp-worker{i}"))
                    .spawn(move || {
                        loop {
                            match rxq.recv_timeout(POLL_INTERVAL) {
                                Ok(action) => handler.handle(action),
                                Err(RecvTimeoutError::Timeout) => {
                                    if stop_requested() {
                                        break;
                                    }
                                }
                                Err(RecvTimeoutError::Disconnected) => break,
                            }
                        }
                    })
                    .expect("spawn worker thread"),
            );
        }

        {
            let tmq = transport.tmq_rx.clone();
            let pool = transport.pool.clone();
            let peer = Arc::clone(&peer);
            handles.push(
                thread::Builder::new()
                    .name("mctp-writer".into())
                    .spawn(move || loop {
                        match tmq.recv_timeout(POLL_INTERVAL) {
                            Ok(mut action) => {
                                let Some(rsp) = action.rsp.take() else {
                                    continue;
                                };
                                let mut guard = match peer.lock() {
                                    Ok(g) => g,
                                    Err(p) => p.into_inner(),
                                };
                                if let Some(stream) = guard.as_mut() {
                                    if let Err(e) = write_frame(stream, &rsp) {
                                        error!("transmit failed: {e}");
                                        *guard = None;
                                    } else if verbose(VB_FRAMES) {
                                        debug!(
                                            "tx frame: dst {:#04x} tag {} type {:#04x} len {}",
                                            rsp.dst, rsp.tag, rsp.mtype, rsp.len
                                        );
                                    }
                                } else {
                                    warn!("response dropped: no connected peer");
                                }
                                drop(guard);
                                pool.checkin(rsp);
                            }
                            Err(RecvTimeoutError::Timeout) => {
                                if stop_requested() {
                                    break;
                                }
                            }
                            Err(RecvTimeoutError::Disconnected) => break,
                        }
                    })
                    .expect("spawn writer thread"),
            );
        }

        {
            let acq = transport.acq_rx.clone();
            let pool = transport.pool.clone();
            handles.push(
                thread::Builder::new()
                    .name("mctp-reclaim".into())
                    .spawn(move || loop {
                        match acq.recv_timeout(POLL_INTERVAL) {
                            Ok(mut action) => {
                                warn!(
                                    "action reclaimed: tag {} type {:#04x} completion {}",
                                    action.req.tag, action.req.mtype, action.completion_code
                                );
                                if let Some(rsp) = action.rsp.take() {
                                    pool.checkin(rsp);
                                }
                            }
                            Err(RecvTimeoutError::Timeout) => {
                                if stop_requested() {
                                    break;
                                }
                            }
                            Err(RecvTimeoutError::Disconnected) => break,
                        }
                    })
                    .expect("spawn reclaim thread"),
            );
        }

        {
            let rxq = transport.rxq_tx.clone();
            handles.push(
                thread::Builder::new()
                    .name("mctp-listener".into())
                    .spawn(move || {
                        info!("listening on {local}");
                        while !stop_requested() {
                            match listener.accept() {
                                Ok((stream, remote)) => {
                                    if verbose(VB_PEERS) {
                                        info!("peer connected: {remote}");
                                    }
                                    if let Err(e) = serve_peer(stream, &peer, &rxq) {
                                        warn!("peer {remote}: {e}");
                                    }
                                    match peer.lock() {
                                        Ok(mut g) => *g = None,
                                        Err(p) => *p.into_inner() = None,
                                    }
                                    if verbose(VB_PEERS) {
                                        info!("peer disconnected: {remote}");
                                    }
                                }
                                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                                    thread::sleep(POLL_INTERVAL);
                                }
                                Err(e) => {
                                    error!("accept failed: {e}");
                                    thread::sleep(POLL_INTERVAL);
                                }
                            }
                        }
                    })
                    .expect("spawn listener thread"),
            );
        }

        handles
    }
}

/// Read frames from one peer until EOF, error, or shutdown.
fn serve_peer(
    mut stream: TcpStream,
    peer: &Mutex<Option<TcpStream>>,
    rxq: &crossbeam_channel::Sender<Action>,
) -> io::Result<()> {
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(POLL_INTERVAL))?;
    match peer.lock() {
        Ok(mut g) => *g = Some(stream.try_clone()?),
        Err(p) => *p.into_inner() = Some(stream.try_clone()?),
    }
    while let Some(msg) = read_frame(&mut stream)? {
        if verbose(VB_FRAMES) {
            debug!(
                "rx frame: src {:#04x} tag {} type {:#04x} len {}",
                msg.src, msg.tag, msg.mtype, msg.len
            );
        }
        if rxq.send(Action::new(msg)).is_err() {
            break;
        }
        if stop_requested() {
            break;
        }
    }
    Ok(())
}

/// Fill a response message header from its request: destination is the
/// requester, source is our endpoint id, tag and type are echoed.
pub fn fill_rsp_header(rsp: &mut MctpMessage, req: &MctpMessage, own_eid: u8) {
    rsp.dst = req.src;
    rsp.src = own_eid;
    rsp.tag = req.tag;
    rsp.mtype = req.mtype;
}
