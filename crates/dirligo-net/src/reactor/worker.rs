//! One reactor worker: a blocking readiness loop over a shared listener
//! plus whatever client connections this worker has accepted.
//! Edge-triggering is not used — the read loop explicitly drains each fd
//! until `WouldBlock` rather than trusting a single readiness wakeup.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::TcpListener as StdTcpListener;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};

use super::ConnectionHandler;
use crate::error::Result;

const LISTENER: Token = Token(usize::MAX);
const SHUTDOWN: Token = Token(usize::MAX - 1);

/// Per-connection state a worker owns: the socket, its registration
/// token, and the pending user-space write buffer used for backpressure.
struct Conn {
    stream: Mutex<TcpStream>,
    token: Token,
    pending: Mutex<VecDeque<u8>>,
    write_armed: AtomicBool,
    peer: Option<std::net::SocketAddr>,
}

/// A lightweight, cloneable reference to a reactor connection, handed to
/// [`ConnectionHandler`] callbacks.
#[derive(Clone)]
pub struct ConnHandle {
    conn: Arc<Conn>,
    registry: mio::Registry,
}

impl ConnHandle {
    pub fn peer_addr(&self) -> Option<std::net::SocketAddr> {
        self.conn.peer
    }

    /// Delayed-write protocol for backpressure.
    ///
    /// Attempts an immediate write. A full flush returns `Ok(())`
    /// immediately. A partial write or `WouldBlock` buffers the
    /// remainder, deregisters read-readiness and registers
    /// write-readiness; the worker's write-ready path drains the buffer
    /// later. One logical payload per call — layering a protocol (e.g.
    /// framing) on top is the caller's job.
    pub fn write_async(&self, buf: &[u8]) -> Result<()> {
        let mut pending = self.conn.pending.lock().unwrap();
        if !pending.is_empty() {
            // Already write-armed: queue behind what's pending.
            pending.extend(buf.iter().copied());
            return Ok(());
        }
        drop(pending);

        let mut stream = self.conn.stream.lock().unwrap();
        match stream.write(buf) {
            Ok(n) if n == buf.len() => Ok(()),
            Ok(n) => {
                self.conn.pending.lock().unwrap().extend(buf[n..].iter().copied());
                self.arm_write(&mut stream)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.conn.pending.lock().unwrap().extend(buf.iter().copied());
                self.arm_write(&mut stream)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn arm_write(&self, stream: &mut TcpStream) -> Result<()> {
        if !self.conn.write_armed.swap(true, Ordering::SeqCst) {
            self.registry
                .reregister(stream, self.conn.token, Interest::WRITABLE)?;
        }
        Ok(())
    }

    fn disarm_write(&self, stream: &mut TcpStream) -> Result<()> {
        if self.conn.write_armed.swap(false, Ordering::SeqCst) {
            self.registry
                .reregister(stream, self.conn.token, Interest::READABLE)?;
        }
        Ok(())
    }
}

pub fn run(
    id: usize,
    std_listener: StdTcpListener,
    handler: Arc<dyn ConnectionHandler>,
    shutdown: Arc<AtomicBool>,
    next_conn_id: Arc<AtomicUsize>,
    read_buf_size: usize,
    waker_tx: crossbeam_channel::Sender<Arc<mio::Waker>>,
) -> Result<()> {
    let mut poll = Poll::new()?;
    let mut listener = TcpListener::from_std(std_listener);
    poll.registry()
        .register(&mut listener, LISTENER, Interest::READABLE)?;
    let waker = Arc::new(mio::Waker::new(poll.registry(), SHUTDOWN)?);
    let _ = waker_tx.send(waker.clone());

    let mut conns: HashMap<Token, ConnHandle> = HashMap::new();
    let mut events = Events::with_capacity(1024);
    let mut read_buf = vec![0u8; read_buf_size];

    log::debug!("reactor worker {id} started");

    loop {
        poll.poll(&mut events, None)?;

        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        for ev in events.iter() {
            match ev.token() {
                SHUTDOWN => continue,
                LISTENER => loop {
                    match listener.accept() {
                        Ok((mut stream, peer)) => {
                            let token = Token(next_conn_id.fetch_add(1, Ordering::SeqCst));
                            if let Err(e) =
                                poll.registry().register(&mut stream, token, Interest::READABLE)
                            {
                                log::warn!("failed to register accepted connection: {e}");
                                continue;
                            }
                            let handle = ConnHandle {
                                conn: Arc::new(Conn {
                                    stream: Mutex::new(stream),
                                    token,
                                    pending: Mutex::new(VecDeque::new()),
                                    write_armed: AtomicBool::new(false),
                                    peer: Some(peer),
                                }),
                                registry: poll.registry().try_clone()?,
                            };
                            conns.insert(token, handle.clone());
                            handler.on_open(handle);
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) => {
                            log::warn!("accept error on worker {id}: {e}");
                            break;
                        }
                    }
                },
                token => {
                    let Some(handle) = conns.get(&token).cloned() else {
                        continue;
                    };

                    if ev.is_error() || (ev.is_read_closed() && !ev.is_readable()) {
                        close_conn(&mut poll, &mut conns, &handler, token, handle);
                        continue;
                    }

                    if ev.is_readable() {
                        if let Err(closed) = read_event(&handle, &handler, &mut read_buf) {
                            log::debug!("connection {} read error: {closed}", token.0);
                            close_conn(&mut poll, &mut conns, &handler, token, handle);
                            continue;
                        }
                    }

                    if ev.is_writable() {
                        if let Err(e) = write_event(&handle) {
                            log::debug!("connection {} write error: {e}", token.0);
                            close_conn(&mut poll, &mut conns, &handler, token, handle);
                        }
                    }
                }
            }
        }
    }

    log::debug!("reactor worker {id} stopped");
    Ok(())
}

/// Reads until `WouldBlock`, 0 (EOF) or an error, invoking the data
/// callback for each chunk read.
fn read_event(
    handle: &ConnHandle,
    handler: &Arc<dyn ConnectionHandler>,
    buf: &mut [u8],
) -> std::io::Result<()> {
    loop {
        let n = {
            let mut stream = handle.conn.stream.lock().unwrap();
            match stream.read(buf) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            }
        };
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed"));
        }
        handler.on_data(handle.clone(), &buf[..n]);
    }
}

/// Flushes the pending write buffer; re-arms for read-readiness on a full
/// flush, stays write-armed on a partial flush.
fn write_event(handle: &ConnHandle) -> Result<()> {
    loop {
        let chunk: Vec<u8> = {
            let pending = handle.conn.pending.lock().unwrap();
            if pending.is_empty() {
                let mut stream = handle.conn.stream.lock().unwrap();
                handle.disarm_write(&mut stream)?;
                return Ok(());
            }
            pending.iter().copied().collect()
        };

        let mut stream = handle.conn.stream.lock().unwrap();
        match stream.write(&chunk) {
            Ok(n) => {
                let mut pending = handle.conn.pending.lock().unwrap();
                pending.drain(0..n);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) => return Err(e.into()),
        }
    }
}

fn close_conn(
    poll: &mut Poll,
    conns: &mut HashMap<Token, ConnHandle>,
    handler: &Arc<dyn ConnectionHandler>,
    token: Token,
    handle: ConnHandle,
) {
    if conns.remove(&token).is_some() {
        let mut stream = handle.conn.stream.lock().unwrap();
        let _ = poll.registry().deregister(&mut *stream);
        drop(stream);
        handler.on_close(handle);
    }
}
