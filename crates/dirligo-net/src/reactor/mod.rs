//! Per-core kernel-readiness reactor.
//!
//! `mio::Poll` already unifies readiness-based (epoll/kqueue) and
//! completion-based (IOCP) kernel I/O behind one readiness API, so this
//! crate ships a single reactor implementation rather than one per kernel
//! facility — `mio` did the kernel-facing picking for us (see
//! `DESIGN.md`).

mod worker;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::error::Result;

pub use worker::ConnHandle;

/// Default fixed read-buffer size per connection.
pub const DEFAULT_READ_BUF: usize = 8 * 1024;

/// User callbacks invoked by reactor workers: a trait/handler abstraction
/// in place of C-style function pointers plus an opaque context.
///
/// Implementations must not perform a blocking call: the reactor invokes
/// these on a worker thread shared by every connection on that queue.
pub trait ConnectionHandler: Send + Sync {
    fn on_open(&self, conn: ConnHandle);
    fn on_data(&self, conn: ConnHandle, data: &[u8]);
    fn on_close(&self, conn: ConnHandle);
}

#[derive(Debug, Clone, Copy)]
pub struct ReactorConfig {
    /// Number of worker queues; defaults to the available parallelism,
    /// giving one queue per CPU core with equal partitioning.
    pub workers: Option<usize>,
    /// Listen backlog, tied to the max number of pending connections.
    pub backlog: u32,
    pub read_buf_size: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        ReactorConfig {
            workers: None,
            backlog: 1024,
            read_buf_size: DEFAULT_READ_BUF,
        }
    }
}

/// A running reactor: one accept-capable worker thread per queue, all
/// sharing the same listening socket.
pub struct Reactor {
    threads: Vec<JoinHandle<()>>,
    wakers: Vec<Arc<mio::Waker>>,
    shutdown: Arc<AtomicBool>,
    local_addr: SocketAddr,
}

impl Reactor {
    /// Binds `addr` and launches the configured number of worker threads.
    pub fn spawn(
        addr: SocketAddr,
        handler: Arc<dyn ConnectionHandler>,
        config: ReactorConfig,
    ) -> Result<Self> {
        let listener = bind_listener(addr, config.backlog)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let worker_count = config
            .workers
            .unwrap_or_else(|| std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1))
            .max(1);

        let shutdown = Arc::new(AtomicBool::new(false));
        let next_conn_id = Arc::new(AtomicUsize::new(1));
        let (waker_tx, waker_rx) = crossbeam_channel::unbounded();

        let mut threads = Vec::with_capacity(worker_count);
        for id in 0..worker_count {
            let listener = listener.try_clone()?;
            let handler = handler.clone();
            let shutdown = shutdown.clone();
            let next_conn_id = next_conn_id.clone();
            let read_buf_size = config.read_buf_size;
            let waker_tx = waker_tx.clone();
            threads.push(std::thread::spawn(move || {
                if let Err(e) = worker::run(
                    id,
                    listener,
                    handler,
                    shutdown,
                    next_conn_id,
                    read_buf_size,
                    waker_tx,
                ) {
                    log::error!("reactor worker {id} exited: {e}");
                }
            }));
        }
        drop(waker_tx);

        let wakers = (0..worker_count)
            .filter_map(|_| waker_rx.recv().ok())
            .collect();

        Ok(Reactor {
            threads,
            wakers,
            shutdown,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Signals every worker to stop and wakes its blocking poll, then
    /// waits for all worker threads to exit.
    pub fn shutdown(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for w in &self.wakers {
            let _ = w.wake();
        }
        for t in self.threads.drain(..) {
            let _ = t.join();
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for w in &self.wakers {
            let _ = w.wake();
        }
    }
}

/// Binds a non-blocking wildcard listening socket with `SO_REUSEADDR` and
/// a backlog equal to the configured max connections.
fn bind_listener(addr: SocketAddr, backlog: u32) -> Result<std::net::TcpListener> {
    use socket2::{Domain, Socket, Type};

    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog as i32)?;
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    struct EchoHandler {
        opened: StdMutex<usize>,
    }

    impl ConnectionHandler for EchoHandler {
        fn on_open(&self, _conn: ConnHandle) {
            *self.opened.lock().unwrap() += 1;
        }

        fn on_data(&self, conn: ConnHandle, data: &[u8]) {
            let _ = conn.write_async(data);
        }

        fn on_close(&self, _conn: ConnHandle) {}
    }

    #[test]
    fn echoes_data_back_to_client() {
        let handler = Arc::new(EchoHandler {
            opened: StdMutex::new(0),
        });
        let reactor = Reactor::spawn(
            "127.0.0.1:0".parse().unwrap(),
            handler.clone(),
            ReactorConfig {
                workers: Some(1),
                ..Default::default()
            },
        )
        .unwrap();

        let mut client = TcpStream::connect(reactor.local_addr()).unwrap();
        client.write_all(b"ping").unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        assert_eq!(*handler.opened.lock().unwrap(), 1);

        reactor.shutdown();
    }
}
