//! A caching decorator over [`SftpClient`] (supplemented from
//! `SftpClientCached`): reuses open directory handles and their `readdir`
//! results, caches `statvfs` replies, and reclaims idle handles on a
//! background cleaner thread.
//!
//! The original gated this block behind `WIN32`/DOKAN and kept separate
//! wide-char overloads for every path-taking method; neither applies here,
//! so this is a single, platform-neutral implementation over `&str`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::sftp::client::{DirEntry, SftpClient, Statvfs};

#[derive(Debug, Clone)]
struct CachedDir {
    handle: i64,
    ref_count: u32,
    close_time: Option<Instant>,
    readdir_called: bool,
    entries: Vec<DirEntry>,
    find_time: Option<Instant>,
}

#[derive(Debug, Clone)]
struct CachedStatvfs {
    value: Statvfs,
    timestamp: Instant,
}

struct State {
    dirs: HashMap<String, CachedDir>,
    by_handle: HashMap<i64, String>,
    statvfs: HashMap<String, CachedStatvfs>,
}

/// Tunables for [`CachedSftpClient`]; defaults match the original's
/// hard-coded constants (1s readdir reuse window, 5s statvfs window, 5s
/// cleaner sweep / idle grace).
#[derive(Debug, Clone, Copy)]
pub struct CachedSftpClientConfig {
    pub readdir_ttl: Duration,
    pub statvfs_ttl: Duration,
    pub idle_close_after: Duration,
    pub cleaner_interval: Duration,
}

impl Default for CachedSftpClientConfig {
    fn default() -> Self {
        CachedSftpClientConfig {
            readdir_ttl: Duration::from_secs(1),
            statvfs_ttl: Duration::from_secs(5),
            idle_close_after: Duration::from_secs(5),
            cleaner_interval: Duration::from_secs(5),
        }
    }
}

/// Wraps an [`SftpClient`], caching directory handles, their accumulated
/// `readdir` output, and `statvfs` replies.
pub struct CachedSftpClient {
    inner: Arc<SftpClient>,
    state: Mutex<State>,
    config: CachedSftpClientConfig,
    cleaner_enabled: Arc<AtomicBool>,
    cleaner_wake: Arc<(Mutex<bool>, Condvar)>,
    cleaner_handle: Mutex<Option<JoinHandle<()>>>,
}

impl CachedSftpClient {
    pub fn new(inner: Arc<SftpClient>, config: CachedSftpClientConfig) -> Arc<Self> {
        let client = Arc::new(CachedSftpClient {
            inner,
            state: Mutex::new(State {
                dirs: HashMap::new(),
                by_handle: HashMap::new(),
                statvfs: HashMap::new(),
            }),
            config,
            cleaner_enabled: Arc::new(AtomicBool::new(true)),
            cleaner_wake: Arc::new((Mutex::new(false), Condvar::new())),
            cleaner_handle: Mutex::new(None),
        });

        let cleaner = client.clone();
        let handle = std::thread::Builder::new()
            .name("sftp-cache-cleaner".into())
            .spawn(move || cleaner.cleaner_loop())
            .expect("failed to spawn sftp cache cleaner thread");
        *client.cleaner_handle.lock().unwrap() = Some(handle);

        client
    }

    /// Sweeps every 5s (or immediately on shutdown), closing any directory
    /// handle with zero refs that's been idle past `idle_close_after`
    /// (spec supplement, grounded on `cleanerLoop`).
    fn cleaner_loop(self: Arc<Self>) {
        let (lock, cvar) = &*self.cleaner_wake;
        while self.cleaner_enabled.load(Ordering::SeqCst) {
            {
                let mut woken = lock.lock().unwrap();
                let (guard, _) = cvar
                    .wait_timeout_while(woken, self.config.cleaner_interval, |w| !*w)
                    .unwrap();
                woken = guard;
                *woken = false;
            }
            if !self.cleaner_enabled.load(Ordering::SeqCst) {
                break;
            }
            self.sweep_idle();
        }
    }

    fn sweep_idle(&self) {
        let now = Instant::now();
        let mut to_close = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            state.dirs.retain(|_path, dir| {
                let idle = dir
                    .close_time
                    .map(|t| now.duration_since(t) > self.config.idle_close_after)
                    .unwrap_or(false);
                if dir.ref_count == 0 && idle {
                    to_close.push(dir.handle);
                    state.by_handle.remove(&dir.handle);
                    false
                } else {
                    true
                }
            });
        }
        if !to_close.is_empty() {
            if let Err(e) = self.inner.multiclose(&to_close) {
                log::warn!("sftp cache cleaner: multiclose failed: {e}");
            }
        }
    }

    /// Reuses an already-open directory handle for `path`, opening on the
    /// server only on a cache miss (grounded on `opendir`).
    pub fn opendir(&self, path: &str) -> Result<i64> {
        {
            let mut state = self.state.lock().unwrap();
            if let Some(dir) = state.dirs.get_mut(path) {
                dir.ref_count += 1;
                return Ok(dir.handle);
            }
        }

        let handle = self.inner.opendir(path)?;
        let mut state = self.state.lock().unwrap();
        state.dirs.insert(
            path.to_string(),
            CachedDir {
                handle,
                ref_count: 1,
                close_time: None,
                readdir_called: false,
                entries: Vec::new(),
                find_time: None,
            },
        );
        state.by_handle.insert(handle, path.to_string());
        Ok(handle)
    }

    /// Drops a ref on a cached directory handle instead of closing it
    /// immediately, letting the cleaner thread reclaim it once idle
    /// (grounded on `close`). Non-cached handles close immediately.
    pub fn close(&self, handle: i64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(path) = state.by_handle.get(&handle).cloned() {
            if let Some(dir) = state.dirs.get_mut(&path) {
                dir.ref_count = dir.ref_count.saturating_sub(1);
                dir.close_time = Some(Instant::now());
                return Ok(());
            }
        }
        drop(state);
        self.inner.close(handle)
    }

    /// Reuses the last `readdir` batch for `handle` if it's younger than
    /// `readdir_ttl`; otherwise resets the server-side iterator and
    /// re-lists, caching the fresh result (grounded on `readdir`).
    pub fn readdir(&self, handle: i64) -> Result<Vec<DirEntry>> {
        let path = {
            let state = self.state.lock().unwrap();
            state.by_handle.get(&handle).cloned()
        };

        let Some(path) = path else {
            return self.inner.readdir(handle);
        };

        let reuse = {
            let state = self.state.lock().unwrap();
            state.dirs.get(&path).filter(|dir| dir.readdir_called).and_then(|dir| {
                dir.find_time
                    .filter(|t| t.elapsed() < self.config.readdir_ttl)
                    .map(|_| dir.entries.clone())
            })
        };

        if let Some(entries) = reuse {
            return Ok(entries);
        }

        {
            let state = self.state.lock().unwrap();
            if state.dirs.get(&path).map(|d| d.readdir_called).unwrap_or(false) {
                drop(state);
                self.inner.resetdir(handle)?;
            }
        }

        let entries = self.inner.readdir(handle)?;

        let mut state = self.state.lock().unwrap();
        if let Some(dir) = state.dirs.get_mut(&path) {
            dir.readdir_called = true;
            dir.entries = entries.clone();
            dir.find_time = Some(Instant::now());
        }

        Ok(entries)
    }

    pub fn mkdir(&self, path: &str) -> Result<()> {
        self.inner.mkdir(path)
    }

    pub fn rmdir(&self, path: &str) -> Result<()> {
        self.inner.rmdir(path)
    }

    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.inner.rename(from, to)
    }

    /// Reuses a `statvfs` reply younger than `statvfs_ttl` (grounded on
    /// `statvfs`).
    pub fn statvfs(&self, path: &str) -> Result<Statvfs> {
        {
            let state = self.state.lock().unwrap();
            if let Some(cached) = state.statvfs.get(path) {
                if cached.timestamp.elapsed() < self.config.statvfs_ttl {
                    return Ok(cached.value);
                }
            }
        }

        let value = self.inner.statvfs(path)?;
        let mut state = self.state.lock().unwrap();
        state.statvfs.insert(
            path.to_string(),
            CachedStatvfs {
                value,
                timestamp: Instant::now(),
            },
        );
        Ok(value)
    }

    /// Caches the resulting handle exactly like `opendir` when the server
    /// reports it refers to a directory; otherwise passes the file handle
    /// through uncached (grounded on `createfile`).
    pub fn createfile(
        &self,
        path: &str,
        access: u32,
        shared: u32,
        create: u32,
        flags: u32,
    ) -> Result<(i64, bool)> {
        {
            let mut state = self.state.lock().unwrap();
            if let Some(dir) = state.dirs.get_mut(path) {
                dir.ref_count += 1;
                return Ok((dir.handle, true));
            }
        }

        let (handle, is_dir) = self.inner.createfile(path, access, shared, create, flags)?;
        if is_dir {
            let mut state = self.state.lock().unwrap();
            state.dirs.insert(
                path.to_string(),
                CachedDir {
                    handle,
                    ref_count: 1,
                    close_time: None,
                    readdir_called: false,
                    entries: Vec::new(),
                    find_time: None,
                },
            );
            state.by_handle.insert(handle, path.to_string());
        }
        Ok((handle, is_dir))
    }

    pub fn inner(&self) -> &Arc<SftpClient> {
        &self.inner
    }
}

impl Drop for CachedSftpClient {
    fn drop(&mut self) {
        self.cleaner_enabled.store(false, Ordering::SeqCst);
        let (lock, cvar) = &*self.cleaner_wake;
        *lock.lock().unwrap() = true;
        cvar.notify_all();
        if let Some(handle) = self.cleaner_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, TcpConnection};
    use crate::sftp::client::SftpClientConfig;
    use dirligo_proto::{PacketBuilder, PacketType};
    use std::io::{Read as StdRead, Write as StdWrite};
    use std::net::TcpListener;

    fn handshake(sock: &mut std::net::TcpStream) {
        let mut header = [0u8; 9];
        sock.read_exact(&mut header).unwrap();
        let mut rest = [0u8; 4];
        sock.read_exact(&mut rest).unwrap();
        let mut b = PacketBuilder::new(PacketType::Version.into(), 0);
        b.push_u32(3);
        sock.write_all(&b.finish()).unwrap();
    }

    fn read_request(sock: &mut std::net::TcpStream) -> (u32, Vec<u8>) {
        let mut header = [0u8; 9];
        sock.read_exact(&mut header).unwrap();
        let len = u32::from_be_bytes(header[0..4].try_into().unwrap()) as usize;
        let mut rest = vec![0u8; len - 5];
        sock.read_exact(&mut rest).unwrap();
        let id = u32::from_be_bytes(header[5..9].try_into().unwrap());
        (id, rest)
    }

    /// A second `opendir` for the same path before the first is closed
    /// must reuse the cached handle rather than issue a second wire
    /// request.
    #[test]
    fn opendir_reuses_cached_handle() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            handshake(&mut sock);

            let (id, _) = read_request(&mut sock);
            let mut reply = PacketBuilder::new(PacketType::Handle.into(), id);
            reply.push_u32(4);
            reply.push_u32(9);
            sock.write_all(&reply.finish()).unwrap();
            sock
        });

        let conn: Arc<dyn Connection> =
            Arc::new(TcpConnection::connect(addr, Duration::from_secs(2)).unwrap());
        let inner = SftpClient::connect(conn, SftpClientConfig::default()).unwrap();
        let cached = CachedSftpClient::new(inner, CachedSftpClientConfig::default());

        let h1 = cached.opendir("/dir").unwrap();
        let h2 = cached.opendir("/dir").unwrap();
        assert_eq!(h1, h2);

        cached.close(h1).unwrap();
        cached.close(h2).unwrap();

        server.join().unwrap();
    }
}
