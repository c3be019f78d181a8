//! The SFTPv3 client: wire session setup, request dispatch, the
//! reader task, and the operation set built on top of the vendor "Dirligo"
//! extensions.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use dirligo_proto::{
    Attrs, FrameReader, IdGenerator, NetStatistics, PacketBuilder, PacketReader, PacketType,
    RequestPool, Status, DEFAULT_NETSTAT_TICK, DEFAULT_PARTIAL_IO_TIMEOUT_SECS, DEFAULT_SECTOR_SIZE,
    DIRLIGO_DIR_FLAG, SSH2_FILEXFER_VERSION,
};

use crate::connection::{Connection, ShutdownDirection};
use crate::error::{NetError, Result};

/// One entry returned by [`SftpClient::readdir`]: the raw and "long" (`ls
/// -l`-style) names plus the decoded attribute block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub long_name: String,
    pub attrs: Attrs,
}

/// Decoded `statvfs@openssh.com` extended reply: 11
/// big-endian `u64` fields in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Statvfs {
    pub bsize: u64,
    pub frsize: u64,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub favail: u64,
    pub fsid: u64,
    pub flag: u64,
    pub namemax: u64,
}

/// Fired every `netstat_tick` completed requests, with a read-only view of
/// the live statistics.
pub type NetStatCallback = Box<dyn Fn(&NetStatistics) + Send + Sync>;

/// Fired once when the reader task observes the connection die.
pub type ConnectionDroppedCallback = Box<dyn Fn() + Send + Sync>;

/// Tunables for a single [`SftpClient`] session.
#[derive(Debug, Clone)]
pub struct SftpClientConfig {
    pub sector_size: usize,
    pub netstat_tick: u32,
    pub partial_read_timeout: Duration,
    pub partial_write_timeout: Duration,
    /// Advisory read timeout for the reader task; a timeout is not an
    /// error, just a chance to notice shutdown.
    pub reader_timeout: Option<Duration>,
}

impl Default for SftpClientConfig {
    fn default() -> Self {
        SftpClientConfig {
            sector_size: DEFAULT_SECTOR_SIZE,
            netstat_tick: DEFAULT_NETSTAT_TICK,
            partial_read_timeout: Duration::from_secs(DEFAULT_PARTIAL_IO_TIMEOUT_SECS),
            partial_write_timeout: Duration::from_secs(DEFAULT_PARTIAL_IO_TIMEOUT_SECS),
            reader_timeout: Some(Duration::from_secs(30)),
        }
    }
}

/// A connected SFTPv3 session: one write mutex, one request pool, one
/// reader thread.
pub struct SftpClient {
    conn: Arc<dyn Connection>,
    ids: IdGenerator,
    pool: RequestPool<(u8, Vec<u8>)>,
    write_mutex: Mutex<()>,
    stats: NetStatistics,
    dead: AtomicBool,

    sector_size: AtomicUsize,
    netstat_tick: AtomicU32,
    partial_read_timeout_ms: AtomicU64,
    partial_write_timeout_ms: AtomicU64,
    reader_timeout: Option<Duration>,

    netstat_callback: Mutex<Option<NetStatCallback>>,
    connection_dropped_callback: Mutex<Option<ConnectionDroppedCallback>>,

    reader_handle: Mutex<Option<JoinHandle<()>>>,
}

impl SftpClient {
    /// Sends `SSH_FXP_INIT`, waits for `SSH_FXP_VERSION` via a direct
    /// read/write exchange (no reader thread exists yet), resets
    /// statistics, then launches the reader task.
    pub fn connect(conn: Arc<dyn Connection>, config: SftpClientConfig) -> Result<Arc<Self>> {
        let client = Arc::new(SftpClient {
            conn,
            ids: IdGenerator::new(),
            pool: RequestPool::new(),
            write_mutex: Mutex::new(()),
            stats: NetStatistics::new(),
            dead: AtomicBool::new(false),
            sector_size: AtomicUsize::new(config.sector_size),
            netstat_tick: AtomicU32::new(config.netstat_tick),
            partial_read_timeout_ms: AtomicU64::new(config.partial_read_timeout.as_millis() as u64),
            partial_write_timeout_ms: AtomicU64::new(
                config.partial_write_timeout.as_millis() as u64
            ),
            reader_timeout: config.reader_timeout,
            netstat_callback: Mutex::new(None),
            connection_dropped_callback: Mutex::new(None),
            reader_handle: Mutex::new(None),
        });

        client.handshake()?;

        let reader_client = client.clone();
        let handle = std::thread::Builder::new()
            .name("sftp-reader".into())
            .spawn(move || reader_client.reader_loop())
            .map_err(NetError::Io)?;
        *client.reader_handle.lock().unwrap() = Some(handle);

        Ok(client)
    }

    fn handshake(&self) -> Result<()> {
        let id = self.ids.next_id();
        let mut b = PacketBuilder::new(PacketType::Init.into(), id);
        b.push_u32(SSH2_FILEXFER_VERSION);
        let wire = b.finish();
        self.write_all(&wire)?;

        // processPacketSimple: read directly off the wire until one full
        // packet arrives. There is no reader thread yet to hand this off to.
        let mut frame = FrameReader::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            if let Some((header, _payload)) = frame.pop_packet()? {
                match PacketType::try_from(header.packet_type) {
                    Ok(PacketType::Version) => break,
                    Ok(other) => {
                        return Err(NetError::Protocol(format!(
                            "expected SSH_FXP_VERSION, got {other}"
                        )))
                    }
                    Err(_) => {
                        return Err(NetError::Protocol(format!(
                            "expected SSH_FXP_VERSION, got unknown type {}",
                            header.packet_type
                        )))
                    }
                }
            }
            let n = self.conn.read(&mut buf, None)?;
            if n == 0 {
                return Err(NetError::Protocol("connection closed during handshake".into()));
            }
            frame.feed(&buf[..n]);
        }

        self.stats.reset();
        Ok(())
    }

    fn write_all(&self, wire: &[u8]) -> Result<()> {
        let _guard = self.write_mutex.lock().unwrap();
        let mut off = 0;
        while off < wire.len() {
            let n = self.conn.write(&wire[off..], None)?;
            if n == 0 {
                return Err(NetError::Protocol("write returned 0".into()));
            }
            off += n;
        }
        Ok(())
    }

    /// Reader task: frames incoming bytes,
    /// dispatches each complete packet to the request pool by id, and
    /// shuts the client down on read error or EOF.
    fn reader_loop(self: Arc<Self>) {
        let mut frame = FrameReader::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = match self.conn.read(&mut buf, self.reader_timeout) {
                Ok(n) => n,
                Err(NetError::Timeout(_)) => continue,
                Err(e) => {
                    log::error!("sftp reader task: {e}");
                    self.mark_dead();
                    return;
                }
            };
            if n == 0 {
                log::debug!("sftp reader task: connection closed");
                self.mark_dead();
                return;
            }
            frame.feed(&buf[..n]);
            loop {
                match frame.pop_packet() {
                    Ok(Some((header, payload))) => {
                        self.stats.incoming(header.length as u64 + 4);
                        if self.pool.serve(header.id, (header.packet_type, payload)).is_err() {
                            log::warn!("sftp: reply for unknown request id {}", header.id);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        log::error!("sftp reader task: {e}");
                        self.mark_dead();
                        return;
                    }
                }
            }
        }
    }

    fn mark_dead(&self) {
        if !self.dead.swap(true, Ordering::SeqCst) {
            self.pool.shutdown("connection lost");
            if let Some(cb) = self.connection_dropped_callback.lock().unwrap().as_ref() {
                cb();
            }
            let _ = self.conn.shutdown(ShutdownDirection::Both);
        }
    }

    fn check_alive(&self) -> Result<()> {
        if self.dead.load(Ordering::SeqCst) {
            Err(NetError::Dead)
        } else {
            Ok(())
        }
    }

    fn fail_protocol(&self, message: String) -> NetError {
        self.mark_dead();
        NetError::Protocol(message)
    }

    fn server_status_error(&self, status: u32) -> NetError {
        let message = Status::try_from(status)
            .map(|s| s.to_string())
            .unwrap_or_else(|_| format!("unknown status {status}"));
        NetError::ServerStatus { status, message }
    }

    /// Request dispatch: builds a packet,
    /// registers it in the request pool, sends it under the write mutex,
    /// then blocks until the reader task serves the matching id. The
    /// request pool is keyed by id, so an id mismatch between request and
    /// reply cannot occur here by construction — a stray reply with no
    /// matching id just logs a warning in the reader task and is discarded.
    fn send_request(
        &self,
        packet_type: u8,
        build: impl FnOnce(&mut PacketBuilder),
    ) -> Result<(u8, Vec<u8>)> {
        self.check_alive()?;

        let id = self.ids.next_id();
        let mut b = PacketBuilder::new(packet_type, id);
        build(&mut b);
        let wire = b.finish();

        self.pool.push(id)?;

        if let Err(e) = self.write_all(&wire) {
            self.pool.remove(id);
            self.mark_dead();
            return Err(e);
        }
        self.stats.outgoing(wire.len() as u64);

        let started = Instant::now();
        let reply = match self.pool.wait(id, None) {
            Ok(reply) => reply,
            Err(e) => return Err(e.into()),
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;
        self.stats.request(wire.len() as u64, elapsed_ms);

        let tick = self.netstat_tick.load(Ordering::Relaxed);
        if tick > 0 && self.stats.request_count() % tick as u64 == 0 {
            if let Some(cb) = self.netstat_callback.lock().unwrap().as_ref() {
                cb(&self.stats);
            }
        }

        Ok(reply)
    }

    fn expect_status_ok(&self, reply_type: u8, payload: &[u8]) -> Result<()> {
        match PacketType::try_from(reply_type) {
            Ok(PacketType::Status) => {
                let status = PacketReader::new(payload).pop_u32()?;
                if status == u32::from(Status::Ok) {
                    Ok(())
                } else {
                    Err(self.server_status_error(status))
                }
            }
            _ => Err(self.fail_protocol(format!(
                "expected SSH_FXP_STATUS, got reply type {reply_type}"
            ))),
        }
    }

    pub fn stats(&self) -> &NetStatistics {
        &self.stats
    }

    pub fn register_netstat_callback(&self, cb: impl Fn(&NetStatistics) + Send + Sync + 'static) {
        *self.netstat_callback.lock().unwrap() = Some(Box::new(cb));
    }

    pub fn register_connection_dropped_callback(&self, cb: impl Fn() + Send + Sync + 'static) {
        *self.connection_dropped_callback.lock().unwrap() = Some(Box::new(cb));
    }

    pub fn sector_size(&self) -> usize {
        self.sector_size.load(Ordering::Relaxed)
    }

    pub fn set_sector_size(&self, size: usize) {
        self.sector_size.store(size, Ordering::Relaxed);
    }

    pub fn set_netstat_tick(&self, tick: u32) {
        self.netstat_tick.store(tick, Ordering::Relaxed);
    }

    pub fn set_partial_threshold(&self, read: Duration, write: Duration) {
        self.partial_read_timeout_ms.store(read.as_millis() as u64, Ordering::Relaxed);
        self.partial_write_timeout_ms.store(write.as_millis() as u64, Ordering::Relaxed);
    }

    fn partial_read_timeout(&self) -> Duration {
        Duration::from_millis(self.partial_read_timeout_ms.load(Ordering::Relaxed))
    }

    fn partial_write_timeout(&self) -> Duration {
        Duration::from_millis(self.partial_write_timeout_ms.load(Ordering::Relaxed))
    }

    /// `SSH_FXP_OPEN` (or `SSH_FXP_OPENDIR` when `is_dir`); handle must be a
    /// length-prefixed 4-byte integer, anything else is a protocol
    /// violation and the session is shut down.
    pub fn open(&self, path: &str, mode: u32, is_dir: bool) -> Result<i64> {
        let packet_type = if is_dir { PacketType::Opendir } else { PacketType::Open };
        let (reply_type, payload) = self.send_request(packet_type.into(), |b| {
            b.push_str(path);
            if !is_dir {
                b.push_u32(mode);
                b.push_u32(0); // attrs: none supplied on open
            }
        })?;

        match PacketType::try_from(reply_type) {
            Ok(PacketType::Handle) => {
                let mut r = PacketReader::new(&payload);
                let handle_len = r.pop_u32()?;
                if handle_len != 4 {
                    return Err(self.fail_protocol(format!(
                        "open: unexpected handle length {handle_len}"
                    )));
                }
                Ok(r.pop_u32()? as i64)
            }
            Ok(PacketType::Status) => {
                let status = PacketReader::new(&payload).pop_u32()?;
                Err(self.server_status_error(status))
            }
            _ => Err(self.fail_protocol(format!("open: unexpected reply type {reply_type}"))),
        }
    }

    pub fn opendir(&self, path: &str) -> Result<i64> {
        self.open(path, 0, true)
    }

    pub fn close(&self, handle: i64) -> Result<()> {
        let (t, p) = self.send_request(PacketType::Close.into(), |b| {
            b.push_u32(4).push_u32(handle as u32);
        })?;
        self.expect_status_ok(t, &p)
    }

    /// Vendor extension `DIRLIGO_MULTICLOSE` (221): closes many handles in
    /// one round trip.
    pub fn multiclose(&self, handles: &[i64]) -> Result<()> {
        let (t, p) = self.send_request(PacketType::DirligoMulticlose.into(), |b| {
            b.push_u32(handles.len() as u32);
            for h in handles {
                b.push_u32(*h as u32);
            }
        })?;
        self.expect_status_ok(t, &p)
    }

    /// Vendor extension `DIRLIGO_RESETDIR` (222): reopens the server-side
    /// directory iterator so `handle` can be re-listed from the start.
    pub fn resetdir(&self, handle: i64) -> Result<()> {
        let (t, p) = self.send_request(PacketType::DirligoResetdir.into(), |b| {
            b.push_u32(4).push_u32(handle as u32);
        })?;
        self.expect_status_ok(t, &p)
    }

    /// Reads into `buf` starting at `offset`, looping one `SSH_FXP_READ`
    /// per sector. A status of EOF terminates normally; cumulative elapsed
    /// time above the partial-read threshold triggers the statistics flag
    /// and returns whatever was read so far.
    pub fn read(&self, handle: i64, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.check_alive()?;
        let mut filled = 0usize;
        let mut off = offset;
        let mut elapsed_total = Duration::ZERO;

        while filled < buf.len() {
            let piece = (buf.len() - filled).min(self.sector_size());
            let started = Instant::now();
            let (reply_type, payload) = self.send_request(PacketType::Read.into(), |b| {
                b.push_u32(4).push_u32(handle as u32).push_u64(off).push_u32(piece as u32);
            })?;
            elapsed_total += started.elapsed();

            match PacketType::try_from(reply_type) {
                Ok(PacketType::Data) => {
                    let data = PacketReader::new(&payload).pop_buf()?;
                    let n = data.len();
                    buf[filled..filled + n].copy_from_slice(&data);
                    filled += n;
                    off += n as u64;
                }
                Ok(PacketType::Status) => {
                    let status = PacketReader::new(&payload).pop_u32()?;
                    if status == u32::from(Status::Eof) {
                        break;
                    }
                    return Err(self.server_status_error(status));
                }
                _ => {
                    return Err(self.fail_protocol(format!(
                        "read: unexpected reply type {reply_type}"
                    )))
                }
            }

            if elapsed_total > self.partial_read_timeout() {
                self.stats.trigger_partial_read();
                break;
            }
        }

        Ok(filled)
    }

    /// Mirror of [`SftpClient::read`]; each sector emits `SSH_FXP_WRITE`
    /// and expects `SSH_FXP_STATUS = OK`.
    pub fn write(&self, handle: i64, buf: &[u8], offset: u64) -> Result<usize> {
        self.check_alive()?;
        let mut sent = 0usize;
        let mut off = offset;
        let mut elapsed_total = Duration::ZERO;

        while sent < buf.len() {
            let piece = (buf.len() - sent).min(self.sector_size());
            let started = Instant::now();
            let (reply_type, payload) = self.send_request(PacketType::Write.into(), |b| {
                b.push_u32(4)
                    .push_u32(handle as u32)
                    .push_u64(off)
                    .push_buf(&buf[sent..sent + piece]);
            })?;
            elapsed_total += started.elapsed();

            self.expect_status_ok(reply_type, &payload)?;
            sent += piece;
            off += piece as u64;

            if elapsed_total > self.partial_write_timeout() {
                self.stats.trigger_partial_write();
                break;
            }
        }

        Ok(sent)
    }

    /// `SSH_FXP_STAT_VERSION_0` (type 7, aliased `LSTAT` on the wire).
    pub fn stat(&self, path: &str) -> Result<Attrs> {
        let (t, p) = self.send_request(PacketType::Lstat.into(), |b| {
            b.push_str(path);
        })?;
        match PacketType::try_from(t) {
            Ok(PacketType::Attrs) => Ok(Attrs::decode(&mut PacketReader::new(&p))?),
            Ok(PacketType::Status) => {
                let status = PacketReader::new(&p).pop_u32()?;
                Err(self.server_status_error(status))
            }
            _ => Err(self.fail_protocol(format!("stat: unexpected reply type {t}"))),
        }
    }

    /// One `DIRLIGO_READDIR_SHORT` round trip. Returns the batch of entries
    /// in this reply (the sentinel entry named `"..."` is consumed, not
    /// returned) and whether the directory stream has ended.
    pub fn readdir_once(&self, handle: i64) -> Result<(Vec<DirEntry>, bool)> {
        let (t, p) = self.send_request(PacketType::DirligoReaddirShort.into(), |b| {
            b.push_u32(4).push_u32(handle as u32);
        })?;
        let mut r = PacketReader::new(&p);
        match PacketType::try_from(t) {
            Ok(PacketType::Status) => {
                let status = r.pop_u32()?;
                if status == u32::from(Status::Eof) {
                    Ok((Vec::new(), true))
                } else {
                    Err(self.server_status_error(status))
                }
            }
            Ok(PacketType::Name) => {
                let count = r.pop_u32()?;
                let mut entries = Vec::with_capacity(count as usize);
                let mut done = false;
                for _ in 0..count {
                    let name = r.pop_str()?;
                    let long_name = r.pop_str()?;
                    let attrs = Attrs::decode(&mut r)?;
                    if name == "..." {
                        done = true;
                        continue;
                    }
                    entries.push(DirEntry { name, long_name, attrs });
                }
                Ok((entries, done))
            }
            _ => Err(self.fail_protocol(format!("readdir: unexpected reply type {t}"))),
        }
    }

    /// Loops [`SftpClient::readdir_once`] until the stream ends, collecting
    /// every batch.
    pub fn readdir(&self, handle: i64) -> Result<Vec<DirEntry>> {
        let mut all = Vec::new();
        loop {
            let (mut entries, done) = self.readdir_once(handle)?;
            all.append(&mut entries);
            if done {
                break;
            }
        }
        Ok(all)
    }

    pub fn mkdir(&self, path: &str) -> Result<()> {
        let (t, p) = self.send_request(PacketType::Mkdir.into(), |b| {
            b.push_str(path).push_u32(0); // no attrs supplied
        })?;
        self.expect_status_ok(t, &p)
    }

    pub fn remove(&self, path: &str) -> Result<()> {
        let (t, p) = self.send_request(PacketType::Remove.into(), |b| {
            b.push_str(path);
        })?;
        self.expect_status_ok(t, &p)
    }

    pub fn rmdir(&self, path: &str) -> Result<()> {
        let (t, p) = self.send_request(PacketType::Rmdir.into(), |b| {
            b.push_str(path);
        })?;
        self.expect_status_ok(t, &p)
    }

    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        let (t, p) = self.send_request(PacketType::Rename.into(), |b| {
            b.push_str(from).push_str(to);
        })?;
        self.expect_status_ok(t, &p)
    }

    /// `SSH_FXP_EXTENDED` carrying `"statvfs@openssh.com"`.
    pub fn statvfs(&self, path: &str) -> Result<Statvfs> {
        let (t, p) = self.send_request(PacketType::Extended.into(), |b| {
            b.push_str("statvfs@openssh.com").push_str(path);
        })?;
        match PacketType::try_from(t) {
            Ok(PacketType::ExtendedReply) => {
                let mut r = PacketReader::new(&p);
                Ok(Statvfs {
                    bsize: r.pop_u64()?,
                    frsize: r.pop_u64()?,
                    blocks: r.pop_u64()?,
                    bfree: r.pop_u64()?,
                    bavail: r.pop_u64()?,
                    files: r.pop_u64()?,
                    ffree: r.pop_u64()?,
                    favail: r.pop_u64()?,
                    fsid: r.pop_u64()?,
                    flag: r.pop_u64()?,
                    namemax: r.pop_u64()?,
                })
            }
            Ok(PacketType::Status) => {
                let status = PacketReader::new(&p).pop_u32()?;
                Err(self.server_status_error(status))
            }
            _ => Err(self.fail_protocol(format!("statvfs: unexpected reply type {t}"))),
        }
    }

    /// Vendor extension `DIRLIGO_CREATEFILE` (220): opens with Windows
    /// `CreateFile`-shaped access/share/create/flags masks. Returns the
    /// handle with [`DIRLIGO_DIR_FLAG`] masked out, plus whether that bit
    /// was set.
    pub fn createfile(
        &self,
        path: &str,
        access: u32,
        shared: u32,
        create: u32,
        flags: u32,
    ) -> Result<(i64, bool)> {
        let (t, p) = self.send_request(PacketType::DirligoCreatefile.into(), |b| {
            b.push_str(path).push_u32(access).push_u32(shared).push_u32(create).push_u32(flags);
        })?;
        match PacketType::try_from(t) {
            Ok(PacketType::Handle) => {
                let mut r = PacketReader::new(&p);
                let _len = r.pop_u32()?;
                let raw = r.pop_u32()? as i32;
                let is_dir = raw & DIRLIGO_DIR_FLAG != 0;
                Ok(((raw & !DIRLIGO_DIR_FLAG) as i64, is_dir))
            }
            Ok(PacketType::Status) => {
                let status = PacketReader::new(&p).pop_u32()?;
                Err(self.server_status_error(status))
            }
            _ => Err(self.fail_protocol(format!("createfile: unexpected reply type {t}"))),
        }
    }

    /// `DIRLIGO_APPEND` (223) is reserved on the wire but was never
    /// implemented server-side upstream; kept as an explicit stub rather
    /// than silently falling back to `write` at some offset.
    pub fn append(&self, _handle: i64, _buf: &[u8]) -> Result<usize> {
        Err(NetError::Protocol(
            "DIRLIGO_APPEND is reserved but not implemented by any known server".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::TcpConnection;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    /// Drives a minimal SFTPv3 handshake + one `stat` round trip over a
    /// loopback socket, acting as the server side by hand.
    #[test]
    fn connect_and_stat_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();

            // INIT
            let mut header = [0u8; 9];
            sock.read_exact(&mut header).unwrap();
            let mut version_payload = [0u8; 4];
            sock.read_exact(&mut version_payload).unwrap();

            // VERSION reply
            let mut b = PacketBuilder::new(PacketType::Version.into(), 0);
            b.push_u32(3);
            sock.write_all(&b.finish()).unwrap();

            // STAT request
            let mut header = [0u8; 9];
            sock.read_exact(&mut header).unwrap();
            let len = u32::from_be_bytes(header[0..4].try_into().unwrap()) as usize;
            let mut rest = vec![0u8; len - 5];
            sock.read_exact(&mut rest).unwrap();
            let id = u32::from_be_bytes(header[5..9].try_into().unwrap());

            let mut reply = PacketBuilder::new(PacketType::Attrs.into(), id);
            let attrs = Attrs {
                size: Some(42),
                ..Default::default()
            };
            attrs.encode(&mut reply);
            sock.write_all(&reply.finish()).unwrap();
        });

        let conn: Arc<dyn Connection> = Arc::new(TcpConnection::connect(addr, Duration::from_secs(2)).unwrap());
        let client = SftpClient::connect(conn, SftpClientConfig::default()).unwrap();
        let attrs = client.stat("/some/path").unwrap();
        assert_eq!(attrs.size, Some(42));

        server.join().unwrap();
    }

    #[test]
    fn createfile_masks_directory_bit() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut header = [0u8; 9];
            sock.read_exact(&mut header).unwrap();
            let mut rest = [0u8; 4];
            sock.read_exact(&mut rest).unwrap();
            let mut b = PacketBuilder::new(PacketType::Version.into(), 0);
            b.push_u32(3);
            sock.write_all(&b.finish()).unwrap();

            let mut header = [0u8; 9];
            sock.read_exact(&mut header).unwrap();
            let len = u32::from_be_bytes(header[0..4].try_into().unwrap()) as usize;
            let mut rest = vec![0u8; len - 5];
            sock.read_exact(&mut rest).unwrap();
            let id = u32::from_be_bytes(header[5..9].try_into().unwrap());

            let mut reply = PacketBuilder::new(PacketType::Handle.into(), id);
            reply.push_u32(4);
            reply.push_u32((7i32 | DIRLIGO_DIR_FLAG) as u32);
            sock.write_all(&reply.finish()).unwrap();
        });

        let conn: Arc<dyn Connection> = Arc::new(TcpConnection::connect(addr, Duration::from_secs(2)).unwrap());
        let client = SftpClient::connect(conn, SftpClientConfig::default()).unwrap();
        let (handle, is_dir) = client.createfile("/d", 0, 0, 0, 0).unwrap();
        assert_eq!(handle, 7);
        assert!(is_dir);

        server.join().unwrap();
    }

    /// Closing the server socket after a successful handshake should surface
    /// as a clean EOF to the reader task, which marks the client dead;
    /// further requests must then fail fast instead of hanging.
    #[test]
    fn dead_client_rejects_new_requests() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut header = [0u8; 9];
            sock.read_exact(&mut header).unwrap();
            let mut rest = [0u8; 4];
            sock.read_exact(&mut rest).unwrap();
            let mut b = PacketBuilder::new(PacketType::Version.into(), 0);
            b.push_u32(3);
            sock.write_all(&b.finish()).unwrap();
            // drop(sock) on return closes the connection cleanly.
        });

        let conn: Arc<dyn Connection> = Arc::new(TcpConnection::connect(addr, Duration::from_secs(2)).unwrap());
        let client = SftpClient::connect(conn, SftpClientConfig::default()).unwrap();
        server.join().unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            match client.stat("/some/path") {
                Err(NetError::Dead) => break,
                Err(_) | Ok(_) if Instant::now() < deadline => {
                    thread::sleep(Duration::from_millis(10));
                }
                other => panic!("expected NetError::Dead, got {other:?}"),
            }
        }
    }
}
