//! DTLS record layer bolted onto an underlying I/O strategy.
//!
//! The DTLS primitive is consumed through exactly four functions —
//! `handshake_step`, `encrypt`, `decrypt`, `is_established` — backed here
//! by `openssl`'s blocking-handshake API driven over an in-memory `Read +
//! Write` pair standing in for a "read-direction"/"write-direction
//! memory BIO". `openssl::ssl::Ssl::connect`/`accept` return
//! `HandshakeError::WouldBlock(MidHandshakeSslStream)` whenever the
//! memory pair has no more bytes to give — which is exactly "drive the
//! session one step".

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use openssl::ssl::{HandshakeError, MidHandshakeSslStream, Ssl, SslContext, SslMethod, SslStream};

use super::{Connection, ConnectionState, ShutdownDirection, StateCell};
use crate::error::{NetError, Result};

/// Which side of the handshake this session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// How ciphertext reaches the peer.
pub enum IoStrategy {
    /// The caller drives the loop by hand: feed received bytes in, take
    /// bytes to send back out.
    None,
    /// A pair of user callbacks provides send/receive.
    Callbacks(Box<dyn DtlsTransport>),
    /// A raw file-descriptor pair (represented here as any `DtlsTransport`
    /// impl backed by a pipe).
    FdPair(Box<dyn DtlsTransport>),
    /// An existing [`Connection`] (typically a [`super::TcpConnection`]).
    Socket(Arc<dyn Connection>),
}

/// The underlying transport used to move ciphertext to and from the peer,
/// for the `Callbacks`/`FdPair` strategies.
pub trait DtlsTransport: Send + Sync {
    fn send(&self, bytes: &[u8]) -> Result<()>;
    /// Non-blocking: returns `Ok(0)` if nothing is available right now.
    fn try_recv(&self, buf: &mut [u8]) -> Result<usize>;
}

/// In-memory stand-in for the DTLS session's two memory BIOs: bytes
/// written by the `Ssl` engine land in `outgoing` (write-direction);
/// bytes fed in from the peer are appended to `incoming` (read-direction)
/// for the engine to consume.
#[derive(Default)]
struct MemoryIo {
    incoming: VecDeque<u8>,
    outgoing: VecDeque<u8>,
}

impl Read for MemoryIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.incoming.is_empty() {
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "no ciphertext yet"));
        }
        let n = buf.len().min(self.incoming.len());
        for slot in buf.iter_mut().take(n) {
            *slot = self.incoming.pop_front().unwrap();
        }
        Ok(n)
    }
}

impl Write for MemoryIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.outgoing.extend(buf.iter().copied());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

enum Handshake {
    InProgress(MidHandshakeSslStream<MemoryIo>),
    Established(SslStream<MemoryIo>),
}

/// Handshake sub-state: which half of one cooperative step is
/// next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Write,
    Read,
    Established,
}

/// Outcome of one [`SecureConnection::handshake_step`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    InProgress,
    Done,
}

pub struct SecureConnection {
    handshake: Mutex<Option<Handshake>>,
    role: Role,
    phase: Mutex<Phase>,
    transport: Mutex<IoStrategy>,
    state: StateCell,
}

impl SecureConnection {
    fn new(ssl: Ssl, role: Role, transport: IoStrategy) -> Result<Self> {
        let io = MemoryIo::default();
        let handshake = match role {
            Role::Client => ssl.connect(io),
            Role::Server => ssl.accept(io),
        };
        let handshake = match handshake {
            Ok(stream) => Handshake::Established(stream),
            Err(HandshakeError::WouldBlock(mid)) => Handshake::InProgress(mid),
            Err(e) => return Err(NetError::Tls(e.to_string())),
        };
        // Client drives first (HANDSHAKE_WRITE), server waits to read
        // first (HANDSHAKE_READ).
        let phase = match (&handshake, role) {
            (Handshake::Established(_), _) => Phase::Established,
            (_, Role::Client) => Phase::Write,
            (_, Role::Server) => Phase::Read,
        };
        Ok(SecureConnection {
            handshake: Mutex::new(Some(handshake)),
            role,
            phase: Mutex::new(phase),
            transport: Mutex::new(transport),
            state: StateCell::new(ConnectionState::Pending),
        })
    }

    pub fn client(ctx: &SslContext, transport: IoStrategy) -> Result<Self> {
        let ssl = Ssl::new(ctx).map_err(|e| NetError::Tls(e.to_string()))?;
        Self::new(ssl, Role::Client, transport)
    }

    pub fn server(ctx: &SslContext, transport: IoStrategy) -> Result<Self> {
        let ssl = Ssl::new(ctx).map_err(|e| NetError::Tls(e.to_string()))?;
        Self::new(ssl, Role::Server, transport)
    }

    pub fn is_established(&self) -> bool {
        matches!(*self.phase.lock().unwrap(), Phase::Established)
    }

    fn io_mut<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut MemoryIo) -> R,
    {
        let mut hs = self.handshake.lock().unwrap();
        match hs.as_mut().expect("handshake state missing") {
            Handshake::InProgress(mid) => f(mid.get_mut()),
            Handshake::Established(stream) => f(stream.get_mut()),
        }
    }

    fn pull_from_transport(&self) -> Result<usize> {
        let mut buf = [0u8; 2048];
        let transport = self.transport.lock().unwrap();
        let n = match &*transport {
            IoStrategy::Socket(conn) => conn.read(&mut buf, Some(Duration::from_millis(20)))?,
            IoStrategy::Callbacks(t) | IoStrategy::FdPair(t) => t.try_recv(&mut buf)?,
            IoStrategy::None => 0,
        };
        if n > 0 {
            self.io_mut(|io| io.incoming.extend(buf[..n].iter().copied()));
        }
        Ok(n)
    }

    fn push_to_transport(&self) -> Result<()> {
        let pending: Vec<u8> = self.io_mut(|io| io.outgoing.drain(..).collect());
        if pending.is_empty() {
            return Ok(());
        }
        let transport = self.transport.lock().unwrap();
        match &*transport {
            IoStrategy::Socket(conn) => {
                let mut off = 0;
                while off < pending.len() {
                    let n = conn.write(&pending[off..], Some(Duration::from_secs(5)))?;
                    if n == 0 {
                        return Err(NetError::Protocol("peer closed during handshake".into()));
                    }
                    off += n;
                }
            }
            IoStrategy::Callbacks(t) | IoStrategy::FdPair(t) => t.send(&pending)?,
            IoStrategy::None => {
                // Caller takes it via `take_outgoing`; put it back.
                self.io_mut(|io| io.outgoing.extend(pending));
            }
        }
        Ok(())
    }

    /// Bytes the session wants to send, for [`IoStrategy::None`] callers.
    pub fn take_outgoing(&self) -> Vec<u8> {
        self.io_mut(|io| io.outgoing.drain(..).collect())
    }

    /// Feeds received ciphertext in, for [`IoStrategy::None`] callers.
    pub fn feed_incoming(&self, bytes: &[u8]) {
        self.io_mut(|io| io.incoming.extend(bytes.iter().copied()));
    }

    fn drive_once(&self) -> Result<StepOutcome> {
        let mut hs = self.handshake.lock().unwrap();
        let mid = match hs.take().expect("handshake state missing") {
            Handshake::Established(stream) => {
                *hs = Some(Handshake::Established(stream));
                return Ok(StepOutcome::Done);
            }
            Handshake::InProgress(mid) => mid,
        };
        match mid.handshake() {
            Ok(stream) => {
                *hs = Some(Handshake::Established(stream));
                Ok(StepOutcome::Done)
            }
            Err(HandshakeError::WouldBlock(mid)) => {
                *hs = Some(Handshake::InProgress(mid));
                Ok(StepOutcome::InProgress)
            }
            Err(e) => Err(NetError::Tls(e.to_string())),
        }
    }

    /// One cooperative step of the handshake algorithm. Drains the
    /// write-direction BIO to the transport, or pulls bytes in for the
    /// engine to consume, alternating `Phase::Write`/`Phase::Read` until
    /// the handshake completes.
    pub fn handshake_step(&self) -> Result<StepOutcome> {
        if self.is_established() {
            return Ok(StepOutcome::Done);
        }
        let phase = *self.phase.lock().unwrap();
        match phase {
            Phase::Write => {
                let outcome = self.drive_once()?;
                self.push_to_transport()?;
                if outcome == StepOutcome::Done {
                    *self.phase.lock().unwrap() = Phase::Established;
                    self.state.set(ConnectionState::Established);
                    if self.role == Role::Server {
                        self.send_server_ok()?;
                    }
                } else {
                    *self.phase.lock().unwrap() = Phase::Read;
                }
                Ok(outcome)
            }
            Phase::Read => {
                self.pull_from_transport()?;
                let outcome = self.drive_once()?;
                if outcome == StepOutcome::Done {
                    if self.role == Role::Client {
                        self.expect_client_ok()?;
                    }
                    *self.phase.lock().unwrap() = Phase::Established;
                    self.state.set(ConnectionState::Established);
                    if self.role == Role::Server {
                        self.send_server_ok()?;
                    }
                } else {
                    *self.phase.lock().unwrap() = Phase::Write;
                }
                Ok(outcome)
            }
            Phase::Established => Ok(StepOutcome::Done),
        }
    }

    /// Runs [`Self::handshake_step`] until established or `deadline`
    /// elapses (each step gets its own bounded budget; callers pass the
    /// overall deadline here).
    pub fn handshake(&self, deadline: Instant) -> Result<()> {
        while !self.is_established() {
            if Instant::now() >= deadline {
                return Err(NetError::Timeout(Duration::ZERO));
            }
            self.handshake_step()?;
        }
        Ok(())
    }

    /// In server role, the last handshake step must deliver a literal
    /// two-byte "OK" to the peer.
    fn send_server_ok(&self) -> Result<()> {
        let cipher = self.encrypt(b"OK")?;
        let transport = self.transport.lock().unwrap();
        match &*transport {
            IoStrategy::Socket(conn) => {
                conn.write(&cipher, Some(Duration::from_secs(5)))?;
            }
            IoStrategy::Callbacks(t) | IoStrategy::FdPair(t) => t.send(&cipher)?,
            IoStrategy::None => self.io_mut(|io| io.outgoing.extend(cipher)),
        }
        Ok(())
    }

    /// Reads the literal "OK" the server sends as its last handshake step.
    /// `openssl` typically reads ahead past the final
    /// handshake flight, so the "OK" record is often already buffered
    /// inside the just-established `SslStream` with nothing left to pull
    /// from the transport — try decrypting what's already there first and
    /// only fall back to pulling fresh bytes if that comes up empty.
    fn expect_client_ok(&self) -> Result<()> {
        let deadline = Instant::now() + Duration::from_secs(30);
        loop {
            let plain = self.decrypt(&[])?;
            if !plain.is_empty() {
                if plain != b"OK" {
                    return Err(NetError::Protocol(
                        "server did not send OK after handshake".into(),
                    ));
                }
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(NetError::Timeout(Duration::ZERO));
            }
            self.pull_from_transport()?;
        }
    }

    pub fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>> {
        let mut hs = self.handshake.lock().unwrap();
        match hs.as_mut().expect("handshake state missing") {
            Handshake::Established(stream) => {
                stream
                    .write_all(plain)
                    .map_err(|e| NetError::Tls(e.to_string()))?;
                Ok(stream.get_mut().outgoing.drain(..).collect())
            }
            Handshake::InProgress(_) => Err(NetError::Protocol("handshake not complete".into())),
        }
    }

    pub fn decrypt(&self, cipher: &[u8]) -> Result<Vec<u8>> {
        let mut hs = self.handshake.lock().unwrap();
        match hs.as_mut().expect("handshake state missing") {
            Handshake::Established(stream) => {
                stream.get_mut().incoming.extend(cipher.iter().copied());
                let mut out = Vec::new();
                let mut buf = [0u8; 2048];
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => out.extend_from_slice(&buf[..n]),
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) => return Err(NetError::Tls(e.to_string())),
                    }
                }
                Ok(out)
            }
            Handshake::InProgress(_) => Err(NetError::Protocol("handshake not complete".into())),
        }
    }
}

impl Connection for SecureConnection {
    fn write(&self, buf: &[u8], timeout: Option<Duration>) -> Result<usize> {
        if !self.is_established() {
            return Err(NetError::Protocol("write before handshake complete".into()));
        }
        let cipher = self.encrypt(buf)?;
        let transport = self.transport.lock().unwrap();
        match &*transport {
            IoStrategy::Socket(conn) => conn.write(&cipher, timeout),
            IoStrategy::Callbacks(t) | IoStrategy::FdPair(t) => {
                t.send(&cipher)?;
                Ok(buf.len())
            }
            IoStrategy::None => {
                self.io_mut(|io| io.outgoing.extend(cipher));
                Ok(buf.len())
            }
        }
    }

    fn read(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        if !self.is_established() {
            return Err(NetError::Protocol("read before handshake complete".into()));
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let n = self.pull_from_transport()?;
            if n > 0 {
                let plain = self.decrypt(&[])?;
                let copy = plain.len().min(buf.len());
                buf[..copy].copy_from_slice(&plain[..copy]);
                return Ok(copy);
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Ok(0);
                }
            }
        }
    }

    fn cancel(&self) {
        if let IoStrategy::Socket(conn) = &*self.transport.lock().unwrap() {
            conn.cancel();
        }
    }

    fn shutdown(&self, direction: ShutdownDirection) -> Result<()> {
        self.state.set(ConnectionState::Dead);
        if let IoStrategy::Socket(conn) = &*self.transport.lock().unwrap() {
            conn.shutdown(direction)?;
        }
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }

    fn wait_for_state(&self, target: ConnectionState, timeout: Duration) -> Result<()> {
        self.state.wait_for(target, timeout)
    }

    fn set_no_delay(&self, enabled: bool) -> Result<()> {
        if let IoStrategy::Socket(conn) = &*self.transport.lock().unwrap() {
            return conn.set_no_delay(enabled);
        }
        Ok(())
    }

    fn set_keepalive(&self, seconds: Option<u32>) -> Result<()> {
        if let IoStrategy::Socket(conn) = &*self.transport.lock().unwrap() {
            return conn.set_keepalive(seconds);
        }
        Ok(())
    }

    fn peer_description(&self) -> Option<String> {
        match &*self.transport.lock().unwrap() {
            IoStrategy::Socket(conn) => conn.peer_description(),
            _ => None,
        }
    }
}

pub fn new_client_context() -> Result<SslContext> {
    let builder = SslContext::builder(SslMethod::dtls()).map_err(|e| NetError::Tls(e.to_string()))?;
    Ok(builder.build())
}

/// Builds a server-side context from a certificate/key pair. Certificate
/// provisioning is left entirely to the caller.
pub fn new_server_context(
    cert: &openssl::x509::X509,
    key: &openssl::pkey::PKeyRef<openssl::pkey::Private>,
) -> Result<SslContext> {
    let mut builder =
        SslContext::builder(SslMethod::dtls()).map_err(|e| NetError::Tls(e.to_string()))?;
    builder
        .set_certificate(cert)
        .map_err(|e| NetError::Tls(e.to_string()))?;
    builder
        .set_private_key(key)
        .map_err(|e| NetError::Tls(e.to_string()))?;
    Ok(builder.build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use openssl::hash::MessageDigest;
    use openssl::pkey::PKey;
    use openssl::rsa::Rsa;
    use openssl::x509::X509;

    fn self_signed_pair() -> (X509, openssl::pkey::PKey<openssl::pkey::Private>) {
        let rsa = Rsa::generate(2048).unwrap();
        let key = PKey::from_rsa(rsa).unwrap();

        let mut name_builder = openssl::x509::X509NameBuilder::new().unwrap();
        name_builder.append_entry_by_text("CN", "dirligo-test").unwrap();
        let name = name_builder.build();

        let mut builder = X509::builder().unwrap();
        builder.set_version(2).unwrap();
        let serial = openssl::bn::BigNum::from_u32(1)
            .unwrap()
            .to_asn1_integer()
            .unwrap();
        builder.set_serial_number(&serial).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(&key).unwrap();
        let not_before = openssl::asn1::Asn1Time::days_from_now(0).unwrap();
        let not_after = openssl::asn1::Asn1Time::days_from_now(1).unwrap();
        builder.set_not_before(&not_before).unwrap();
        builder.set_not_after(&not_after).unwrap();
        builder.sign(&key, MessageDigest::sha256()).unwrap();
        (builder.build(), key)
    }

    /// Pumps both sides' `handshake_step` by hand, shuttling bytes through
    /// `take_outgoing`/`feed_incoming` instead of a real socket — this is
    /// the `IoStrategy::None` case for callers that drive the loop
    /// themselves.
    fn run_handshake(client: &SecureConnection, server: &SecureConnection) {
        for _ in 0..100 {
            if client.is_established() && server.is_established() {
                return;
            }
            if !client.is_established() {
                client.handshake_step().unwrap();
                let out = client.take_outgoing();
                if !out.is_empty() {
                    server.feed_incoming(&out);
                }
            }
            if !server.is_established() {
                server.handshake_step().unwrap();
                let out = server.take_outgoing();
                if !out.is_empty() {
                    client.feed_incoming(&out);
                }
            }
        }
        panic!("handshake did not converge within 100 steps");
    }

    #[test]
    fn handshake_establishes_both_sides_and_transfers_ciphertext() {
        let (cert, key) = self_signed_pair();
        let client_ctx = new_client_context().unwrap();
        let server_ctx = new_server_context(&cert, &key).unwrap();

        let client = SecureConnection::client(&client_ctx, IoStrategy::None).unwrap();
        let server = SecureConnection::server(&server_ctx, IoStrategy::None).unwrap();

        run_handshake(&client, &server);

        assert!(client.is_established());
        assert!(server.is_established());
        assert_eq!(client.state(), ConnectionState::Established);
        assert_eq!(server.state(), ConnectionState::Established);

        let cipher = client.encrypt(b"ping").unwrap();
        server.feed_incoming(&cipher);
        let plain = server.decrypt(&[]).unwrap();
        assert_eq!(plain, b"ping");
    }
}
