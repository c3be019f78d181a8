//! Connections, the reactor, and the SFTPv3 client built on top of
//! `dirligo-proto`'s wire codec.
//!
//! This crate owns every blocking or background I/O path: `Connection`
//! implementations talk to raw sockets or a DTLS record layer, the reactor
//! drives server-side accept loops, and `sftp` layers the SFTPv3 client, its
//! job abstraction, and a caching decorator on top of a `Connection`.

pub mod address;
pub mod connection;
pub mod error;
pub mod reactor;
pub mod sftp;

pub use address::{parse_address, ParsedAddress};
pub use connection::{Connection, ConnectionState, ShutdownDirection, StateCell, TcpConnection};
#[cfg(feature = "dtls")]
pub use connection::secure::SecureConnection;
pub use error::{NetError, Result};
pub use reactor::{ConnHandle, ConnectionHandler, Reactor, ReactorConfig};
