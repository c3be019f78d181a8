//! Wire-level building blocks for the Dirligo SFTP protocol: framing, the
//! packet/status/flag vocabulary, attribute codec, per-session statistics
//! and request/reply correlation.
//!
//! This crate has no network I/O of its own; `dirligo-net` builds
//! connections, the reactor and the SFTP client on top of it.

pub mod attrs;
pub mod error;
pub mod framing;
pub mod packet;
pub mod request_pool;
pub mod stats;

pub use attrs::{Attrs, FileStat};
pub use error::{ProtoError, Result};
pub use framing::{FrameReader, PacketBuilder, PacketHeader, PacketReader, MAX_PACKET_LEN};
pub use packet::{
    attr_flags, open_flags, statvfs_flags, PacketType, Status, DEFAULT_NETSTAT_TICK,
    DEFAULT_PARTIAL_IO_TIMEOUT_SECS, DEFAULT_SECTOR_SIZE, DIRLIGO_DIR_FLAG, SSH2_FILEXFER_VERSION,
};
pub use request_pool::{IdGenerator, RequestPool};
pub use stats::NetStatistics;
