//! The SFTPv3 client, its job abstraction and the caching decorator.

mod cached;
mod client;
mod job;

pub use cached::{CachedSftpClient, CachedSftpClientConfig};
pub use client::{
    ConnectionDroppedCallback, DirEntry, NetStatCallback, SftpClient, SftpClientConfig, Statvfs,
};
pub use job::{notify, JobState, NotifyCallback, SftpJob};
