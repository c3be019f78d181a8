use clap::{Parser, Subcommand};

use crate::{get::GetCmd, ls::LsCmd, put::PutCmd, stat::StatCmd};

#[derive(Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Host or IP address of the SFTP server.
    pub host: String,

    #[arg(short, long, default_value_t = 22)]
    pub port: u16,

    /// Connection + handshake timeout, in seconds.
    #[arg(short, long, default_value_t = 10)]
    pub timeout: u64,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Downloads a remote file.
    Get(GetCmd),
    /// Uploads a local file.
    Put(PutCmd),
    /// Lists a remote directory.
    Ls(LsCmd),
    /// Retrieves attributes for a remote path.
    Stat(StatCmd),
}
