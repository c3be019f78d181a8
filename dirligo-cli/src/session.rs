use std::error::Error;
use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;

use dirligo_net::sftp::{SftpClient, SftpClientConfig};
use dirligo_net::Connection;

use crate::cli::Cli;

/// Resolves `cli.host:cli.port`, opens a TCP connection, and completes the
/// SFTPv3 handshake, mirroring `smb-cli`'s per-command `Client::new` +
/// `share_connect` sequence.
pub fn connect(cli: &Cli) -> Result<Arc<SftpClient>, Box<dyn Error>> {
    let timeout = Duration::from_secs(cli.timeout);

    let addr = (cli.host.as_str(), cli.port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| format!("could not resolve {}:{}", cli.host, cli.port))?;

    log::debug!("connecting to {addr}");
    let conn: Arc<dyn Connection> =
        Arc::new(dirligo_net::TcpConnection::connect(addr, timeout)?);
    conn.set_no_delay(true)?;

    let client = SftpClient::connect(conn, SftpClientConfig::default())?;
    client.register_connection_dropped_callback(|| {
        log::warn!("connection to server was lost");
    });

    log::info!("connected to {addr}");
    Ok(client)
}
