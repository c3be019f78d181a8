use std::error::Error;

use clap::Parser;

use crate::cli::Cli;
use crate::session;

#[derive(Parser, Debug)]
pub struct StatCmd {
    /// Remote path to stat.
    pub path: String,
}

pub fn stat(cmd: &StatCmd, cli: &Cli) -> Result<(), Box<dyn Error>> {
    let client = session::connect(cli)?;
    let attrs = client.stat(&cmd.path)?;

    println!("path:        {}", cmd.path);
    println!("size:        {}", attrs.size.map(|s| s.to_string()).unwrap_or_else(|| "-".into()));
    println!("uid/gid:     {}/{}", attrs.uid.unwrap_or(0), attrs.gid.unwrap_or(0));
    println!("permissions: {:o}", attrs.permissions.unwrap_or(0));
    println!("directory:   {}", attrs.is_dir());

    Ok(())
}
