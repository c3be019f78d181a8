use std::error::Error;

use clap::Parser;

use crate::cli::Cli;
use crate::session;

#[derive(Parser, Debug)]
pub struct LsCmd {
    /// Remote directory to list.
    pub path: String,
}

pub fn ls(cmd: &LsCmd, cli: &Cli) -> Result<(), Box<dyn Error>> {
    let client = session::connect(cli)?;

    let handle = client.opendir(&cmd.path)?;
    let entries = client.readdir(handle)?;
    client.close(handle)?;

    for entry in entries {
        println!("{}", entry.long_name);
    }

    Ok(())
}
