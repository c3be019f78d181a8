mod cli;
mod get;
mod ls;
mod put;
mod session;
mod stat;

use clap::Parser;
use cli::{Cli, Commands};

fn main() {
    env_logger::init();

    let cli = Cli::parse();

    let result = match &cli.command {
        Commands::Get(cmd) => get::get(cmd, &cli),
        Commands::Put(cmd) => put::put(cmd, &cli),
        Commands::Ls(cmd) => ls::ls(cmd, &cli),
        Commands::Stat(cmd) => stat::stat(cmd, &cli),
    };

    if let Err(e) = result {
        log::error!("{e}");
        std::process::exit(1);
    }
}
