use std::error::Error;
use std::path::PathBuf;

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};

use dirligo_net::sftp::JobState;

use crate::cli::Cli;
use crate::session;

#[derive(Parser, Debug)]
pub struct GetCmd {
    /// Remote path to download.
    pub remote: String,
    /// Local destination path.
    pub local: PathBuf,
}

pub fn get(cmd: &GetCmd, cli: &Cli) -> Result<(), Box<dyn Error>> {
    let client = session::connect(cli)?;

    let progress = ProgressBar::new(0);
    progress.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
        )
        .unwrap()
        .progress_chars("#>-"),
    );

    let job = client.download_file(cmd.remote.clone(), cmd.local.clone());

    ctrlc::set_handler({
        let job = job.clone();
        move || {
            log::info!("cancellation requested, stopping download...");
            job.cancel();
        }
    })?;

    loop {
        let stats = job.statistics();
        progress.set_length(stats.total_bytes.max(1));
        progress.set_position(stats.processed_bytes);
        match job.state() {
            JobState::Finished | JobState::Error | JobState::Stopped => break,
            _ => std::thread::sleep(std::time::Duration::from_millis(100)),
        }
    }

    match job.state() {
        JobState::Finished => {
            progress.finish_with_message("download complete");
            Ok(())
        }
        JobState::Stopped => {
            progress.abandon_with_message("download cancelled");
            Err("download cancelled".into())
        }
        _ => {
            let message = job.error_message().unwrap_or_else(|| "unknown error".into());
            progress.abandon_with_message("download failed");
            Err(message.into())
        }
    }
}
