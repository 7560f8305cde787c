// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    io,
    process::ExitCode,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing::{error, level_filters::LevelFilter};

use crate::{config::Config, pipeline};

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum LogFormat {
    Short,
    Long,
}

/// Fetch the latest official OTA, patch it with the configured root
/// frameworks, and publish the results. All pipeline inputs are passed via
/// OTAFORGE_* environment variables.
#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// Lowest log message severity to output.
    #[arg(long, global = true, value_name = "LEVEL", default_value_t = LevelFilter::INFO)]
    pub log_level: LevelFilter,

    /// Output format for log messages.
    #[arg(
        long,
        global = true,
        value_name = "FORMAT",
        value_enum,
        default_value_t = LogFormat::Short
    )]
    pub log_format: LogFormat,
}

pub fn init_logging(log_level: LevelFilter, log_format: LogFormat) {
    let builder = tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_max_level(log_level);

    match log_format {
        LogFormat::Short => builder.without_time().with_target(false).init(),
        LogFormat::Long => builder.init(),
    }
}

fn run(cancel_signal: &AtomicBool) -> Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;

    pipeline::run(&config, cancel_signal)
}

pub fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.log_level, cli.log_format);

    // A cancel signal lets in-flight downloads stop at a clean point so the
    // scratch directory is never left with files under their final names.
    let cancel_signal = Arc::new(AtomicBool::new(false));
    {
        let signal = cancel_signal.clone();

        ctrlc::set_handler(move || {
            signal.store(true, Ordering::SeqCst);
        })
        .expect("Failed to set signal handler");
    }

    match run(&cancel_signal) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:?}");
            ExitCode::FAILURE
        }
    }
}
