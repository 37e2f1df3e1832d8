// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use oxternals::{
    backend::Backends, path::DEFAULT_DESCRIPTION, Engine, EngineOptions, RunMode, StatusReport,
    SyncState,
};

use anyhow::Result;
use clap::Parser;
use std::{
    io::{stderr, stdout, Write},
    path::PathBuf,
    process::exit,
};
use tracing::{error, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Check out and report status of externals.
#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "oxternals [options] [<component>]...",
    version
)]
struct Cli {
    /// Externals description to start from.
    #[arg(short, long, value_name = "file", default_value = DEFAULT_DESCRIPTION)]
    pub externals: PathBuf,

    /// Only report status of externals without touching them.
    #[arg(short = 'S', long)]
    pub status: bool,

    /// Report local modifications, mismatching references, and actions.
    #[arg(short, long)]
    pub verbose: bool,

    /// Also check out optional externals.
    #[arg(short, long)]
    pub optional: bool,

    /// Restrict run to these top-level externals.
    #[arg(value_name = "component")]
    pub components: Vec<String>,
}

impl Cli {
    fn run(self) -> Result<i32> {
        let mode = match self.status {
            true => RunMode::Status,
            false => RunMode::Checkout,
        };
        let options = EngineOptions {
            mode,
            include_optional: self.optional,
            components: self.components,
        };

        let resolution = Engine::new(Backends::new(), options).run(&self.externals)?;
        let report = StatusReport::new(&resolution).verbose(self.verbose);
        if let Err(error) = write!(stdout(), "{report}") {
            warn!("cannot print status report: {error}");
        }

        if mode == RunMode::Checkout {
            for result in resolution.flatten() {
                if result.after == SyncState::Modified {
                    warn!(
                        "{} has local modifications and was left as is",
                        result.display_path
                    );
                }
            }
        }

        Ok(resolution.exit_code())
    }
}

fn main() {
    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .with_timer(false)
        .without_time()
        .with_writer(stderr);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    match run() {
        Ok(code) => exit(code),
        Err(error) => {
            error!("{error:?}");
            exit(1);
        }
    }
}

fn run() -> Result<i32> {
    Cli::parse().run()
}
