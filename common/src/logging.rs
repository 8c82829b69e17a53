// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Root-logger construction shared by all of the daemons and their tests.

use std::fs::OpenOptions;
use std::str::FromStr;

use anyhow::Context;
use slog::Drain;

/// Output log info in unstructured text or json?
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Human,
    Json,
}

impl Default for LogFormat {
    fn default() -> Self {
        LogFormat::Json
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "human" => Ok(LogFormat::Human),
            "json" => Ok(LogFormat::Json),
            _ => Err(format!("invalid log format: {s}")),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            LogFormat::Human => write!(f, "human"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

/// Build the root logger.  The log goes to `log_file` if one is given and to
/// stdout otherwise; the `unit` key identifies the daemon in aggregated
/// output.
pub fn init(
    unit: &str,
    log_file: &Option<String>,
    log_format: LogFormat,
) -> anyhow::Result<slog::Logger> {
    let drain = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {path}"))?;
            build_drain(file, log_format)
        }
        None => build_drain(std::io::stdout(), log_format),
    };

    let async_drain =
        slog_async::Async::new(drain).chan_size(8192).build().fuse();
    Ok(slog::Logger::root(
        async_drain,
        slog::o!("unit" => unit.to_string()),
    ))
}

fn build_drain<W>(
    out: W,
    format: LogFormat,
) -> Box<dyn Drain<Ok = (), Err = slog::Never> + Send>
where
    W: std::io::Write + Send + 'static,
{
    match format {
        LogFormat::Human => {
            let decorator = slog_term::PlainDecorator::new(out);
            Box::new(slog_term::FullFormat::new(decorator).build().fuse())
        }
        LogFormat::Json => {
            Box::new(slog_bunyan::with_name("oltd", out).build().fuse())
        }
    }
}
