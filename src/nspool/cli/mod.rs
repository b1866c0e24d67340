/*
 * Copyright (C) 2025 The Nspool Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

pub mod nsexec;
pub mod start;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::nspool::logger::{log_error, LogFormat};
use crate::nspool::namespace::NsFunctionRegistry;

/// Daemon that pre-builds pools of ready-to-join kernel namespaces so
/// serverless containers skip namespace construction on the start path.
#[derive(Parser)]
#[command(name = "nspoold")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = env!("CARGO_PKG_DESCRIPTION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the daemon
    Start(StartArgs),

    /// Internal re-exec target that creates or enters a namespace and runs
    /// a registered namespace function
    #[command(hide = true)]
    Nsexec(NsexecArgs),
}

#[derive(Args)]
pub struct StartArgs {
    /// Daemon state directory (default: NSPOOL_ROOT or /var/lib/nspool)
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Log output format
    #[arg(long, default_value = "text")]
    pub log_format: String,

    /// Log verbosity: debug, info, warn or error
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

#[derive(Args)]
pub struct NsexecArgs {
    /// Source (lower) dir of the overlay mount in a new mount namespace
    #[arg(long)]
    pub src: Option<String>,

    /// Bundle directory, for mount namespace functions
    #[arg(long)]
    pub bundle: Option<String>,

    /// Checkpoint directory holding the images to replay
    #[arg(long)]
    pub checkpoint: Option<String>,

    /// Registered function key; empty to only create/enter the namespace
    pub function_key: String,

    /// Namespace type: ipc, uts, mnt or net
    pub ns_type: String,
}

/// Runs the parsed command line and returns the process exit code.
pub fn run(cli: Cli) -> i32 {
    match cli.command {
        Commands::Start(args) => match start::run(&args) {
            Ok(()) => 0,
            Err(e) => {
                log_error("main", "daemon failed", &[("error", &e.to_string())]);
                1
            }
        },
        Commands::Nsexec(args) => nsexec::run(&args, &NsFunctionRegistry::standard()),
    }
}

pub fn parse_log_format(value: &str) -> LogFormat {
    match value {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    }
}

pub fn parse_log_level(value: &str) -> log::LevelFilter {
    match value {
        "debug" => log::LevelFilter::Debug,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        _ => log::LevelFilter::Info,
    }
}
