/* -------------------------------------------------------------------------- *\
 *                |   █████╗ ██╗   ██╗██████╗  █████╗ ███████╗ |              *
 *                |  ██╔══██╗██║   ██║██╔══██╗██╔══██╗██╔════╝ |              *
 *                |  ███████║██║   ██║██████╔╝███████║█████╗   |              *
 *                |  ██╔══██║██║   ██║██╔══██╗██╔══██║██╔══╝   |              *
 *                |  ██║  ██║╚██████╔╝██║  ██║██║  ██║███████╗ |              *
 *                |  ╚═╝  ╚═╝ ╚═════╝ ╚═╝  ╚═╝╚═╝  ╚═╝╚══════╝ |              *
 *                +--------------------------------------------+              *
 *                                                                            *
 *                         Distributed Systems Runtime                        *
 * -------------------------------------------------------------------------- *
 * Copyright 2022 - 2024, the aurae contributors                              *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! Virtual datacenter runtime.
//!
//! Placemat emulates a cluster on a single host: QEMU virtual machines
//! (nodes) and rkt pods are wired together through Linux bridges, tap
//! devices, veth pairs and network namespaces. Every VM gets a virtual BMC
//! through which it can be powered on and off.
//!
//! The binary reads a TOML description of the cluster (see [config]), brings
//! it up with [cluster::ClusterRuntime], runs until SIGINT or SIGTERM, and
//! tears everything down again.
// Lint groups: https://doc.rust-lang.org/rustc/lints/groups.html
#![warn(future_incompatible, nonstandard_style, unused)]
#![warn(
    improper_ctypes,
    non_shorthand_field_patterns,
    no_mangle_generic_items,
    unconditional_recursion,
    unused_comparisons,
    while_true
)]
#![warn(
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_results
)]
#![warn(clippy::unwrap_used)]

use anyhow::Context;
use clap::Parser;
use cluster::ClusterRuntime;
use command::HostCommandRunner;
use config::PlacematConfig;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub mod bmc;
pub mod cluster;
pub mod command;
pub mod config;
pub mod graceful_shutdown;
pub mod host;
pub mod init;
pub mod network;
pub mod pods;
pub mod vms;

const EXIT_OKAY: i32 = 0;
const EXIT_ERROR: i32 = 1;

/// Command line options for placemat.
///
/// Flags override the `[runtime]` section of the configuration file.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct PlacematOptions {
    /// Toggle verbosity. Default false
    #[clap(short, long)]
    verbose: bool,
    /// Cluster configuration (TOML).
    #[clap(short, long, value_parser)]
    config: Option<PathBuf>,
    /// Directory for volumes, NVRAM images and temporary files.
    #[clap(long, value_parser)]
    data_dir: Option<PathBuf>,
    /// Directory holding downloaded images and data files.
    #[clap(long, value_parser)]
    cache_dir: Option<PathBuf>,
    /// Directory for VM control and serial sockets.
    #[clap(long, value_parser)]
    run_dir: Option<PathBuf>,
    /// Redirect VM consoles to unix sockets.
    #[clap(long)]
    nographic: bool,
    /// Forward hypervisor stderr to the log.
    #[clap(long)]
    debug: bool,
    /// Leave networks and devices in place on exit.
    #[clap(long)]
    keep: bool,
}

impl PlacematOptions {
    fn load_config(&self) -> anyhow::Result<PlacematConfig> {
        let mut config = match &self.config {
            Some(path) => PlacematConfig::parse_from_toml_file(path)
                .with_context(|| {
                    format!("failed to load config {}", path.display())
                })?,
            None => PlacematConfig::default(),
        };

        let runtime = &mut config.runtime;
        if let Some(dir) = &self.data_dir {
            runtime.data_dir = dir.clone();
        }
        if let Some(dir) = &self.cache_dir {
            runtime.cache_dir = dir.clone();
        }
        if let Some(dir) = &self.run_dir {
            runtime.run_dir = dir.clone();
        }
        runtime.nographic |= self.nographic;
        runtime.debug |= self.debug;

        Ok(config)
    }
}

pub async fn daemon() -> i32 {
    let options = PlacematOptions::parse();

    if let Err(e) = init::init(options.verbose) {
        eprintln!("failed to initialize logging: {e}");
        return EXIT_ERROR;
    }

    info!("Starting placemat");
    info!("Options: {options:#?}");

    let result = run(&options).await;
    if let Err(e) = &result {
        error!("{e:?}");
    }

    if result.is_err() {
        EXIT_ERROR
    } else {
        EXIT_OKAY
    }
}

async fn run(options: &PlacematOptions) -> anyhow::Result<()> {
    let config = options.load_config()?;
    let PlacematConfig { runtime, bmc, cluster } = config;

    let mut placemat =
        ClusterRuntime::new(runtime, &bmc, Arc::new(HostCommandRunner));
    placemat.setup().await.context("failed to set up runtime directories")?;

    let token = CancellationToken::new();
    let _ = tokio::spawn(graceful_shutdown::cancel_on_signal(token.clone()));

    let result = placemat.start(&cluster, token.clone()).await;
    token.cancel();

    if options.keep {
        info!("keeping cluster resources");
    } else {
        placemat.destroy(&cluster).await;
    }

    result.context("cluster stopped with an error")
}
