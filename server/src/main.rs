// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use changeflow_server::{load_configuration, Application};

const EXIT_CODE_FAILURE: i32 = 1;

/// How long a signal-initiated shutdown may take before the process is
/// terminated anyway.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(30);

#[derive(Debug, clap::Parser)]
#[command(author, version, about)]
struct ChangeflowArguments {
    /// Set a configuration file to use for changeflow.
    #[arg(
        short,
        long = "config-file",
        env = "CHANGEFLOW_CONFIG",
        default_value = "changeflow.toml",
        value_name = "FILE"
    )]
    config_file: PathBuf,
}

fn main() {
    let cli_args = ChangeflowArguments::parse();

    let config = match load_configuration(&cli_args.config_file) {
        Ok(config) => config,
        Err(err) => {
            // tracing is not configured yet
            eprintln!("{err}");
            std::process::exit(EXIT_CODE_FAILURE);
        }
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build Tokio runtime!");

    runtime.block_on(async move {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .init();

        info!(
            "Starting changeflow with configuration file {}",
            cli_args.config_file.display()
        );

        let app = match Application::create(config).await {
            Ok(app) => app,
            Err(err) => {
                error!(%err, "Failed to start changeflow");
                std::process::exit(EXIT_CODE_FAILURE);
            }
        };

        let cancel = CancellationToken::new();
        let application = app.run(cancel.clone());
        tokio::pin!(application);

        tokio::select! {
            _ = shutdown_signal() => {
                cancel.cancel();
                match tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, &mut application).await {
                    Ok(Ok(())) => info!("Changeflow has been gracefully shut down."),
                    Ok(Err(err)) => {
                        error!(%err, "Changeflow shut down with an error");
                        std::process::exit(EXIT_CODE_FAILURE);
                    }
                    Err(_) => {
                        warn!("Could not gracefully shut down changeflow, terminating now.");
                        std::process::exit(EXIT_CODE_FAILURE);
                    }
                }
            },
            result = &mut application => {
                match result {
                    Ok(()) => warn!("Changeflow stopped without a shutdown signal."),
                    Err(err) => {
                        error!(%err, "Changeflow application failed");
                        std::process::exit(EXIT_CODE_FAILURE);
                    }
                }
            }
        }
    });
}

/// Resolves once the process receives SIGINT or SIGTERM.
async fn shutdown_signal() {
    let mut interrupt = signal(SignalKind::interrupt()).expect("failed to register signal handler");
    let mut terminate = signal(SignalKind::terminate()).expect("failed to register signal handler");

    let received = tokio::select! {
        _ = interrupt.recv() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
    };
    info!(signal = received, "Received signal, starting shutdown");
}
