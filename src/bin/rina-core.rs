//! # rina-core - Control-Plane Daemon Entry Point
//!
//! This is the main entry point for the `rina-core` demo host: it parses
//! CLI arguments, wires up structured logging, registers the in-tree
//! `NullIpcpFactory` for a "normal" DIF type, binds the control socket for
//! one isolation domain, and serves control connections until the process
//! is killed.
//!
//! ## Error Handling
//!
//! The application uses `anyhow::Result` for comprehensive error handling
//! throughout, consistent with the rest of this crate's binary-boundary
//! conventions.

use anyhow::Result;
use clap::Parser;
use rina_core::cli::Args;
use rina_core::factory::{FactoryRegistry, NullIpcpFactory};
use rina_core::logging::ColorizedFormatter;
use rina_core::namespace::DataModelManager;
use rina_core::server::Server;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;
use tracing_subscriber::{filter::LevelFilter, prelude::*, Layer};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Configure logging level based on verbosity flags.
    // This level applies to both the log file and stdout.
    // - default: INFO
    // -v: DEBUG
    // -vv and more: TRACE
    let log_level = match args.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    // Configure the detailed log layer (file or stderr).
    // The guard must be kept alive for the duration of the program for file logging.
    let guard;
    let detailed_log_layer;

    if let Some("stderr") = args.log_file.as_deref() {
        detailed_log_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(log_level)
            .boxed();
        guard = None;
    } else {
        let file_appender = match args.log_file.as_deref() {
            Some(path_str) => {
                let log_path = std::path::Path::new(path_str);
                let log_dir = log_path
                    .parent()
                    .unwrap_or_else(|| std::path::Path::new("."));
                let log_filename = log_path
                    .file_name()
                    .unwrap_or_else(|| std::ffi::OsStr::new("rina-core.log"));
                tracing_appender::rolling::daily(log_dir, log_filename)
            }
            None => tracing_appender::rolling::daily(".", "rina-core.log"),
        };
        let (non_blocking_writer, file_guard) = tracing_appender::non_blocking(file_appender);
        detailed_log_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_ansi(false)
            .with_filter(log_level)
            .boxed();
        guard = Some(file_guard);
    }

    // This layer sends clean, user-facing output to stdout, unless --quiet
    // was passed.
    let stdout_log = if !args.quiet {
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .event_format(ColorizedFormatter)
                .with_filter(log_level),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(detailed_log_layer)
        .with(stdout_log)
        .init();

    // Keep the logging guard alive for the duration of the program.
    let _log_guard = guard;

    info!("starting rina-core control plane");

    let mut factories = FactoryRegistry::new();
    factories.register(NullIpcpFactory::new("normal"))?;
    let factories = Arc::new(Mutex::new(factories));

    let namespaces = DataModelManager::new();
    let dm = namespaces.get_or_create(&args.namespace).await;

    let socket_path = args.control_socket.to_string_lossy().into_owned();
    let server = Server::bind(&socket_path, dm, factories)?;
    info!(socket = %socket_path, namespace = %args.namespace, "control socket ready");
    server.run().await?;

    Ok(())
}
