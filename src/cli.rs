//! Command-line argument parsing for the `rina-core` demo binary (§7).
//!
//! `rina-core` itself is a library; this module only configures the thin
//! host binary that binds a control socket and serves one isolation
//! domain, the same way the teacher keeps argument parsing separate from
//! the engine it configures.

use clap::{
    builder::styling::{AnsiColor, Styles},
    Parser,
};
use std::path::PathBuf;

/// Defines the styles for the help message to replicate clap v3's appearance.
fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default())
        .usage(AnsiColor::Yellow.on_default())
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// rina-core - process-wide registry and lifecycle manager for RINA IPC
/// processes, flows and registered applications.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None, styles = styles())]
pub struct Args {
    /// Path of the Unix Domain Socket control endpoint applications and
    /// uipcps connect to.
    #[arg(short = 's', long, default_value = "/run/rina/rina-core.sock")]
    pub control_socket: PathBuf,

    /// Isolation domain (namespace) served by this process.
    #[arg(short = 'n', long, default_value = "default")]
    pub namespace: String,

    /// Diagnostic log file path, or "stderr" to log there instead of a
    /// rolling daily file.
    #[arg(long)]
    pub log_file: Option<String>,

    /// Increase diagnostic log verbosity on stderr/file.
    ///
    ///  -v: debug
    ///  -vv and more: trace
    /// By default, only INFO and above are shown.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Silence the colorized user-facing summary on stdout.
    #[arg(short = 'q', long)]
    pub quiet: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_applied() {
        let args = Args::parse_from(["rina-core"]);
        assert_eq!(args.namespace, "default");
        assert_eq!(args.verbose, 0);
        assert!(!args.quiet);
        assert!(args.log_file.is_none());
    }

    #[test]
    fn verbosity_flags_accumulate() {
        let args = Args::parse_from(["rina-core", "-vv"]);
        assert_eq!(args.verbose, 2);
    }
}
