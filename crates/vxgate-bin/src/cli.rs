// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! CLI argument parsing and command definitions.
//!
//! - `run`: start the gateway (default when no subcommand is given)
//! - `validate`: check a configuration file without starting anything
//! - `version`: show version information

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// VXGATE - VXI-11 gateway for heterogeneous instrument backends.
///
/// Exposes a single VXI-11 endpoint and proxies instrument traffic to SCPI,
/// MODBUS, USBTMC, and ad-hoc text-protocol backends.
#[derive(Parser, Debug)]
#[command(
    name = "vxgate",
    version = vxgate_core::VERSION,
    about = "VXI-11 gateway for heterogeneous instrument backends",
    long_about = None,
    propagate_version = true
)]
pub struct Cli {
    /// Configuration file path
    #[arg(
        short,
        long,
        default_value = "vxgate.yaml",
        env = "VXGATE_CONFIG",
        global = true
    )]
    pub config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        short,
        long,
        default_value = "info",
        env = "VXGATE_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log output format
    #[arg(long, default_value = "text", env = "VXGATE_LOG_FORMAT", global = true)]
    pub log_format: LogFormat,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the gateway server
    ///
    /// This is the default command when no subcommand is specified.
    Run,

    /// Validate the configuration file
    ///
    /// Parses, canonicalizes, and validates the file (including every
    /// mapping rule) without starting the gateway.
    Validate,

    /// Show detailed version information
    Version,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable text (default).
    Text,
    /// Structured JSON for log aggregation.
    Json,
    /// Minimal single-line output.
    Compact,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_defaults() {
        let cli = Cli::parse_from(["vxgate"]);
        assert_eq!(cli.config, PathBuf::from("vxgate.yaml"));
        assert_eq!(cli.log_level, "info");
        assert_eq!(cli.log_format, LogFormat::Text);
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_subcommand_and_flags() {
        let cli = Cli::parse_from(["vxgate", "validate", "--config", "/tmp/g.yaml"]);
        assert!(matches!(cli.command, Some(Commands::Validate)));
        assert_eq!(cli.config, PathBuf::from("/tmp/g.yaml"));
    }
}
