// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! VXGATE - VXI-11 gateway for heterogeneous instrument backends.

use clap::Parser;

use vxgate_bin::cli::Cli;
use vxgate_bin::commands;
use vxgate_bin::error::report_error_and_exit;
use vxgate_bin::logging::init_logging;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.log_format);

    if let Err(error) = commands::execute(cli).await {
        report_error_and_exit(error);
    }
}
