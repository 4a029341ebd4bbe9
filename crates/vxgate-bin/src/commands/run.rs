// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! The `run` command: start the gateway.

use crate::cli::Cli;
use crate::error::AppError;
use crate::runtime;

/// Runs the gateway until shutdown.
pub async fn execute(cli: &Cli) -> Result<(), AppError> {
    runtime::run(&cli.config).await
}
