// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Subcommand implementations.

mod run;
mod validate;
mod version;

use crate::cli::{Cli, Commands};
use crate::error::AppError;

/// Dispatches the parsed CLI to its command.
pub async fn execute(cli: Cli) -> Result<(), AppError> {
    match cli.command.clone().unwrap_or(Commands::Run) {
        Commands::Run => run::execute(&cli).await,
        Commands::Validate => validate::execute(&cli),
        Commands::Version => {
            version::execute();
            Ok(())
        }
    }
}
