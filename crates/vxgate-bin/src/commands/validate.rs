// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! The `validate` command: check a configuration file.

use tracing::info;

use vxgate_config::ConfigLoader;

use crate::cli::Cli;
use crate::error::AppError;

/// Loads and validates the configuration, without starting anything.
pub fn execute(cli: &Cli) -> Result<(), AppError> {
    let (config, devices) = ConfigLoader::new().load_and_compile(&cli.config)?;
    info!(
        path = %cli.config.display(),
        devices = devices.len(),
        mappings = config.mappings.values().map(Vec::len).sum::<usize>(),
        "configuration is valid"
    );
    println!("{}: OK ({} device(s))", cli.config.display(), devices.len());
    Ok(())
}
