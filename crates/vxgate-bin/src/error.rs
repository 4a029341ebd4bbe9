// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Process-level errors and exit-code mapping.
//!
//! Exit codes are part of the container contract:
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0    | Normal shutdown |
//! | 2    | Configuration error |
//! | 3    | VXI-11 listener bind error |
//! | 4    | Irrecoverable portmapper error while enabled |

use thiserror::Error;
use tracing::error;

use vxgate_config::ConfigError;

/// Fatal process errors.
#[derive(Debug, Error)]
pub enum AppError {
    /// The configuration failed to load or validate.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The VXI-11 listener could not bind.
    #[error("Failed to bind VXI-11 listener on {address}: {source}")]
    Bind {
        /// The requested address.
        address: String,
        /// Underlying failure.
        #[source]
        source: std::io::Error,
    },

    /// The portmapper is enabled but cannot run at all.
    #[error("Portmapper failed irrecoverably: {message}")]
    Portmapper {
        /// What went wrong.
        message: String,
    },

    /// Any other runtime failure.
    #[error("Runtime error: {message}")]
    Runtime {
        /// What went wrong.
        message: String,
    },
}

impl AppError {
    /// The process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::Config(_) => 2,
            AppError::Bind { .. } => 3,
            AppError::Portmapper { .. } => 4,
            AppError::Runtime { .. } => 1,
        }
    }
}

/// Logs a fatal error and terminates with its exit code.
pub fn report_error_and_exit(err: AppError) -> ! {
    error!("{}", err);
    std::process::exit(err.exit_code());
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        let config_err: AppError = ConfigError::validation("devices.x", "bad").into();
        assert_eq!(config_err.exit_code(), 2);

        let bind = AppError::Bind {
            address: "0.0.0.0:1024".into(),
            source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
        };
        assert_eq!(bind.exit_code(), 3);

        let pm = AppError::Portmapper {
            message: "both sockets failed".into(),
        };
        assert_eq!(pm.exit_code(), 4);
    }
}
