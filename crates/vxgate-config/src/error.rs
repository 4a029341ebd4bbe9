// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Configuration error types.

use std::path::PathBuf;

use thiserror::Error;
use vxgate_core::error::MappingError;

/// Faults while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        /// The file path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid YAML or violates the schema.
    #[error("Failed to parse config file '{path}': {message}")]
    Parse {
        /// The file path.
        path: PathBuf,
        /// Parser diagnostic.
        message: String,
    },

    /// A cross-field validation rule failed.
    #[error("Validation failed for '{field}': {message}")]
    Validation {
        /// Dotted path of the offending field.
        field: String,
        /// What is wrong.
        message: String,
    },

    /// A device's mapping rules failed to compile.
    #[error("Invalid mapping rules for device '{device}': {source}")]
    Mapping {
        /// The device whose rules are broken.
        device: String,
        /// The compile failure.
        #[source]
        source: MappingError,
    },

    /// The mappings section references a device that is not defined.
    #[error("Mappings reference unknown device '{device}'")]
    UnknownMappingDevice {
        /// The dangling reference.
        device: String,
    },

    /// A device defines rules both inline and in the top-level section.
    #[error("Device '{device}' has both embedded and top-level mappings; move the rules to one place")]
    AmbiguousMappings {
        /// The conflicted device.
        device: String,
    },
}

impl ConfigError {
    /// Shorthand for [`ConfigError::Validation`].
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Convenience alias for configuration results.
pub type ConfigResult<T> = Result<T, ConfigError>;
