// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Configuration loading and persistence.
//!
//! Loading pipeline:
//!
//! 1. Read and parse the YAML file
//! 2. Canonicalize device-embedded mappings into the top-level section
//! 3. Validate the whole document (including rule compilation)
//! 4. Compile the immutable device snapshot for the engine
//!
//! The same pipeline backs runtime reloads and the management API's
//! validate-then-overwrite flow.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use vxgate_core::DeviceMap;

use crate::error::{ConfigError, ConfigResult};
use crate::schema::GatewayConfig;

/// Loads, validates, and persists gateway configuration files.
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader;

impl ConfigLoader {
    /// Creates a loader.
    pub fn new() -> Self {
        Self
    }

    /// Loads and fully validates a configuration file.
    pub fn load(&self, path: impl AsRef<Path>) -> ConfigResult<GatewayConfig> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = self.parse(&content, path)?;
        config.canonicalize()?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a file and compiles the runtime device snapshot in one step.
    pub fn load_and_compile(&self, path: impl AsRef<Path>) -> ConfigResult<(GatewayConfig, DeviceMap)> {
        let config = self.load(path)?;
        let devices = config.compile()?;
        Ok((config, devices))
    }

    /// Parses YAML text into a (not yet canonicalized) document.
    pub fn parse(&self, content: &str, origin: &Path) -> ConfigResult<GatewayConfig> {
        serde_yaml::from_str(content).map_err(|e| ConfigError::Parse {
            path: origin.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Validates and writes a document back to disk as YAML.
    ///
    /// The document is canonicalized and fully validated before any bytes
    /// touch the file, so an invalid POSTed config never clobbers a good one.
    pub fn save(&self, path: impl AsRef<Path>, config: &GatewayConfig) -> ConfigResult<()> {
        let path = path.as_ref();

        let mut candidate = config.clone();
        candidate.canonicalize()?;
        candidate.validate()?;

        let rendered = serde_yaml::to_string(&candidate).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        fs::write(path, rendered).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        info!(path = %path.display(), "configuration saved");
        Ok(())
    }
}

/// Default configuration file locations probed when none is given.
pub fn default_config_paths() -> Vec<PathBuf> {
    vec![PathBuf::from("vxgate.yaml"), PathBuf::from("/etc/vxgate/vxgate.yaml")]
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    const SAMPLE: &str = r#"
server:
  port: 1024
devices:
  echo:
    type: loopback
"#;

    #[test]
    fn test_load_round_trip() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let loader = ConfigLoader::new();
        let (config, devices) = loader.load_and_compile(file.path()).unwrap();
        assert_eq!(config.server.port, 1024);
        assert!(devices.contains_key("echo"));
    }

    #[test]
    fn test_missing_file() {
        let loader = ConfigLoader::new();
        assert!(matches!(
            loader.load("/nonexistent/vxgate.yaml"),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn test_invalid_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"devices: [not: a: mapping").unwrap();
        let loader = ConfigLoader::new();
        assert!(matches!(
            loader.load(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_save_validates_first() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let loader = ConfigLoader::new();

        // A config with a mapping for an unknown device must not be written.
        let mut config = GatewayConfig::default();
        config
            .mappings
            .insert("ghost".into(), vec![crate::schema::RuleSpec::default()]);
        assert!(loader.save(file.path(), &config).is_err());

        // A valid config saves and loads back.
        let config: GatewayConfig = serde_yaml::from_str(SAMPLE).unwrap();
        loader.save(file.path(), &config).unwrap();
        loader.load(file.path()).unwrap();
    }
}
