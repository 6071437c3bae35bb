//! Reads the gateway's TOML configuration file.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

use crate::domain::config::{GatewayConfig, ValidationError};

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file system I/O error occurred.
    #[error("I/O error reading config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The file parsed but describes an unusable gateway.
    #[error("invalid config: {0}")]
    Invalid(#[from] ValidationError),
}

/// Loads and validates the configuration at `path`.
///
/// A missing file is not an error: the gateway then starts with defaults
/// and no services.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// [`ConfigError::Parse`] if the TOML is malformed, and
/// [`ConfigError::Invalid`] if validation fails.
pub fn load_config(path: &Path) -> Result<GatewayConfig, ConfigError> {
    let config = match std::fs::read_to_string(path) {
        Ok(content) => {
            debug!(path = %path.display(), "config file read");
            toml::from_str::<GatewayConfig>(&content)?
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "no config file; using defaults");
            GatewayConfig::default()
        }
        Err(source) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    config.validate()?;
    Ok(config)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::config::ServiceKind;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("relay-gateway-{}-{name}", uuid::Uuid::new_v4()))
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        // Arrange
        let path = temp_path("missing.toml");

        // Act
        let cfg = load_config(&path).expect("missing file is fine");

        // Assert
        assert_eq!(cfg, GatewayConfig::default());
    }

    #[test]
    fn test_file_is_parsed_and_validated() {
        // Arrange
        let path = temp_path("valid.toml");
        std::fs::write(
            &path,
            r#"
                [gateway]
                workers = 2

                [[service]]
                name = "echo"
                accept = ["echo://127.0.0.1:7000"]
                protocol = "echo"
                sniff_prefix = "ECHO"
            "#,
        )
        .unwrap();

        // Act
        let cfg = load_config(&path);
        let _ = std::fs::remove_file(&path);

        // Assert
        let cfg = cfg.expect("valid config");
        assert_eq!(cfg.gateway.workers, Some(2));
        assert_eq!(cfg.services[0].kind, ServiceKind::Echo);
    }

    #[test]
    fn test_malformed_toml_is_a_parse_error() {
        let path = temp_path("broken.toml");
        std::fs::write(&path, "[gateway\nworkers = ").unwrap();
        let result = load_config(&path);
        let _ = std::fs::remove_file(&path);
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_invalid_service_is_reported() {
        let path = temp_path("invalid.toml");
        std::fs::write(
            &path,
            r#"
                [[service]]
                name = "r"
                accept = ["relay://127.0.0.1:7000"]
                protocol = "relay"
                kind = "relay"
            "#,
        )
        .unwrap();
        let result = load_config(&path);
        let _ = std::fs::remove_file(&path);
        assert!(matches!(
            result,
            Err(ConfigError::Invalid(ValidationError::MissingConnect(_)))
        ));
    }
}
