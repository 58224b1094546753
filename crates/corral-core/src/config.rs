//! corral.toml configuration parser.
//!
//! Every key has a default so an empty file is a valid configuration.
//! Values are checked once by [`CorralConfig::validate`] when the file is
//! loaded; the rest of the system relies on them being well formed.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Placeholder substituted with the application name in permdir templates.
const APP_PLACEHOLDER: &str = "%s";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{field} must contain the `%s` application placeholder: {value}")]
    MissingPlaceholder { field: &'static str, value: String },
    #[error("port_range must be greater than zero")]
    EmptyPortRange,
    #[error("port range {start}+{range} overflows the u16 port space")]
    PortOverflow { start: u16, range: u16 },
    #[error("{0} must not be empty")]
    Empty(&'static str),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorralConfig {
    /// Registry images are pushed to and pulled from.
    pub registry: String,
    /// Container runtime network mode.
    pub network: String,
    /// Host-side permanent storage directory, `%s` is the app name.
    pub host_permdir: String,
    /// Container-side permanent storage directory, `%s` is the app name.
    pub container_permdir: String,
    /// First port handed out on every host.
    pub port_start: u16,
    /// Number of ports managed per host.
    pub port_range: u16,
    /// Maximum number of public hosts scanned for one group per request.
    pub public_host_limit: usize,
    /// Core quota granted when a group is authorized on a pod without an
    /// explicit quota.
    pub default_public_core_quota: u32,
}

impl Default for CorralConfig {
    fn default() -> Self {
        Self {
            registry: "registry.local".to_string(),
            network: "bridge".to_string(),
            host_permdir: "/mnt/mfs/permdir/%s".to_string(),
            container_permdir: "/%s/permdir".to_string(),
            port_start: 49000,
            port_range: 2,
            public_host_limit: 20,
            default_public_core_quota: 0,
        }
    }
}

impl CorralConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: CorralConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.registry.is_empty() {
            return Err(ConfigError::Empty("registry"));
        }
        if self.network.is_empty() {
            return Err(ConfigError::Empty("network"));
        }
        for (field, value) in [
            ("host_permdir", &self.host_permdir),
            ("container_permdir", &self.container_permdir),
        ] {
            if !value.contains(APP_PLACEHOLDER) {
                return Err(ConfigError::MissingPlaceholder {
                    field,
                    value: value.clone(),
                });
            }
        }
        if self.port_range == 0 {
            return Err(ConfigError::EmptyPortRange);
        }
        if self.port_start.checked_add(self.port_range - 1).is_none() {
            return Err(ConfigError::PortOverflow {
                start: self.port_start,
                range: self.port_range,
            });
        }
        Ok(())
    }

    /// Port numbers managed on each host, in allocation order.
    pub fn port_numbers(&self) -> impl Iterator<Item = u16> + use<> {
        let start = self.port_start;
        (0..self.port_range).map(move |offset| start + offset)
    }

    pub fn host_permdir_for(&self, appname: &str) -> String {
        self.host_permdir.replace(APP_PLACEHOLDER, appname)
    }

    pub fn container_permdir_for(&self, appname: &str) -> String {
        self.container_permdir.replace(APP_PLACEHOLDER, appname)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = CorralConfig::from_toml_str("").unwrap();
        assert_eq!(config, CorralConfig::default());
        assert_eq!(config.port_numbers().collect::<Vec<_>>(), vec![49000, 49001]);
    }

    #[test]
    fn parse_overrides() {
        let config = CorralConfig::from_toml_str(
            r#"
registry = "docker-registry.example.com"
port_start = 50000
port_range = 10
public_host_limit = 5
"#,
        )
        .unwrap();
        assert_eq!(config.registry, "docker-registry.example.com");
        assert_eq!(config.port_numbers().count(), 10);
        assert_eq!(config.public_host_limit, 5);
        assert_eq!(config.network, "bridge");
    }

    #[test]
    fn permdir_templates_expand_app_name() {
        let config = CorralConfig::default();
        assert_eq!(config.host_permdir_for("web"), "/mnt/mfs/permdir/web");
        assert_eq!(config.container_permdir_for("web"), "/web/permdir");
    }

    #[test]
    fn rejects_template_without_placeholder() {
        let config = CorralConfig {
            host_permdir: "/mnt/permdir".to_string(),
            ..CorralConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingPlaceholder { field: "host_permdir", .. })
        ));
    }

    #[test]
    fn rejects_bad_port_ranges() {
        let empty = CorralConfig {
            port_range: 0,
            ..CorralConfig::default()
        };
        assert_eq!(empty.validate(), Err(ConfigError::EmptyPortRange));

        let overflow = CorralConfig {
            port_start: 65530,
            port_range: 10,
            ..CorralConfig::default()
        };
        assert!(matches!(overflow.validate(), Err(ConfigError::PortOverflow { .. })));

        let edge = CorralConfig {
            port_start: 65535,
            port_range: 1,
            ..CorralConfig::default()
        };
        assert!(edge.validate().is_ok());
    }

    #[test]
    fn from_file_round_trips_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corral.toml");
        let config = CorralConfig {
            registry: "hub.internal".to_string(),
            ..CorralConfig::default()
        };
        std::fs::write(&path, config.to_toml_string().unwrap()).unwrap();

        let loaded = CorralConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
