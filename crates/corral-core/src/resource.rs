//! Per-placement resource configuration.
//!
//! Lists the keys a caller may inject into a container launch: extra
//! environment variables and extra volume bindings. Values are validated
//! when the config is built or deserialized.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ResourceConfigError {
    #[error("invalid environment variable name: {0:?}")]
    InvalidEnvName(String),
    #[error("volume path must be absolute: {0}")]
    RelativeVolumePath(String),
}

/// A host directory bound into the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeBinding {
    pub host_path: String,
    pub container_path: String,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawResourceConfig", into = "RawResourceConfig")]
pub struct ResourceConfig {
    env: BTreeMap<String, String>,
    volumes: Vec<VolumeBinding>,
}

#[derive(Serialize, Deserialize)]
struct RawResourceConfig {
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    volumes: Vec<VolumeBinding>,
}

impl ResourceConfig {
    pub fn new(
        env: BTreeMap<String, String>,
        volumes: Vec<VolumeBinding>,
    ) -> Result<Self, ResourceConfigError> {
        for name in env.keys() {
            if !is_env_name(name) {
                return Err(ResourceConfigError::InvalidEnvName(name.clone()));
            }
        }
        for volume in &volumes {
            for path in [&volume.host_path, &volume.container_path] {
                if !path.starts_with('/') {
                    return Err(ResourceConfigError::RelativeVolumePath(path.clone()));
                }
            }
        }
        Ok(Self { env, volumes })
    }

    /// Environment overrides. These win over the variables Corral sets itself.
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn volumes(&self) -> &[VolumeBinding] {
        &self.volumes
    }
}

impl TryFrom<RawResourceConfig> for ResourceConfig {
    type Error = ResourceConfigError;

    fn try_from(raw: RawResourceConfig) -> Result<Self, Self::Error> {
        Self::new(raw.env, raw.volumes)
    }
}

impl From<ResourceConfig> for RawResourceConfig {
    fn from(config: ResourceConfig) -> Self {
        Self {
            env: config.env,
            volumes: config.volumes,
        }
    }
}

fn is_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_valid_config() {
        let env = BTreeMap::from([("MYSQL_HOST".to_string(), "10.0.0.5".to_string())]);
        let volumes = vec![VolumeBinding {
            host_path: "/data/web".to_string(),
            container_path: "/web/data".to_string(),
            read_only: true,
        }];
        let config = ResourceConfig::new(env, volumes).unwrap();
        assert_eq!(config.env()["MYSQL_HOST"], "10.0.0.5");
        assert_eq!(config.volumes().len(), 1);
    }

    #[test]
    fn rejects_bad_env_names() {
        for bad in ["", "1ABC", "WITH-DASH", "has space"] {
            let env = BTreeMap::from([(bad.to_string(), "x".to_string())]);
            assert_eq!(
                ResourceConfig::new(env, Vec::new()),
                Err(ResourceConfigError::InvalidEnvName(bad.to_string()))
            );
        }
    }

    #[test]
    fn rejects_relative_volume_paths() {
        let volumes = vec![VolumeBinding {
            host_path: "data".to_string(),
            container_path: "/data".to_string(),
            read_only: false,
        }];
        assert!(matches!(
            ResourceConfig::new(BTreeMap::new(), volumes),
            Err(ResourceConfigError::RelativeVolumePath(_))
        ));
    }

    #[test]
    fn deserialization_validates() {
        let ok: ResourceConfig =
            serde_json::from_str(r#"{"env": {"REDIS_PORT": "6379"}}"#).unwrap();
        assert_eq!(ok.env()["REDIS_PORT"], "6379");
        assert!(ok.volumes().is_empty());

        let bad = serde_json::from_str::<ResourceConfig>(r#"{"env": {"bad-name": "1"}}"#);
        assert!(bad.is_err());
    }
}
