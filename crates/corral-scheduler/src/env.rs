//! Container naming, environment and mounts.

use std::collections::BTreeMap;

use corral_core::{CorralConfig, ResourceConfig, VolumeBinding};
use rand::Rng;

const NAME_SUFFIX_LEN: usize = 6;
const NAME_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// `{appname}_{entrypoint}_{random6}`
pub fn container_name(appname: &str, entrypoint: &str) -> String {
    let mut rng = rand::rng();
    let suffix: String = (0..NAME_SUFFIX_LEN)
        .map(|_| NAME_ALPHABET[rng.random_range(0..NAME_ALPHABET.len())] as char)
        .collect();
    format!("{appname}_{entrypoint}_{suffix}")
}

/// Environment of a container. Entries in `resources` override the
/// variables Corral sets.
pub fn container_env(
    config: &CorralConfig,
    appname: &str,
    run_env: &str,
    pod_name: &str,
    resources: &ResourceConfig,
) -> BTreeMap<String, String> {
    let mut env = BTreeMap::from([
        ("NBE_RUNENV".to_string(), run_env.to_uppercase()),
        ("NBE_POD".to_string(), pod_name.to_string()),
        (
            "NBE_PERMDIR".to_string(),
            config.container_permdir_for(appname),
        ),
    ]);
    env.extend(
        resources
            .env()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone())),
    );
    env
}

pub fn cpuset(cores: &[String]) -> String {
    cores.join(",")
}

/// The permdir bind followed by any extra volumes.
pub fn container_binds(
    config: &CorralConfig,
    appname: &str,
    resources: &ResourceConfig,
) -> Vec<VolumeBinding> {
    let mut binds = vec![VolumeBinding {
        host_path: config.host_permdir_for(appname),
        container_path: config.container_permdir_for(appname),
        read_only: false,
    }];
    binds.extend(resources.volumes().iter().cloned());
    binds
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_has_random_suffix() {
        let name = container_name("web", "api");
        let suffix = name.strip_prefix("web_api_").unwrap();
        assert_eq!(suffix.len(), NAME_SUFFIX_LEN);
        assert!(suffix.bytes().all(|b| NAME_ALPHABET.contains(&b)));
        assert_ne!(container_name("web", "api"), container_name("web", "api"));
    }

    #[test]
    fn env_defaults_and_overrides() {
        let config = CorralConfig::default();
        let resources = ResourceConfig::new(
            BTreeMap::from([
                ("NBE_POD".to_string(), "custom".to_string()),
                ("MYSQL_HOST".to_string(), "10.0.0.5".to_string()),
            ]),
            Vec::new(),
        )
        .unwrap();

        let env = container_env(&config, "web", "prod", "intra", &ResourceConfig::default());
        assert_eq!(env["NBE_RUNENV"], "PROD");
        assert_eq!(env["NBE_POD"], "intra");
        assert_eq!(env["NBE_PERMDIR"], "/web/permdir");

        let env = container_env(&config, "web", "prod", "intra", &resources);
        assert_eq!(env["NBE_POD"], "custom");
        assert_eq!(env["MYSQL_HOST"], "10.0.0.5");
    }

    #[test]
    fn binds_start_with_permdir() {
        let config = CorralConfig::default();
        let resources = ResourceConfig::new(
            BTreeMap::new(),
            vec![VolumeBinding {
                host_path: "/data/logs".to_string(),
                container_path: "/web/logs".to_string(),
                read_only: true,
            }],
        )
        .unwrap();

        let binds = container_binds(&config, "web", &resources);
        assert_eq!(binds.len(), 2);
        assert_eq!(binds[0].host_path, "/mnt/mfs/permdir/web");
        assert_eq!(binds[0].container_path, "/web/permdir");
        assert!(binds[1].read_only);
        assert_eq!(cpuset(&["0".to_string(), "3".to_string()]), "0,3");
    }
}
