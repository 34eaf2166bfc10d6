/*
Copyright 2024 The lxe Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use std::path::{Path, PathBuf};

use anyhow::anyhow;
use serde::Deserialize;
use tokio::fs::read_to_string;

use crate::error::Result;

/// Network plugin name selecting the bridged mode.
pub const NETWORK_PLUGIN_DEFAULT: &str = "default";
/// Network plugin name selecting CNI.
pub const NETWORK_PLUGIN_CNI: &str = "cni";

/// Runtime configuration. All fields have defaults so an empty file is a
/// valid configuration.
#[derive(Deserialize, Debug, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Path to the LXD client remote configuration. Empty means resolve via
    /// $LXD_CONF, then the user's ~/.config/lxc directory.
    pub lxd_remote_config: String,
    /// Profiles attached to every created container.
    pub lxd_profiles: Vec<String>,
    /// Listen address of the exec/port-forward streaming server.
    pub streaming_endpoint: String,
    pub streaming_port: u16,
    /// Raw lxc include file applied to host network sandboxes.
    pub hostnetwork_file: String,
    /// `default` for the bridged plugin, `cni` for CNI.
    pub network_plugin: String,
    /// Parent bridge used by the bridged plugin unless the sandbox overrides
    /// it by annotation.
    pub bridge: String,
    pub cni_conf_dir: String,
    pub cni_bin_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lxd_remote_config: String::new(),
            lxd_profiles: vec![],
            streaming_endpoint: "0.0.0.0".to_string(),
            streaming_port: 44124,
            hostnetwork_file: "/etc/lxe/hostnetwork.conf".to_string(),
            network_plugin: NETWORK_PLUGIN_DEFAULT.to_string(),
            bridge: "lxebr0".to_string(),
            cni_conf_dir: "/etc/cni/net.d".to_string(),
            cni_bin_dir: "/opt/cni/bin".to_string(),
        }
    }
}

impl Config {
    /// Load config from a toml file.
    pub async fn load_config(config_path: &str) -> Result<Self> {
        if config_path.is_empty() {
            return Err(anyhow!("config path is empty").into());
        }
        let toml_str = read_to_string(config_path).await?;
        let config =
            toml::from_str(&toml_str).map_err(|e| anyhow!("failed to parse lxe config: {}", e))?;
        Ok(config)
    }

    /// Resolve the LXD client remote configuration file. An explicitly
    /// configured path wins, then $LXD_CONF, then $HOME, then the passwd
    /// database entry of the current user.
    pub fn lxd_config_path(&self) -> Result<PathBuf> {
        if !self.lxd_remote_config.is_empty() {
            return Ok(PathBuf::from(&self.lxd_remote_config));
        }
        let home = std::env::var("HOME").ok();
        resolve_lxd_config_dir(std::env::var("LXD_CONF").ok().as_deref(), home.as_deref())
    }
}

fn resolve_lxd_config_dir(lxd_conf: Option<&str>, home: Option<&str>) -> Result<PathBuf> {
    let config_dir = match (lxd_conf, home) {
        (Some(dir), _) if !dir.is_empty() => PathBuf::from(dir),
        (_, Some(home)) if !home.is_empty() => Path::new(home).join(".config").join("lxc"),
        _ => {
            let user = nix::unistd::User::from_uid(nix::unistd::getuid())
                .map_err(|e| anyhow!("failed to look up current user: {}", e))?
                .ok_or_else(|| anyhow!("current user has no passwd entry"))?;
            user.dir.join(".config").join("lxc")
        }
    };
    Ok(config_dir.join("config.yml"))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network_plugin, NETWORK_PLUGIN_DEFAULT);
        assert_eq!(config.streaming_port, 44124);
        assert!(config.lxd_profiles.is_empty());
    }

    #[tokio::test]
    async fn test_load_empty_path() {
        assert!(Config::load_config("").await.is_err());
    }

    #[tokio::test]
    async fn test_load_config() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let path = tmp_dir.path().join("lxe.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        write!(
            f,
            "network_plugin = \"cni\"\nstreaming_port = 10010\nlxd_profiles = [\"default\"]\n"
        )
        .unwrap();

        let config = Config::load_config(path.to_str().unwrap()).await.unwrap();
        assert_eq!(config.network_plugin, NETWORK_PLUGIN_CNI);
        assert_eq!(config.streaming_port, 10010);
        assert_eq!(config.lxd_profiles, vec!["default".to_string()]);
        // untouched fields keep their defaults
        assert_eq!(config.bridge, "lxebr0");
    }

    #[tokio::test]
    async fn test_load_config_unknown_key() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let path = tmp_dir.path().join("lxe.toml");
        std::fs::write(&path, "no_such_option = 1\n").unwrap();
        assert!(Config::load_config(path.to_str().unwrap()).await.is_err());
    }

    #[test]
    fn test_resolve_lxd_config_dir() {
        let p = resolve_lxd_config_dir(Some("/etc/lxd-conf"), Some("/home/u")).unwrap();
        assert_eq!(p, PathBuf::from("/etc/lxd-conf/config.yml"));

        let p = resolve_lxd_config_dir(None, Some("/home/u")).unwrap();
        assert_eq!(p, PathBuf::from("/home/u/.config/lxc/config.yml"));

        let p = resolve_lxd_config_dir(Some(""), Some("/home/u")).unwrap();
        assert_eq!(p, PathBuf::from("/home/u/.config/lxc/config.yml"));
    }

    #[test]
    fn test_explicit_remote_config_wins() {
        let config = Config {
            lxd_remote_config: "/tmp/remote.yml".to_string(),
            ..Default::default()
        };
        assert_eq!(
            config.lxd_config_path().unwrap(),
            PathBuf::from("/tmp/remote.yml")
        );
    }
}
