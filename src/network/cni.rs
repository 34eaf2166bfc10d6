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

//! CNI pod networking.
//!
//! Each pod gets a named network namespace; the configured CNI plugin binary
//! attaches the pod interface into it with `ADD` and detaches with `DEL`.
//! The raw CNI result plus the netns name make up the persisted mode-data,
//! so teardown works from the sandbox record alone.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::anyhow;
use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{
    ContainerNetwork, NetResult, NetStatus, Plugin, PodNetwork, Properties, PropertiesRunning,
};
use crate::api;
use crate::config::Config;
use crate::error::Result;

const NETNS_DIR: &str = "/var/run/netns";
const CNI_IFNAME: &str = "eth0";

/// Persisted mode-data of a CNI pod.
#[derive(Serialize, Deserialize, Debug, Default)]
pub(crate) struct CniData {
    pub netns: String,
    /// Raw result JSON of the last successful ADD.
    #[serde(default)]
    pub result: Value,
}

pub struct CniPlugin {
    conf_dir: PathBuf,
    bin_dir: PathBuf,
}

impl CniPlugin {
    pub fn new(config: &Config) -> Self {
        Self {
            conf_dir: PathBuf::from(&config.cni_conf_dir),
            bin_dir: PathBuf::from(&config.cni_bin_dir),
        }
    }
}

#[async_trait]
impl Plugin for CniPlugin {
    async fn pod_network(
        &self,
        sandbox_id: &str,
        _annotations: &HashMap<String, String>,
    ) -> Result<Box<dyn PodNetwork>> {
        Ok(Box::new(CniPodNetwork {
            sandbox_id: sandbox_id.to_string(),
            conf_dir: self.conf_dir.clone(),
            bin_dir: self.bin_dir.clone(),
        }))
    }

    async fn update_runtime_config(&self, config: &api::RuntimeConfig) -> Result<()> {
        // address ranges are owned by the CNI configuration
        if let Some(network_config) = &config.network_config {
            debug!("ignoring pod cidr {} in cni mode", network_config.pod_cidr);
        }
        Ok(())
    }
}

struct CniPodNetwork {
    sandbox_id: String,
    conf_dir: PathBuf,
    bin_dir: PathBuf,
}

impl CniPodNetwork {
    fn netns_name(&self) -> String {
        format!("lxe-{}", self.sandbox_id)
    }

    fn netns_path(&self, name: &str) -> String {
        format!("{}/{}", NETNS_DIR, name)
    }

    fn data(&self, props_data: &str) -> CniData {
        serde_json::from_str(props_data).unwrap_or_else(|_| CniData {
            netns: self.netns_name(),
            result: Value::Null,
        })
    }

    async fn run_plugin(&self, command: &str, netns: &str) -> Result<Vec<u8>> {
        let conf_file = select_conf_file(&self.conf_dir).await?;
        let raw = tokio::fs::read_to_string(&conf_file).await?;
        let conf = plugin_conf(&raw)
            .map_err(|e| anyhow!("invalid cni configuration {}: {}", conf_file.display(), e))?;
        let plugin_type = conf
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("cni configuration has no plugin type"))?
            .to_string();

        let mut child = Command::new(self.bin_dir.join(&plugin_type))
            .env("CNI_COMMAND", command)
            .env("CNI_CONTAINERID", &self.sandbox_id)
            .env("CNI_NETNS", self.netns_path(netns))
            .env("CNI_IFNAME", CNI_IFNAME)
            .env("CNI_PATH", &self.bin_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| anyhow!("failed to spawn cni plugin {}: {}", plugin_type, e))?;

        let conf_bytes = serde_json::to_vec(&conf).map_err(|e| anyhow!("{}", e))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&conf_bytes).await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(anyhow!(
                "cni plugin {} {} failed: {}",
                plugin_type,
                command,
                String::from_utf8_lossy(&output.stderr)
            )
            .into());
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl PodNetwork for CniPodNetwork {
    async fn when_created(&self, _props: &Properties) -> Result<Option<NetResult>> {
        let name = self.netns_name();
        let output = Command::new("ip")
            .args(["netns", "add", &name])
            .output()
            .await
            .map_err(|e| anyhow!("failed to run ip netns: {}", e))?;
        if !output.status.success() {
            return Err(anyhow!(
                "failed to create netns {}: {}",
                name,
                String::from_utf8_lossy(&output.stderr)
            )
            .into());
        }

        let data = CniData {
            netns: name,
            result: Value::Null,
        };
        Ok(Some(NetResult {
            data: serde_json::to_string(&data).map_err(|e| anyhow!("{}", e))?,
        }))
    }

    async fn when_started(&self, props: &PropertiesRunning) -> Result<Option<NetResult>> {
        let mut data = self.data(&props.properties.data);
        let stdout = self.run_plugin("ADD", &data.netns).await?;
        data.result = serde_json::from_slice(&stdout)
            .map_err(|e| anyhow!("cni plugin returned invalid result: {}", e))?;
        Ok(Some(NetResult {
            data: serde_json::to_string(&data).map_err(|e| anyhow!("{}", e))?,
        }))
    }

    async fn when_stopped(&self, props: &Properties) -> Result<()> {
        let data = self.data(&props.data);
        self.run_plugin("DEL", &data.netns).await?;
        Ok(())
    }

    async fn when_deleted(&self, props: &Properties) -> Result<()> {
        let data = self.data(&props.data);
        let output = Command::new("ip")
            .args(["netns", "delete", &data.netns])
            .output()
            .await
            .map_err(|e| anyhow!("failed to run ip netns: {}", e))?;
        if !output.status.success() {
            // may be gone already, reclamation stays best effort
            warn!(
                "failed to delete netns {}: {}",
                data.netns,
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(())
    }

    async fn status(&self, props: &PropertiesRunning) -> Result<NetStatus> {
        let data = self.data(&props.properties.data);
        Ok(NetStatus {
            ips: parse_result_ips(&data.result),
        })
    }

    async fn container_network(
        &self,
        container_id: &str,
        _annotations: &HashMap<String, String>,
    ) -> Result<Box<dyn ContainerNetwork>> {
        Ok(Box::new(CniContainerNetwork {
            container_id: container_id.to_string(),
        }))
    }
}

struct CniContainerNetwork {
    container_id: String,
}

#[async_trait]
impl ContainerNetwork for CniContainerNetwork {
    async fn when_created(&self, _props: &Properties) -> Result<Option<NetResult>> {
        // the pod interface is shared, containers bring no interface of
        // their own
        debug!("container {} joins the pod netns", self.container_id);
        Ok(None)
    }
}

/// First configuration file of the conf dir in lexical order.
async fn select_conf_file(conf_dir: &Path) -> Result<PathBuf> {
    let mut entries = tokio::fs::read_dir(conf_dir)
        .await
        .map_err(|e| anyhow!("failed to read cni conf dir {}: {}", conf_dir.display(), e))?;
    let mut candidates = vec![];
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        match path.extension().and_then(|e| e.to_str()) {
            Some("conf") | Some("conflist") | Some("json") => candidates.push(path),
            _ => {}
        }
    }
    candidates.sort();
    candidates
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no cni configuration found in {}", conf_dir.display()).into())
}

/// Reduce a network configuration to the conf of its first plugin. Conflists
/// inherit `cniVersion` and `name` from the list level.
fn plugin_conf(raw: &str) -> anyhow::Result<Value> {
    let root: Value = serde_json::from_str(raw)?;
    let plugins = match root.get("plugins") {
        None => return Ok(root),
        Some(plugins) => plugins,
    };
    let mut conf = plugins
        .get(0)
        .cloned()
        .ok_or_else(|| anyhow!("conflist has no plugins"))?;
    let obj = conf
        .as_object_mut()
        .ok_or_else(|| anyhow!("plugin conf is not an object"))?;
    for inherited in ["cniVersion", "name"] {
        if let Some(v) = root.get(inherited) {
            obj.insert(inherited.to_string(), v.clone());
        }
    }
    Ok(conf)
}

/// Addresses of a CNI result, `ips[].address` with the prefix length cut
/// off. Handles both the current and the pre-0.3 (`ip4.ip`) result layout.
fn parse_result_ips(result: &Value) -> Vec<IpAddr> {
    let mut ips = vec![];

    if let Some(entries) = result.get("ips").and_then(Value::as_array) {
        for entry in entries {
            if let Some(address) = entry.get("address").and_then(Value::as_str) {
                if let Ok(ip) = address.split('/').next().unwrap_or("").parse() {
                    ips.push(ip);
                }
            }
        }
    }

    if ips.is_empty() {
        if let Some(address) = result
            .pointer("/ip4/ip")
            .and_then(Value::as_str)
            .and_then(|a| a.split('/').next())
        {
            if let Ok(ip) = address.parse() {
                ips.push(ip);
            }
        }
    }

    ips
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_select_conf_file_lexical_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("99-fallback.conf"), "{}").unwrap();
        std::fs::write(dir.path().join("10-bridge.conflist"), "{}").unwrap();
        std::fs::write(dir.path().join("README"), "not a conf").unwrap();

        let selected = select_conf_file(dir.path()).await.unwrap();
        assert_eq!(selected.file_name().unwrap(), "10-bridge.conflist");
    }

    #[tokio::test]
    async fn test_select_conf_file_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(select_conf_file(dir.path()).await.is_err());
    }

    #[test]
    fn test_plugin_conf_plain_conf_passes_through() {
        let conf = plugin_conf(r#"{"cniVersion":"0.4.0","name":"podnet","type":"bridge"}"#)
            .unwrap();
        assert_eq!(conf["type"], "bridge");
        assert_eq!(conf["name"], "podnet");
    }

    #[test]
    fn test_plugin_conf_conflist_inherits_version_and_name() {
        let conf = plugin_conf(
            r#"{"cniVersion":"1.0.0","name":"podnet","plugins":[{"type":"bridge","bridge":"cni0"},{"type":"portmap"}]}"#,
        )
        .unwrap();
        assert_eq!(conf["type"], "bridge");
        assert_eq!(conf["cniVersion"], "1.0.0");
        assert_eq!(conf["name"], "podnet");
        assert_eq!(conf["bridge"], "cni0");
    }

    #[test]
    fn test_plugin_conf_empty_conflist() {
        assert!(plugin_conf(r#"{"name":"n","plugins":[]}"#).is_err());
    }

    #[test]
    fn test_parse_result_ips() {
        let result: Value = serde_json::from_str(
            r#"{"cniVersion":"1.0.0","ips":[{"address":"10.22.0.5/24","gateway":"10.22.0.1"},{"address":"fd00::5/64"}]}"#,
        )
        .unwrap();
        let ips = parse_result_ips(&result);
        assert_eq!(ips[0], "10.22.0.5".parse::<IpAddr>().unwrap());
        assert_eq!(ips[1], "fd00::5".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_parse_result_ips_legacy_layout() {
        let result: Value =
            serde_json::from_str(r#"{"ip4":{"ip":"10.22.0.9/16"}}"#).unwrap();
        assert_eq!(
            parse_result_ips(&result),
            vec!["10.22.0.9".parse::<IpAddr>().unwrap()]
        );
    }

    #[test]
    fn test_parse_result_ips_empty() {
        assert!(parse_result_ips(&Value::Null).is_empty());
    }

    #[test]
    fn test_mode_data_round_trip() {
        let data = CniData {
            netns: "lxe-sb1".to_string(),
            result: serde_json::json!({"ips":[{"address":"10.22.0.5/24"}]}),
        };
        let encoded = serde_json::to_string(&data).unwrap();
        let decoded: CniData = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.netns, "lxe-sb1");
        assert_eq!(parse_result_ips(&decoded.result).len(), 1);
    }
}
