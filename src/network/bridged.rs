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

//! Bridged pod networking: every pod nic is attached to a host bridge, the
//! manager's DHCP hands out addresses. The plugin itself never knows pod
//! addresses, `status` stays empty and the orchestrator falls back to
//! container introspection.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use anyhow::anyhow;
use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::{
    ContainerNetwork, NetResult, NetStatus, Plugin, PodNetwork, Properties, PropertiesRunning,
    ANNOTATION_BRIDGE,
};
use crate::api;
use crate::config::Config;
use crate::error::Result;

/// Persisted mode-data of a bridged pod.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
pub(crate) struct BridgedData {
    pub bridge: String,
}

pub struct BridgedPlugin {
    bridge: String,
    pod_cidr: Mutex<Option<String>>,
}

impl BridgedPlugin {
    pub fn new(config: &Config) -> Self {
        Self {
            bridge: config.bridge.clone(),
            pod_cidr: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Plugin for BridgedPlugin {
    async fn pod_network(
        &self,
        sandbox_id: &str,
        annotations: &HashMap<String, String>,
    ) -> Result<Box<dyn PodNetwork>> {
        // a sandbox may pin its parent bridge by annotation
        let bridge = annotations
            .get(ANNOTATION_BRIDGE)
            .cloned()
            .unwrap_or_else(|| self.bridge.clone());
        Ok(Box::new(BridgedPodNetwork {
            sandbox_id: sandbox_id.to_string(),
            bridge,
        }))
    }

    async fn update_runtime_config(&self, config: &api::RuntimeConfig) -> Result<()> {
        if let Some(network_config) = &config.network_config {
            if !network_config.pod_cidr.is_empty() {
                info!("pod cidr updated to {}", network_config.pod_cidr);
                *self.pod_cidr.lock().unwrap() = Some(network_config.pod_cidr.clone());
            }
        }
        Ok(())
    }
}

struct BridgedPodNetwork {
    sandbox_id: String,
    bridge: String,
}

impl BridgedPodNetwork {
    fn result(&self) -> Result<Option<NetResult>> {
        let data = serde_json::to_string(&BridgedData {
            bridge: self.bridge.clone(),
        })
        .map_err(|e| anyhow!("failed to serialize bridged network data: {}", e))?;
        Ok(Some(NetResult { data }))
    }
}

#[async_trait]
impl PodNetwork for BridgedPodNetwork {
    async fn when_created(&self, _props: &Properties) -> Result<Option<NetResult>> {
        debug!(
            "sandbox {} joins bridge {}",
            self.sandbox_id, self.bridge
        );
        self.result()
    }

    async fn when_started(&self, _props: &PropertiesRunning) -> Result<Option<NetResult>> {
        if !Path::new("/sys/class/net").join(&self.bridge).exists() {
            return Err(anyhow!("bridge {} does not exist", self.bridge).into());
        }
        self.result()
    }

    async fn when_stopped(&self, _props: &Properties) -> Result<()> {
        Ok(())
    }

    async fn when_deleted(&self, _props: &Properties) -> Result<()> {
        Ok(())
    }

    async fn status(&self, _props: &PropertiesRunning) -> Result<NetStatus> {
        // addresses are assigned by the bridge's DHCP, only the container
        // itself knows them
        Ok(NetStatus::default())
    }

    async fn container_network(
        &self,
        container_id: &str,
        _annotations: &HashMap<String, String>,
    ) -> Result<Box<dyn ContainerNetwork>> {
        Ok(Box::new(BridgedContainerNetwork {
            container_id: container_id.to_string(),
        }))
    }
}

struct BridgedContainerNetwork {
    container_id: String,
}

#[async_trait]
impl ContainerNetwork for BridgedContainerNetwork {
    async fn when_created(&self, _props: &Properties) -> Result<Option<NetResult>> {
        // the nic is part of the sandbox profile, nothing to persist per
        // container
        debug!("container {} inherits the sandbox bridge", self.container_id);
        Ok(None)
    }
}
