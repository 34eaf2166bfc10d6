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

//! Capability contract for pluggable pod networking.
//!
//! A plugin gets four lifecycle hooks per pod plus a status probe. Hooks
//! return an opaque result blob which the orchestrator persists into the
//! sandbox (`mode_data`) and hands back on every later call, so a plugin
//! carries no state across process restarts.

use std::collections::HashMap;
use std::net::IpAddr;

use async_trait::async_trait;

use crate::api;
use crate::error::Result;

pub mod bridged;
pub mod cni;

pub use bridged::BridgedPlugin;
pub use cni::CniPlugin;

/// Annotation naming the parent bridge for bridged mode.
pub const ANNOTATION_BRIDGE: &str = "x-lxe-bridge";
/// Annotation carrying additional manager config key/values; interpretation
/// is delegated to the backend.
pub const ANNOTATION_ADDITIONAL_LXD_CONFIG: &str = "x-lxe-additional-lxd-config";

/// Hook input: the persisted result of the previous hook, empty on the first
/// call.
#[derive(Debug, Clone, Default)]
pub struct Properties {
    pub data: String,
}

/// Hook input for a running pod. `pid` is zero when no single pod process
/// exists.
#[derive(Debug, Clone, Default)]
pub struct PropertiesRunning {
    pub properties: Properties,
    pub pid: i64,
}

/// Opaque blob the orchestrator stores as the sandbox `mode_data`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetResult {
    pub data: String,
}

#[derive(Debug, Clone, Default)]
pub struct NetStatus {
    /// The first entry is the canonical pod address.
    pub ips: Vec<IpAddr>,
}

/// A pod networking implementation, selected statically per runtime
/// instance and shared by all RPCs.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Enter the network context of a pod. Pure lookup plus per-pod context
    /// allocation; no side effects on the host yet.
    async fn pod_network(
        &self,
        sandbox_id: &str,
        annotations: &HashMap<String, String>,
    ) -> Result<Box<dyn PodNetwork>>;

    async fn update_runtime_config(&self, config: &api::RuntimeConfig) -> Result<()>;
}

#[async_trait]
pub trait PodNetwork: Send + Sync {
    /// Called once the sandbox exists on the manager. Failure aborts sandbox
    /// creation.
    async fn when_created(&self, props: &Properties) -> Result<Option<NetResult>>;
    /// Called when the sandbox is considered started. Failure aborts sandbox
    /// creation.
    async fn when_started(&self, props: &PropertiesRunning) -> Result<Option<NetResult>>;
    /// Reclamation, best effort: the orchestrator logs and swallows errors.
    async fn when_stopped(&self, props: &Properties) -> Result<()>;
    /// Reclamation, best effort: the orchestrator logs and swallows errors.
    async fn when_deleted(&self, props: &Properties) -> Result<()>;
    async fn status(&self, props: &PropertiesRunning) -> Result<NetStatus>;

    /// Per-container network context within this pod.
    async fn container_network(
        &self,
        container_id: &str,
        annotations: &HashMap<String, String>,
    ) -> Result<Box<dyn ContainerNetwork>>;
}

#[async_trait]
pub trait ContainerNetwork: Send + Sync {
    async fn when_created(&self, props: &Properties) -> Result<Option<NetResult>>;
}

/// Address of the interface carrying the host's default route. The socket is
/// never written to, connect only resolves the route.
pub fn outbound_host_ip() -> Result<IpAddr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
    socket.connect("8.8.8.8:53")?;
    Ok(socket.local_addr()?.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outbound_host_ip_is_not_loopback() {
        // Requires any configured interface; loopback would defeat the
        // advertised streaming base url.
        if let Ok(ip) = outbound_host_ip() {
            assert!(!ip.is_loopback());
        }
    }
}
