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

//! Typed facade over the system container manager.
//!
//! The runtime never talks to the manager's wire protocol directly; every
//! RPC reads through the [`Backend`] trait, which is also the serialization
//! point for concurrent lifecycle calls. The manager's records are the only
//! durable store, the runtime keeps no local database.

use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::error::Result;

pub mod device;

pub use device::{Block, Device, Devices, Disk, Protocol, Proxy, ProxyEndpoint};

/// Key prefix under which Kubernetes-originated fields are persisted in the
/// flat instance configuration.
pub const CFG_PREFIX_SECURITY_CONTEXT: &str = "user.linux.security_context";
pub const CFG_NAMESPACE_OPTIONS: &str = "user.linux.security_context.namespace_options";
pub const CFG_CGROUP_PARENT: &str = "user.linux.cgroup_parent";
pub const CFG_SYSCTLS_PREFIX: &str = "user.linux.sysctls.";
/// The manager-native privileged switch, enforced by the backend.
pub const CFG_SECURITY_PRIVILEGED: &str = "security.privileged";
pub const CFG_RAW_LXC: &str = "raw.lxc";
/// Prefix under which the sandbox network record is persisted.
pub const CFG_NETWORK_CONFIG: &str = "user.linux.network_config";

/// Interface queried for a pod address when the network plugin has none.
pub const DEFAULT_INTERFACE: &str = "eth0";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeInfo {
    /// API version reported by the manager.
    pub version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SandboxState {
    #[default]
    Ready,
    NotReady,
}

impl SandboxState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxState::Ready => "ready",
            SandboxState::NotReady => "notready",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContainerStateName {
    Created,
    Running,
    Exited,
    #[default]
    Unknown,
}

impl ContainerStateName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerStateName::Created => "created",
            ContainerStateName::Running => "running",
            ContainerStateName::Exited => "exited",
            ContainerStateName::Unknown => "unknown",
        }
    }

    /// Parse a manager state string, case insensitively. Anything the CRI
    /// state alphabet does not know collapses to `Unknown`.
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "created" => ContainerStateName::Created,
            "running" => ContainerStateName::Running,
            "exited" => ContainerStateName::Exited,
            _ => ContainerStateName::Unknown,
        }
    }
}

/// Pod network mode of a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkMode {
    #[default]
    Bridged,
    Cni,
    Host,
    None,
}

impl NetworkMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkMode::Bridged => "bridged",
            NetworkMode::Cni => "cni",
            NetworkMode::Host => "host",
            NetworkMode::None => "none",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "cni" => NetworkMode::Cni,
            "host" => NetworkMode::Host,
            "none" => NetworkMode::None,
            _ => NetworkMode::Bridged,
        }
    }
}

/// Per-sandbox network record. `mode_data` is an opaque blob owned by the
/// network plugin, persisted so teardown survives a process restart.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkConfig {
    pub mode: NetworkMode,
    pub mode_data: String,
    pub nameservers: Vec<String>,
    pub searches: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SandboxMetadata {
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub attempt: u32,
}

/// A pod-scoped instance group on the manager.
#[derive(Debug, Clone, Default)]
pub struct Sandbox {
    /// Manager-assigned opaque id, immutable after creation. Empty until the
    /// first apply.
    pub id: String,
    pub metadata: SandboxMetadata,
    pub hostname: String,
    pub log_directory: String,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    /// Flat string configuration, the persistence bus for every Kubernetes
    /// field the manager does not model natively.
    pub config: HashMap<String, String>,
    pub devices: Devices,
    pub network: NetworkConfig,
    pub state: SandboxState,
    pub created_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerMetadata {
    pub name: String,
    pub attempt: u32,
}

/// Usage counters of a container; missing manager counters stay zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContainerStats {
    pub cpu_usage: u64,
    pub memory_usage: u64,
    pub filesystem_usage: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ContainerState {
    pub name: ContainerStateName,
    pub stats: ContainerStats,
    /// Interface name to addresses, as reported by the manager.
    pub network: HashMap<String, Vec<String>>,
    pub pid: i64,
}

/// A single container, member of exactly one sandbox.
#[derive(Debug, Clone, Default)]
pub struct Container {
    pub id: String,
    /// The parent sandbox id is always the first profile; configured extra
    /// profiles follow.
    pub profiles: Vec<String>,
    pub metadata: ContainerMetadata,
    pub image: String,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    pub environment: HashMap<String, String>,
    pub devices: Devices,
    pub privileged: bool,
    pub resources: Option<ContainerResources>,
    pub cloud_init_user_data: String,
    pub cloud_init_meta_data: String,
    pub cloud_init_network_config: String,
    pub log_path: String,
    pub state: ContainerState,
    pub created_at: Option<OffsetDateTime>,
    pub started_at: Option<OffsetDateTime>,
    pub finished_at: Option<OffsetDateTime>,
}

impl Container {
    pub fn new(sandbox_id: &str, extra_profiles: &[String]) -> Self {
        let mut profiles = vec![sandbox_id.to_string()];
        profiles.extend_from_slice(extra_profiles);
        Self {
            profiles,
            ..Default::default()
        }
    }

    pub fn sandbox_id(&self) -> &str {
        self.profiles.first().map(String::as_str).unwrap_or("")
    }

    /// First IPv4 address on any of the given interfaces, empty string when
    /// the manager reports none.
    pub fn inet_address(&self, interfaces: &[&str]) -> String {
        for intf in interfaces {
            if let Some(addrs) = self.state.network.get(*intf) {
                for addr in addrs {
                    if addr.parse::<std::net::Ipv4Addr>().is_ok() {
                        return addr.clone();
                    }
                }
            }
        }
        String::new()
    }
}

/// Optional resource limits; absent fields leave the manager default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContainerResources {
    pub cpu_shares: Option<u64>,
    pub cpu_quota: Option<i64>,
    pub cpu_period: Option<u64>,
    pub memory_limit_bytes: Option<i64>,
}

/// Terminal dimensions forwarded on interactive exec resize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub width: u16,
    pub height: u16,
}

pub type ExecInput = Box<dyn AsyncRead + Send + Unpin>;
pub type ExecOutput = Box<dyn AsyncWrite + Send + Unpin>;

/// Thin typed facade over the container manager. Not-found conditions must
/// surface as [`crate::error::Error::NotFound`], the discrimination the
/// idempotent verbs depend on. Implementations must be safe for concurrent
/// use; one instance is shared across all RPCs.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn runtime_info(&self) -> Result<RuntimeInfo>;

    /// Create or update the sandbox. On creation the manager assigns the id
    /// and the created-at timestamp, written back into `sb`.
    async fn apply_sandbox(&self, sb: &mut Sandbox) -> Result<()>;
    async fn get_sandbox(&self, id: &str) -> Result<Sandbox>;
    async fn list_sandboxes(&self) -> Result<Vec<Sandbox>>;
    async fn stop_sandbox(&self, id: &str) -> Result<()>;
    async fn delete_sandbox(&self, id: &str) -> Result<()>;
    /// Containers whose first profile is the given sandbox.
    async fn sandbox_containers(&self, id: &str) -> Result<Vec<Container>>;

    /// Create or update the container, assigning id and created-at on
    /// creation.
    async fn apply_container(&self, c: &mut Container) -> Result<()>;
    async fn get_container(&self, id: &str) -> Result<Container>;
    async fn list_containers(&self) -> Result<Vec<Container>>;
    async fn start_container(&self, id: &str) -> Result<()>;
    /// Graceful stop with a timeout in seconds before the manager kills the
    /// payload.
    async fn stop_container(&self, id: &str, timeout: i32) -> Result<()>;
    /// Forced removal, also of a running container.
    async fn delete_container(&self, id: &str) -> Result<()>;

    /// Run a command in the container, wiring the given stdio. Returns the
    /// process exit code. `timeout` is in seconds, zero means unbounded.
    #[allow(clippy::too_many_arguments)]
    async fn exec(
        &self,
        container_id: &str,
        cmd: &[String],
        stdin: ExecInput,
        stdout: ExecOutput,
        stderr: ExecOutput,
        interactive: bool,
        tty: bool,
        timeout: i64,
        resize: Option<mpsc::Receiver<TerminalSize>>,
    ) -> Result<i32>;
}
