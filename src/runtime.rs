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

//! The CRI runtime service: lifecycle orchestration over the container
//! manager, the network plugin and the streaming side channel.
//!
//! No sandbox or container state is cached in-process; every verb reads
//! through the backend, which is the serialization point for overlapping
//! calls. Idempotence of stop and remove rests solely on the backend's
//! not-found discrimination.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::anyhow;
use log::{debug, error, info};
use tonic::{Request, Response, Status};

use crate::api;
use crate::api::RuntimeService;
use crate::backend::{
    Backend, Block, Container, ContainerMetadata, ContainerStateName, Device, Disk, NetworkMode,
    Sandbox, SandboxMetadata, CFG_RAW_LXC, DEFAULT_INTERFACE,
};
use crate::config::{Config, NETWORK_PLUGIN_CNI, NETWORK_PLUGIN_DEFAULT};
use crate::convert;
use crate::error::{Error, Result};
use crate::network::{outbound_host_ip, Plugin, Properties, PropertiesRunning};
use crate::streaming::{SharedBuffer, StreamingServer};

/// Version of the CRI protocol surface.
const CRI_VERSION: &str = "0.1.0";
/// Runtime name reported by Version.
const RUNTIME_NAME: &str = "lxe";

/// Grace period per container when a sandbox cascade stops its containers.
const SANDBOX_STOP_TIMEOUT: i32 = 30;

fn wrap(e: Error, context: String) -> Error {
    Error::Other(anyhow::Error::from(e).context(context))
}

/// State shared between the RPC surface and the streaming service. The
/// streaming service keeps a handle to this, never to the server itself;
/// the runtime outlives it.
pub struct RuntimeShared {
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) network: Arc<dyn Plugin>,
    pub(crate) config: Config,
}

impl RuntimeShared {
    pub fn new(config: Config, backend: Arc<dyn Backend>, network: Arc<dyn Plugin>) -> Self {
        Self {
            backend,
            network,
            config,
        }
    }

    /// Fetch a sandbox and rehydrate its network record from the flat
    /// configuration, the record's durable home across process restarts.
    pub(crate) async fn get_sandbox(&self, id: &str) -> Result<Sandbox> {
        let mut sb = self.backend.get_sandbox(id).await?;
        sb.network = convert::decode_network_config(&sb.config);
        Ok(sb)
    }

    /// The address of a sandbox, empty when nothing is known. Host network
    /// reports the host's outbound interface; CNI asks the plugin; bridged
    /// and an answerless plugin fall back to the first running container's
    /// default interface.
    pub(crate) async fn get_inet_address(&self, sb: &Sandbox) -> String {
        match sb.network.mode {
            NetworkMode::Host => {
                return match outbound_host_ip() {
                    Ok(ip) => ip.to_string(),
                    Err(e) => {
                        error!("couldn't choose host interface: {}", e);
                        String::new()
                    }
                };
            }
            NetworkMode::None => return String::new(),
            NetworkMode::Cni => {
                let pod_net = match self.network.pod_network(&sb.id, &sb.annotations).await {
                    Ok(pod_net) => pod_net,
                    Err(e) => {
                        error!("couldn't get cni pod network: {}", e);
                        return String::new();
                    }
                };
                let props = PropertiesRunning {
                    properties: Properties {
                        data: sb.network.mode_data.clone(),
                    },
                    pid: 0,
                };
                match pod_net.status(&props).await {
                    Ok(status) => {
                        if let Some(ip) = status.ips.first() {
                            return ip.to_string();
                        }
                    }
                    Err(e) => {
                        error!("couldn't get status of cni pod network: {}", e);
                        return String::new();
                    }
                }
            }
            NetworkMode::Bridged => {}
        }

        let containers = match self.backend.sandbox_containers(&sb.id).await {
            Ok(containers) => containers,
            Err(e) => {
                error!("couldn't list containers while looking for an address: {}", e);
                return String::new();
            }
        };
        for c in containers {
            if c.state.name != ContainerStateName::Running {
                continue;
            }
            let ip = c.inet_address(&[DEFAULT_INTERFACE]);
            if !ip.is_empty() {
                return ip;
            }
        }
        String::new()
    }

    /// Stop every container of the sandbox with the cascade grace period.
    async fn stop_containers(&self, sb: &Sandbox) -> Result<()> {
        for c in self.backend.sandbox_containers(&sb.id).await? {
            self.stop_container(&c.id, SANDBOX_STOP_TIMEOUT).await?;
        }
        Ok(())
    }

    /// A concurrent remove may win the race; that is a success here.
    async fn stop_container(&self, id: &str, timeout: i32) -> Result<()> {
        match self.backend.stop_container(id, timeout).await {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }

    async fn delete_containers(&self, sb: &Sandbox) -> Result<()> {
        for c in self.backend.sandbox_containers(&sb.id).await? {
            self.backend.delete_container(&c.id).await?;
        }
        Ok(())
    }

    /// Persist a hook result as the sandbox mode-data.
    async fn handle_network_result(
        &self,
        sb: &mut Sandbox,
        result: Option<crate::network::NetResult>,
    ) -> Result<()> {
        if let Some(result) = result {
            sb.network.mode_data = result.data;
            convert::encode_network_config(sb);
            self.backend.apply_sandbox(sb).await?;
        }
        Ok(())
    }

    /// Fire the create and start hooks for a fresh sandbox, persisting each
    /// returned result before the next hook runs.
    async fn create_sandbox_network(&self, sb: &mut Sandbox) -> Result<()> {
        let pod_net = self
            .network
            .pod_network(&sb.id, &sb.annotations)
            .await
            .map_err(|e| wrap(e, format!("can't enter sandbox {} network context", sb.id)))?;

        let result = pod_net
            .when_created(&Properties::default())
            .await
            .map_err(|e| wrap(e, format!("can't create sandbox {} network context", sb.id)))?;
        self.handle_network_result(sb, result)
            .await
            .map_err(|e| wrap(e, format!("can't save create sandbox {} network result", sb.id)))?;

        // a pod sandbox is created started, so the started hook fires here
        let result = pod_net
            .when_started(&PropertiesRunning {
                properties: Properties {
                    data: sb.network.mode_data.clone(),
                },
                // with a real 1:n pod process this would be its pid
                pid: 0,
            })
            .await
            .map_err(|e| wrap(e, format!("can't start sandbox {} network context", sb.id)))?;
        self.handle_network_result(sb, result)
            .await
            .map_err(|e| wrap(e, format!("can't save start sandbox {} network result", sb.id)))?;

        Ok(())
    }

    /// Fire the per-container create hook; its result also lands in the
    /// sandbox mode-data.
    async fn create_container_network(&self, sb: &mut Sandbox, c: &Container) -> Result<()> {
        let pod_net = self.network.pod_network(&sb.id, &sb.annotations).await?;
        let container_net = pod_net.container_network(&c.id, &c.annotations).await?;
        let result = container_net.when_created(&Properties::default()).await?;
        self.handle_network_result(sb, result).await
    }

    /// Best-effort reclamation hook, errors are logged and swallowed.
    async fn reclaim_network(&self, sb: &Sandbox, deleted: bool) {
        if sb.network.mode == NetworkMode::Host {
            return;
        }
        let props = Properties {
            data: sb.network.mode_data.clone(),
        };
        if let Ok(pod_net) = self.network.pod_network(&sb.id, &sb.annotations).await {
            let result = if deleted {
                pod_net.when_deleted(&props).await
            } else {
                pod_net.when_stopped(&props).await
            };
            if let Err(e) = result {
                debug!("network reclamation for sandbox {} failed: {}", sb.id, e);
            }
        }
    }
}

/// The CRI runtime server backed by an LXD-style container manager.
pub struct RuntimeServer {
    shared: Arc<RuntimeShared>,
    stream: StreamingServer,
}

impl RuntimeServer {
    /// Build the server and start the streaming side channel. The runtime is
    /// constructed first, then handed into the streaming service as a plain
    /// lookup handle.
    pub async fn new(
        config: Config,
        backend: Arc<dyn Backend>,
        network: Arc<dyn Plugin>,
    ) -> Result<Self> {
        let endpoint = config.streaming_endpoint.clone();
        let port = config.streaming_port;
        let shared = Arc::new(RuntimeShared::new(config, backend, network));
        let stream = StreamingServer::bind(shared.clone(), &endpoint, port).await?;
        Ok(Self { shared, stream })
    }

    pub fn streaming(&self) -> &StreamingServer {
        &self.stream
    }

    /// Host the runtime RPC endpoint. Serves until the process ends.
    pub async fn serve(self, addr: SocketAddr) -> Result<()> {
        info!("starting runtime rpc server on {}", addr);
        tonic::transport::Server::builder()
            .add_service(api::RuntimeServiceServer::from_arc(Arc::new(self)))
            .serve(addr)
            .await
            .map_err(|e| anyhow!("runtime rpc server failed: {}", e))?;
        Ok(())
    }
}

#[tonic::async_trait]
impl RuntimeService for RuntimeServer {
    async fn version(
        &self,
        request: Request<api::VersionRequest>,
    ) -> std::result::Result<Response<api::VersionResponse>, Status> {
        debug!("Version triggered: {:?}", request.get_ref());

        let info = self.shared.backend.runtime_info().await.map_err(|e| {
            error!("unable to get server environment: {}", e);
            Status::from(e)
        })?;

        let response = api::VersionResponse {
            version: CRI_VERSION.to_string(),
            runtime_name: RUNTIME_NAME.to_string(),
            runtime_version: env!("CARGO_PKG_VERSION").to_string(),
            runtime_api_version: info.version,
        };
        debug!("Version responded: {:?}", response);
        Ok(Response::new(response))
    }

    async fn run_pod_sandbox(
        &self,
        request: Request<api::RunPodSandboxRequest>,
    ) -> std::result::Result<Response<api::RunPodSandboxResponse>, Status> {
        debug!("RunPodSandbox triggered: {:?}", request.get_ref());
        let req = request.into_inner();
        let config = req.config.unwrap_or_default();
        let meta = config.metadata.clone().unwrap_or_default();
        info!(
            "RunPodSandbox called: sandbox {} in namespace {} with uid {}",
            meta.name, meta.namespace, meta.uid
        );

        let mut sb = Sandbox {
            hostname: config.hostname.clone(),
            log_directory: config.log_directory.clone(),
            metadata: SandboxMetadata {
                attempt: meta.attempt,
                name: meta.name.clone(),
                namespace: meta.namespace.clone(),
                uid: meta.uid.clone(),
            },
            labels: config.labels.clone(),
            annotations: config.annotations.clone(),
            ..Default::default()
        };

        if let Some(dns) = &config.dns_config {
            sb.network.nameservers = dns.servers.clone();
            sb.network.searches = dns.searches.clone();
        }

        // An explicitly requested host network namespace wins; otherwise the
        // configured plugin decides the mode.
        let host_network = config
            .linux
            .as_ref()
            .and_then(|linux| linux.security_context.as_ref())
            .and_then(|sc| sc.namespace_options.as_ref())
            .map(|nso| nso.network == api::NamespaceMode::Node as i32)
            .unwrap_or(false);

        if host_network {
            sb.network.mode = NetworkMode::Host;
            convert::append_if_set(
                &mut sb.config,
                CFG_RAW_LXC,
                &format!("lxc.include = {}", self.shared.config.hostnetwork_file),
            );
        } else {
            sb.network.mode = match self.shared.config.network_plugin.as_str() {
                NETWORK_PLUGIN_DEFAULT => NetworkMode::Bridged,
                NETWORK_PLUGIN_CNI => NetworkMode::Cni,
                other => {
                    let err = Error::UnknownNetworkPlugin(other.to_string());
                    error!("{}", err);
                    return Err(err.into());
                }
            };
        }

        // Proxy devices cover the host ports in every mode except host
        // network, where the ports are already on the host.
        if sb.network.mode != NetworkMode::Host {
            convert::apply_port_mappings(&mut sb, &config.port_mappings);
        }

        if let Some(linux) = &config.linux {
            convert::encode_linux_config(&mut sb, linux);
        }

        convert::encode_network_config(&mut sb);

        self.shared.backend.apply_sandbox(&mut sb).await.map_err(|e| {
            error!(
                "RunPodSandbox: sandbox {} failed to create: {}",
                meta.name, e
            );
            Status::from(e)
        })?;

        if sb.network.mode != NetworkMode::Host {
            if let Err(e) = self.shared.create_sandbox_network(&mut sb).await {
                let e = anyhow::Error::from(e);
                error!("{:#}", e);
                return Err(Status::internal(format!("{:#}", e)));
            }
        }

        info!(
            "RunPodSandbox successful: created sandbox {} for uid {}",
            sb.id, meta.uid
        );

        let response = api::RunPodSandboxResponse {
            pod_sandbox_id: sb.id,
        };
        debug!("RunPodSandbox responded: {:?}", response);
        Ok(Response::new(response))
    }

    async fn stop_pod_sandbox(
        &self,
        request: Request<api::StopPodSandboxRequest>,
    ) -> std::result::Result<Response<api::StopPodSandboxResponse>, Status> {
        let req = request.into_inner();
        info!("StopPodSandbox called: sandbox {}", req.pod_sandbox_id);
        debug!("StopPodSandbox triggered: {:?}", req);

        let sb = match self.shared.get_sandbox(&req.pod_sandbox_id).await {
            Ok(sb) => sb,
            // already reclaimed, the kubelet stops eagerly and repeatedly
            Err(e) if e.is_not_found() => {
                return Ok(Response::new(api::StopPodSandboxResponse {}))
            }
            Err(e) => {
                error!(
                    "StopPodSandbox: sandbox {} failed to get: {}",
                    req.pod_sandbox_id, e
                );
                return Err(e.into());
            }
        };

        self.shared.stop_containers(&sb).await.map_err(|e| {
            error!(
                "StopPodSandbox: sandbox {} failed to stop containers: {}",
                sb.id, e
            );
            Status::from(e)
        })?;

        self.shared.backend.stop_sandbox(&sb.id).await.map_err(|e| {
            error!("StopPodSandbox: sandbox {} failed to stop: {}", sb.id, e);
            Status::from(e)
        })?;

        self.shared.reclaim_network(&sb, false).await;

        info!("StopPodSandbox successful: sandbox {}", sb.id);
        Ok(Response::new(api::StopPodSandboxResponse {}))
    }

    async fn remove_pod_sandbox(
        &self,
        request: Request<api::RemovePodSandboxRequest>,
    ) -> std::result::Result<Response<api::RemovePodSandboxResponse>, Status> {
        let req = request.into_inner();
        info!("RemovePodSandbox called: sandbox {}", req.pod_sandbox_id);
        debug!("RemovePodSandbox triggered: {:?}", req);

        let sb = match self.shared.get_sandbox(&req.pod_sandbox_id).await {
            Ok(sb) => sb,
            Err(e) if e.is_not_found() => {
                return Ok(Response::new(api::RemovePodSandboxResponse {}))
            }
            Err(e) => {
                error!(
                    "RemovePodSandbox: sandbox {} failed to get: {}",
                    req.pod_sandbox_id, e
                );
                return Err(e.into());
            }
        };

        self.shared.stop_containers(&sb).await.map_err(|e| {
            error!(
                "RemovePodSandbox: sandbox {} failed to stop containers: {}",
                sb.id, e
            );
            Status::from(e)
        })?;

        self.shared.delete_containers(&sb).await.map_err(|e| {
            error!(
                "RemovePodSandbox: sandbox {} failed to delete containers: {}",
                sb.id, e
            );
            Status::from(e)
        })?;

        self.shared.backend.delete_sandbox(&sb.id).await.map_err(|e| {
            error!("RemovePodSandbox: sandbox {} failed to delete: {}", sb.id, e);
            Status::from(e)
        })?;

        self.shared.reclaim_network(&sb, true).await;

        info!("RemovePodSandbox successful: sandbox {}", sb.id);
        Ok(Response::new(api::RemovePodSandboxResponse {}))
    }

    async fn pod_sandbox_status(
        &self,
        request: Request<api::PodSandboxStatusRequest>,
    ) -> std::result::Result<Response<api::PodSandboxStatusResponse>, Status> {
        debug!("PodSandboxStatus triggered: {:?}", request.get_ref());
        let req = request.into_inner();

        let sb = self
            .shared
            .get_sandbox(&req.pod_sandbox_id)
            .await
            .map_err(|e| {
                error!(
                    "PodSandboxStatus: sandbox {} failed to get: {}",
                    req.pod_sandbox_id, e
                );
                Status::from(e)
            })?;

        let mut status = api::PodSandboxStatus {
            id: sb.id.clone(),
            metadata: Some(api::PodSandboxMetadata {
                attempt: sb.metadata.attempt,
                name: sb.metadata.name.clone(),
                namespace: sb.metadata.namespace.clone(),
                uid: sb.metadata.uid.clone(),
            }),
            linux: Some(api::LinuxPodSandboxStatus::default()),
            labels: sb.labels.clone(),
            annotations: sb.annotations.clone(),
            created_at: convert::ts_nanos(sb.created_at),
            state: convert::state_sandbox_as_cri(sb.state),
            network: Some(api::PodSandboxNetworkStatus::default()),
            ..Default::default()
        };

        if let Some(namespaces) = convert::decode_namespace_options(&sb.config) {
            status.linux = Some(api::LinuxPodSandboxStatus {
                namespaces: Some(namespaces),
            });
        }

        let ip = self.shared.get_inet_address(&sb).await;
        if !ip.is_empty() {
            if let Some(network) = status.network.as_mut() {
                network.ip = ip;
            }
        }

        let response = api::PodSandboxStatusResponse {
            status: Some(status),
            info: HashMap::new(),
        };
        debug!("PodSandboxStatus responded: {:?}", response);
        Ok(Response::new(response))
    }

    async fn list_pod_sandbox(
        &self,
        request: Request<api::ListPodSandboxRequest>,
    ) -> std::result::Result<Response<api::ListPodSandboxResponse>, Status> {
        debug!("ListPodSandbox triggered: {:?}", request.get_ref());
        let filter = request.into_inner().filter;

        let sandboxes = self.shared.backend.list_sandboxes().await.map_err(|e| {
            error!("ListPodSandbox: failed to list sandboxes: {}", e);
            Status::from(e)
        })?;

        let mut items = vec![];
        for sb in sandboxes {
            if let Some(filter) = &filter {
                if !filter.id.is_empty() && filter.id != sb.id {
                    continue;
                }
                if let Some(state) = &filter.state {
                    if state.state != convert::state_sandbox_as_cri(sb.state) {
                        continue;
                    }
                }
                if !convert::compare_filter_map(&sb.labels, &filter.label_selector) {
                    continue;
                }
            }

            items.push(api::PodSandbox {
                id: sb.id.clone(),
                created_at: convert::ts_nanos(sb.created_at),
                metadata: Some(api::PodSandboxMetadata {
                    attempt: sb.metadata.attempt,
                    name: sb.metadata.name.clone(),
                    namespace: sb.metadata.namespace.clone(),
                    uid: sb.metadata.uid.clone(),
                }),
                state: convert::state_sandbox_as_cri(sb.state),
                labels: sb.labels,
                annotations: sb.annotations,
                ..Default::default()
            });
        }

        Ok(Response::new(api::ListPodSandboxResponse { items }))
    }

    async fn create_container(
        &self,
        request: Request<api::CreateContainerRequest>,
    ) -> std::result::Result<Response<api::CreateContainerResponse>, Status> {
        debug!("CreateContainer triggered: {:?}", request.get_ref());
        let req = request.into_inner();
        let config = req.config.unwrap_or_default();
        let meta = config.metadata.clone().unwrap_or_default();
        info!(
            "CreateContainer called: container {} for sandbox {}",
            meta.name, req.pod_sandbox_id
        );

        let mut c = Container::new(&req.pod_sandbox_id, &self.shared.config.lxd_profiles);
        c.labels = config.labels.clone();
        c.annotations = config.annotations.clone();
        c.metadata = ContainerMetadata {
            attempt: meta.attempt,
            name: meta.name.clone(),
        };
        c.log_path = config.log_path.clone();
        c.image = config.image.as_ref().map(|i| i.image.clone()).unwrap_or_default();

        for mnt in &config.mounts {
            c.devices.upsert(Device::Disk(Disk {
                path: convert::rewrite_container_path(&mnt.container_path),
                source: mnt.host_path.clone(),
                readonly: mnt.readonly,
                optional: false,
                ..Default::default()
            }));
        }

        for dev in &config.devices {
            c.devices.upsert(Device::Block(Block {
                source: dev.host_path.clone(),
                path: dev.container_path.clone(),
            }));
        }

        c.privileged = config
            .linux
            .as_ref()
            .and_then(|linux| linux.security_context.as_ref())
            .map(|sc| sc.privileged)
            .unwrap_or(false);

        convert::apply_environment(&mut c, &config.envs);
        convert::apply_resources(
            &mut c,
            config.linux.as_ref().and_then(|linux| linux.resources.as_ref()),
        );

        self.shared.backend.apply_container(&mut c).await.map_err(|e| {
            error!(
                "CreateContainer: container {} failed to create: {}",
                meta.name, e
            );
            Status::from(e)
        })?;

        let mut sb = self
            .shared
            .get_sandbox(c.sandbox_id())
            .await
            .map_err(Status::from)?;

        if sb.network.mode != NetworkMode::Host {
            self.shared
                .create_container_network(&mut sb, &c)
                .await
                .map_err(|e| {
                    error!(
                        "CreateContainer: container {} network setup failed: {}",
                        c.id, e
                    );
                    Status::from(e)
                })?;
        }

        info!(
            "CreateContainer successful: created container {} for sandbox {}",
            c.id, req.pod_sandbox_id
        );

        let response = api::CreateContainerResponse { container_id: c.id };
        debug!("CreateContainer responded: {:?}", response);
        Ok(Response::new(response))
    }

    async fn start_container(
        &self,
        request: Request<api::StartContainerRequest>,
    ) -> std::result::Result<Response<api::StartContainerResponse>, Status> {
        let req = request.into_inner();
        info!("StartContainer called: container {}", req.container_id);
        debug!("StartContainer triggered: {:?}", req);

        let c = self
            .shared
            .backend
            .get_container(&req.container_id)
            .await
            .map_err(|e| {
                error!(
                    "StartContainer: container {} failed to get: {}",
                    req.container_id, e
                );
                Status::from(e)
            })?;

        self.shared.backend.start_container(&c.id).await.map_err(|e| {
            error!("StartContainer: container {} failed to start: {}", c.id, e);
            Status::from(e)
        })?;

        info!("StartContainer successful: container {}", c.id);
        Ok(Response::new(api::StartContainerResponse {}))
    }

    async fn stop_container(
        &self,
        request: Request<api::StopContainerRequest>,
    ) -> std::result::Result<Response<api::StopContainerResponse>, Status> {
        let req = request.into_inner();
        info!("StopContainer called: container {}", req.container_id);
        debug!("StopContainer triggered: {:?}", req);

        let c = match self.shared.backend.get_container(&req.container_id).await {
            Ok(c) => c,
            Err(e) if e.is_not_found() => {
                return Ok(Response::new(api::StopContainerResponse {}))
            }
            Err(e) => {
                error!(
                    "StopContainer: container {} failed to get: {}",
                    req.container_id, e
                );
                return Err(e.into());
            }
        };

        self.shared
            .stop_container(&c.id, req.timeout as i32)
            .await
            .map_err(|e| {
                error!("StopContainer: container {} failed to stop: {}", c.id, e);
                Status::from(e)
            })?;

        info!("StopContainer successful: container {}", c.id);
        Ok(Response::new(api::StopContainerResponse {}))
    }

    async fn remove_container(
        &self,
        request: Request<api::RemoveContainerRequest>,
    ) -> std::result::Result<Response<api::RemoveContainerResponse>, Status> {
        let req = request.into_inner();
        info!("RemoveContainer called: container {}", req.container_id);
        debug!("RemoveContainer triggered: {:?}", req);

        let c = match self.shared.backend.get_container(&req.container_id).await {
            Ok(c) => c,
            Err(e) if e.is_not_found() => {
                return Ok(Response::new(api::RemoveContainerResponse {}))
            }
            Err(e) => {
                error!(
                    "RemoveContainer: container {} failed to get: {}",
                    req.container_id, e
                );
                return Err(e.into());
            }
        };

        self.shared.backend.delete_container(&c.id).await.map_err(|e| {
            error!("RemoveContainer: container {} failed to remove: {}", c.id, e);
            Status::from(e)
        })?;

        info!("RemoveContainer successful: container {}", c.id);
        Ok(Response::new(api::RemoveContainerResponse {}))
    }

    async fn list_containers(
        &self,
        request: Request<api::ListContainersRequest>,
    ) -> std::result::Result<Response<api::ListContainersResponse>, Status> {
        debug!("ListContainers triggered: {:?}", request.get_ref());
        let filter = request.into_inner().filter;

        let containers = self.shared.backend.list_containers().await.map_err(|e| {
            error!("ListContainers: failed to list containers: {}", e);
            Status::from(e)
        })?;

        let mut response = api::ListContainersResponse::default();
        for c in containers {
            if let Some(filter) = &filter {
                if !filter.id.is_empty() && filter.id != c.id {
                    continue;
                }
                if let Some(state) = &filter.state {
                    if state.state != convert::state_container_as_cri(c.state.name) {
                        continue;
                    }
                }
                if !filter.pod_sandbox_id.is_empty() && filter.pod_sandbox_id != c.sandbox_id() {
                    continue;
                }
                if !convert::compare_filter_map(&c.labels, &filter.label_selector) {
                    continue;
                }
            }
            response.containers.push(convert::to_cri_container(&c));
        }

        Ok(Response::new(response))
    }

    async fn container_status(
        &self,
        request: Request<api::ContainerStatusRequest>,
    ) -> std::result::Result<Response<api::ContainerStatusResponse>, Status> {
        debug!("ContainerStatus triggered: {:?}", request.get_ref());
        let req = request.into_inner();

        let c = self
            .shared
            .backend
            .get_container(&req.container_id)
            .await
            .map_err(|e| {
                error!(
                    "ContainerStatus: container {} failed to get: {}",
                    req.container_id, e
                );
                Status::from(e)
            })?;

        let response = convert::to_cri_status_response(&c);
        debug!("ContainerStatus responded: {:?}", response);
        Ok(Response::new(response))
    }

    async fn update_container_resources(
        &self,
        request: Request<api::UpdateContainerResourcesRequest>,
    ) -> std::result::Result<Response<api::UpdateContainerResourcesResponse>, Status> {
        debug!("UpdateContainerResources triggered: {:?}", request.get_ref());
        Err(Error::NotImplemented("UpdateContainerResources").into())
    }

    async fn reopen_container_log(
        &self,
        request: Request<api::ReopenContainerLogRequest>,
    ) -> std::result::Result<Response<api::ReopenContainerLogResponse>, Status> {
        debug!("ReopenContainerLog triggered: {:?}", request.get_ref());
        Err(Error::NotImplemented("ReopenContainerLog").into())
    }

    async fn exec_sync(
        &self,
        request: Request<api::ExecSyncRequest>,
    ) -> std::result::Result<Response<api::ExecSyncResponse>, Status> {
        debug!("ExecSync triggered: {:?}", request.get_ref());
        let req = request.into_inner();

        let stdout = SharedBuffer::new();
        let stderr = SharedBuffer::new();

        let code = self
            .shared
            .backend
            .exec(
                &req.container_id,
                &req.cmd,
                Box::new(tokio::io::empty()),
                Box::new(stdout.clone()),
                Box::new(stderr.clone()),
                false,
                false,
                req.timeout,
                None,
            )
            .await
            .map_err(|e| {
                error!(
                    "ExecSync: exec {:?} on container {} failed: {}",
                    req.cmd, req.container_id, e
                );
                Status::from(e)
            })?;

        debug!(
            "received exit code {} for exec {:?} on container {}",
            code, req.cmd, req.container_id
        );

        Ok(Response::new(api::ExecSyncResponse {
            stdout: stdout.contents(),
            stderr: stderr.contents(),
            exit_code: code,
        }))
    }

    async fn exec(
        &self,
        request: Request<api::ExecRequest>,
    ) -> std::result::Result<Response<api::ExecResponse>, Status> {
        debug!("Exec triggered: {:?}", request.get_ref());

        let response = self.stream.get_exec(request.get_ref()).await.map_err(|e| {
            error!(
                "Exec: container {} failed to prepare exec endpoint: {}",
                request.get_ref().container_id,
                e
            );
            Status::from(e)
        })?;

        debug!("Exec responded: {:?}", response);
        Ok(Response::new(response))
    }

    async fn attach(
        &self,
        request: Request<api::AttachRequest>,
    ) -> std::result::Result<Response<api::AttachResponse>, Status> {
        debug!("Attach triggered: {:?}", request.get_ref());
        Err(Error::NotImplemented("Attach").into())
    }

    async fn port_forward(
        &self,
        request: Request<api::PortForwardRequest>,
    ) -> std::result::Result<Response<api::PortForwardResponse>, Status> {
        debug!("PortForward triggered: {:?}", request.get_ref());

        let response = self
            .stream
            .get_port_forward(request.get_ref())
            .await
            .map_err(|e| {
                error!("PortForward: failed to prepare endpoint: {}", e);
                Status::from(e)
            })?;

        debug!("PortForward responded: {:?}", response);
        Ok(Response::new(response))
    }

    async fn container_stats(
        &self,
        request: Request<api::ContainerStatsRequest>,
    ) -> std::result::Result<Response<api::ContainerStatsResponse>, Status> {
        debug!("ContainerStats triggered: {:?}", request.get_ref());
        let req = request.into_inner();

        let c = self
            .shared
            .backend
            .get_container(&req.container_id)
            .await
            .map_err(|e| {
                error!(
                    "ContainerStats: container {} failed to get: {}",
                    req.container_id, e
                );
                Status::from(e)
            })?;

        Ok(Response::new(api::ContainerStatsResponse {
            stats: Some(convert::to_cri_stats(&c)),
        }))
    }

    async fn list_container_stats(
        &self,
        request: Request<api::ListContainerStatsRequest>,
    ) -> std::result::Result<Response<api::ListContainerStatsResponse>, Status> {
        debug!("ListContainerStats triggered: {:?}", request.get_ref());
        let filter = request.into_inner().filter;

        let mut response = api::ListContainerStatsResponse::default();

        if let Some(filter) = &filter {
            if !filter.id.is_empty() {
                let c = self.shared.backend.get_container(&filter.id).await.map_err(|e| {
                    error!(
                        "ListContainerStats: container {} failed to get: {}",
                        filter.id, e
                    );
                    Status::from(e)
                })?;
                response.stats.push(convert::to_cri_stats(&c));
                return Ok(Response::new(response));
            }
        }

        let containers = self.shared.backend.list_containers().await.map_err(|e| {
            error!("ListContainerStats: failed to list containers: {}", e);
            Status::from(e)
        })?;

        for c in containers {
            if let Some(filter) = &filter {
                if !filter.pod_sandbox_id.is_empty() && filter.pod_sandbox_id != c.sandbox_id() {
                    continue;
                }
                if !convert::compare_filter_map(&c.labels, &filter.label_selector) {
                    continue;
                }
            }
            response.stats.push(convert::to_cri_stats(&c));
        }

        Ok(Response::new(response))
    }

    async fn update_runtime_config(
        &self,
        request: Request<api::UpdateRuntimeConfigRequest>,
    ) -> std::result::Result<Response<api::UpdateRuntimeConfigResponse>, Status> {
        debug!("UpdateRuntimeConfig triggered: {:?}", request.get_ref());
        let req = request.into_inner();

        self.shared
            .network
            .update_runtime_config(&req.runtime_config.unwrap_or_default())
            .await
            .map_err(|e| {
                error!("UpdateRuntimeConfig: {}", e);
                Status::from(e)
            })?;

        Ok(Response::new(api::UpdateRuntimeConfigResponse {}))
    }

    async fn status(
        &self,
        request: Request<api::StatusRequest>,
    ) -> std::result::Result<Response<api::StatusResponse>, Status> {
        debug!("Status triggered: {:?}", request.get_ref());

        // TODO: probe the backend and the network plugin instead of
        // hardcoding readiness
        let response = api::StatusResponse {
            status: Some(api::RuntimeStatus {
                conditions: vec![
                    api::RuntimeCondition {
                        r#type: api::RUNTIME_READY.to_string(),
                        status: true,
                        ..Default::default()
                    },
                    api::RuntimeCondition {
                        r#type: api::NETWORK_READY.to_string(),
                        status: true,
                        ..Default::default()
                    },
                ],
            }),
            info: HashMap::new(),
        };

        debug!("Status responded: {:?}", response);
        Ok(Response::new(response))
    }
}
