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

//! Scripted in-memory test doubles: a fake container manager and a
//! recording network plugin.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use crate::api;
use crate::backend::{
    Backend, Container, ContainerStateName, ExecInput, ExecOutput, RuntimeInfo, Sandbox,
    SandboxState, TerminalSize,
};
use crate::error::{Error, Result};
use crate::network::{
    ContainerNetwork, NetResult, NetStatus, Plugin, PodNetwork, Properties, PropertiesRunning,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecCall {
    pub container_id: String,
    pub cmd: Vec<String>,
    pub interactive: bool,
    pub tty: bool,
    pub timeout: i64,
}

#[derive(Default)]
struct FakeState {
    sandboxes: HashMap<String, Sandbox>,
    containers: HashMap<String, Container>,
    next_id: u64,
    exec_stdout: Vec<u8>,
    exec_stderr: Vec<u8>,
    exec_code: i32,
    exec_calls: Vec<ExecCall>,
}

/// In-memory manager with the same id-assignment and not-found behavior the
/// real one shows.
#[derive(Default)]
pub struct FakeBackend {
    state: Mutex<FakeState>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script_exec(&self, stdout: Vec<u8>, stderr: Vec<u8>, code: i32) {
        let mut state = self.state.lock().unwrap();
        state.exec_stdout = stdout;
        state.exec_stderr = stderr;
        state.exec_code = code;
    }

    pub fn exec_calls(&self) -> Vec<ExecCall> {
        self.state.lock().unwrap().exec_calls.clone()
    }

    pub fn sandbox(&self, id: &str) -> Option<Sandbox> {
        self.state.lock().unwrap().sandboxes.get(id).cloned()
    }

    pub fn container(&self, id: &str) -> Option<Container> {
        self.state.lock().unwrap().containers.get(id).cloned()
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn runtime_info(&self) -> Result<RuntimeInfo> {
        Ok(RuntimeInfo {
            version: "1.0".to_string(),
        })
    }

    async fn apply_sandbox(&self, sb: &mut Sandbox) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if sb.id.is_empty() {
            state.next_id += 1;
            sb.id = format!("sb-{}", state.next_id);
            sb.created_at = Some(OffsetDateTime::now_utc());
            sb.state = SandboxState::Ready;
        }
        state.sandboxes.insert(sb.id.clone(), sb.clone());
        Ok(())
    }

    async fn get_sandbox(&self, id: &str) -> Result<Sandbox> {
        self.state
            .lock()
            .unwrap()
            .sandboxes
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("sandbox {}", id)))
    }

    async fn list_sandboxes(&self) -> Result<Vec<Sandbox>> {
        Ok(self.state.lock().unwrap().sandboxes.values().cloned().collect())
    }

    async fn stop_sandbox(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let sb = state
            .sandboxes
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("sandbox {}", id)))?;
        sb.state = SandboxState::NotReady;
        Ok(())
    }

    async fn delete_sandbox(&self, id: &str) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .sandboxes
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("sandbox {}", id)))
    }

    async fn sandbox_containers(&self, id: &str) -> Result<Vec<Container>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .containers
            .values()
            .filter(|c| c.sandbox_id() == id)
            .cloned()
            .collect())
    }

    async fn apply_container(&self, c: &mut Container) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if c.id.is_empty() {
            state.next_id += 1;
            c.id = format!("c-{}", state.next_id);
            c.created_at = Some(OffsetDateTime::now_utc());
            c.state.name = ContainerStateName::Created;
        }
        state.containers.insert(c.id.clone(), c.clone());
        Ok(())
    }

    async fn get_container(&self, id: &str) -> Result<Container> {
        self.state
            .lock()
            .unwrap()
            .containers
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("container {}", id)))
    }

    async fn list_containers(&self) -> Result<Vec<Container>> {
        Ok(self.state.lock().unwrap().containers.values().cloned().collect())
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let c = state
            .containers
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("container {}", id)))?;
        c.state.name = ContainerStateName::Running;
        c.started_at = Some(OffsetDateTime::now_utc());
        Ok(())
    }

    async fn stop_container(&self, id: &str, _timeout: i32) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let c = state
            .containers
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("container {}", id)))?;
        c.state.name = ContainerStateName::Exited;
        c.finished_at = Some(OffsetDateTime::now_utc());
        Ok(())
    }

    async fn delete_container(&self, id: &str) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .containers
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("container {}", id)))
    }

    async fn exec(
        &self,
        container_id: &str,
        cmd: &[String],
        _stdin: ExecInput,
        mut stdout: ExecOutput,
        mut stderr: ExecOutput,
        interactive: bool,
        tty: bool,
        timeout: i64,
        _resize: Option<mpsc::Receiver<TerminalSize>>,
    ) -> Result<i32> {
        let (out, err, code) = {
            let mut state = self.state.lock().unwrap();
            state.exec_calls.push(ExecCall {
                container_id: container_id.to_string(),
                cmd: cmd.to_vec(),
                interactive,
                tty,
                timeout,
            });
            (
                state.exec_stdout.clone(),
                state.exec_stderr.clone(),
                state.exec_code,
            )
        };
        stdout
            .write_all(&out)
            .await
            .map_err(|e| anyhow!("fake exec stdout: {}", e))?;
        stderr
            .write_all(&err)
            .await
            .map_err(|e| anyhow!("fake exec stderr: {}", e))?;
        stdout.shutdown().await.ok();
        stderr.shutdown().await.ok();
        Ok(code)
    }
}

/// Records every hook invocation with the mode-data it was handed, and
/// returns fresh mode-data from the create and start hooks.
pub struct RecordingPlugin {
    events: Arc<Mutex<Vec<String>>>,
    pub fail_when_started: AtomicBool,
    pub fail_when_stopped: AtomicBool,
    status_ips: Mutex<Vec<IpAddr>>,
    pod_cidrs: Mutex<Vec<String>>,
}

impl RecordingPlugin {
    pub fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(vec![])),
            fail_when_started: AtomicBool::new(false),
            fail_when_stopped: AtomicBool::new(false),
            status_ips: Mutex::new(vec![]),
            pod_cidrs: Mutex::new(vec![]),
        }
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn script_status_ips(&self, ips: Vec<IpAddr>) {
        *self.status_ips.lock().unwrap() = ips;
    }

    pub fn pod_cidrs(&self) -> Vec<String> {
        self.pod_cidrs.lock().unwrap().clone()
    }
}

impl Default for RecordingPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Plugin for RecordingPlugin {
    async fn pod_network(
        &self,
        sandbox_id: &str,
        _annotations: &HashMap<String, String>,
    ) -> Result<Box<dyn PodNetwork>> {
        Ok(Box::new(RecordingPodNetwork {
            sandbox_id: sandbox_id.to_string(),
            events: self.events.clone(),
            fail_when_started: self.fail_when_started.load(Ordering::SeqCst),
            fail_when_stopped: self.fail_when_stopped.load(Ordering::SeqCst),
            status_ips: self.status_ips.lock().unwrap().clone(),
        }))
    }

    async fn update_runtime_config(&self, config: &api::RuntimeConfig) -> Result<()> {
        if let Some(network_config) = &config.network_config {
            self.pod_cidrs
                .lock()
                .unwrap()
                .push(network_config.pod_cidr.clone());
        }
        Ok(())
    }
}

struct RecordingPodNetwork {
    sandbox_id: String,
    events: Arc<Mutex<Vec<String>>>,
    fail_when_started: bool,
    fail_when_stopped: bool,
    status_ips: Vec<IpAddr>,
}

impl RecordingPodNetwork {
    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl PodNetwork for RecordingPodNetwork {
    async fn when_created(&self, props: &Properties) -> Result<Option<NetResult>> {
        self.record(format!("created:{}:{}", self.sandbox_id, props.data));
        Ok(Some(NetResult {
            data: format!("create-data-{}", self.sandbox_id),
        }))
    }

    async fn when_started(&self, props: &PropertiesRunning) -> Result<Option<NetResult>> {
        if self.fail_when_started {
            return Err(anyhow!("scripted start failure").into());
        }
        self.record(format!(
            "started:{}:{}",
            self.sandbox_id, props.properties.data
        ));
        Ok(Some(NetResult {
            data: format!("start-data-{}", self.sandbox_id),
        }))
    }

    async fn when_stopped(&self, props: &Properties) -> Result<()> {
        self.record(format!("stopped:{}:{}", self.sandbox_id, props.data));
        if self.fail_when_stopped {
            return Err(anyhow!("scripted stop failure").into());
        }
        Ok(())
    }

    async fn when_deleted(&self, props: &Properties) -> Result<()> {
        self.record(format!("deleted:{}:{}", self.sandbox_id, props.data));
        Ok(())
    }

    async fn status(&self, _props: &PropertiesRunning) -> Result<NetStatus> {
        Ok(NetStatus {
            ips: self.status_ips.clone(),
        })
    }

    async fn container_network(
        &self,
        container_id: &str,
        _annotations: &HashMap<String, String>,
    ) -> Result<Box<dyn ContainerNetwork>> {
        Ok(Box::new(RecordingContainerNetwork {
            container_id: container_id.to_string(),
            events: self.events.clone(),
        }))
    }
}

struct RecordingContainerNetwork {
    container_id: String,
    events: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl ContainerNetwork for RecordingContainerNetwork {
    async fn when_created(&self, props: &Properties) -> Result<Option<NetResult>> {
        self.events.lock().unwrap().push(format!(
            "container-created:{}:{}",
            self.container_id, props.data
        ));
        Ok(Some(NetResult {
            data: format!("container-data-{}", self.container_id),
        }))
    }
}
