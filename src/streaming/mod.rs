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

//! Exec and port-forward side channel.
//!
//! The RPC surface only mints single-use session URLs; the actual stdio
//! flows over a websocket upgrade against this server, framed with the
//! kubelet streaming channel protocol (one leading channel byte per binary
//! message). A session not claimed within a minute expires.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use log::{info, warn};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::api;
use crate::backend::{ExecInput, ExecOutput, TerminalSize};
use crate::error::{Error, Result};
use crate::network::outbound_host_ip;
use crate::runtime::RuntimeShared;

mod exec;
mod portforward;

#[allow(unused_imports)]
pub(crate) use portforward::look_path;

/// In-memory stdio sink for buffered exec runs.
#[derive(Clone, Default)]
pub(crate) struct SharedBuffer(Arc<std::sync::Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }
}

impl tokio::io::AsyncWrite for SharedBuffer {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        self.0.lock().unwrap().extend_from_slice(buf);
        std::task::Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }
}

/// Subprotocol of the kubelet streaming channel framing.
const STREAM_PROTOCOL_V4: &str = "v4.channel.k8s.io";
/// How long a minted session URL stays claimable.
const SESSION_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub(crate) struct ExecSession {
    pub container_id: String,
    pub cmd: Vec<String>,
    pub tty: bool,
    pub stdin: bool,
    pub stdout: bool,
    pub stderr: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct PortForwardSession {
    pub sandbox_id: String,
    pub ports: Vec<i32>,
}

#[derive(Debug, Clone)]
pub(crate) enum Session {
    Exec(ExecSession),
    PortForward(PortForwardSession),
}

struct SessionEntry {
    session: Session,
    created: Instant,
}

pub(crate) struct StreamingState {
    shared: Arc<RuntimeShared>,
    base_url: String,
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

/// The streaming endpoint. One instance serves all concurrent exec and
/// port-forward sessions.
#[derive(Clone)]
pub struct StreamingServer {
    state: Arc<StreamingState>,
    local_addr: SocketAddr,
}

impl StreamingServer {
    /// Bind the streaming listener and start serving upgrades in the
    /// background. The advertised base url carries the host's outbound
    /// address, not the listen address.
    pub async fn bind(shared: Arc<RuntimeShared>, endpoint: &str, port: u16) -> Result<Self> {
        let listener = TcpListener::bind((endpoint, port))
            .await
            .map_err(|e| anyhow!("failed to bind streaming server on {}:{}: {}", endpoint, port, e))?;
        let local_addr = listener.local_addr()?;

        let advertised = match outbound_host_ip() {
            Ok(ip) => ip,
            Err(e) => {
                warn!("could not find suitable host interface: {}", e);
                local_addr.ip()
            }
        };

        let state = Arc::new(StreamingState {
            shared,
            base_url: format!("http://{}:{}", advertised, local_addr.port()),
            sessions: Mutex::new(HashMap::new()),
        });

        let router = Router::new()
            .route("/exec/:token", get(serve_exec_upgrade))
            .route("/portforward/:token", get(serve_port_forward_upgrade))
            .with_state(state.clone());

        info!("starting streaming server on {}", local_addr);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                warn!("streaming server failed: {}", e);
            }
        });

        Ok(Self { state, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn base_url(&self) -> &str {
        &self.state.base_url
    }

    /// Register an exec session and return its single-use URL.
    pub async fn get_exec(&self, req: &api::ExecRequest) -> Result<api::ExecResponse> {
        if req.container_id.is_empty() {
            return Err(Error::InvalidArgument("missing container id".to_string()));
        }
        if !req.stdin && !req.stdout && !req.stderr {
            return Err(Error::InvalidArgument(
                "one of stdin, stdout and stderr must be set".to_string(),
            ));
        }
        if req.tty && req.stderr {
            return Err(Error::InvalidArgument(
                "tty and stderr are mutually exclusive".to_string(),
            ));
        }

        let token = self
            .state
            .insert(Session::Exec(ExecSession {
                container_id: req.container_id.clone(),
                cmd: req.cmd.clone(),
                tty: req.tty,
                stdin: req.stdin,
                stdout: req.stdout,
                stderr: req.stderr,
            }))
            .await;

        Ok(api::ExecResponse {
            url: format!("{}/exec/{}", self.state.base_url, token),
        })
    }

    /// Register a port-forward session and return its single-use URL.
    pub async fn get_port_forward(
        &self,
        req: &api::PortForwardRequest,
    ) -> Result<api::PortForwardResponse> {
        if req.pod_sandbox_id.is_empty() {
            return Err(Error::InvalidArgument("missing sandbox id".to_string()));
        }

        let token = self
            .state
            .insert(Session::PortForward(PortForwardSession {
                sandbox_id: req.pod_sandbox_id.clone(),
                ports: req.port.clone(),
            }))
            .await;

        Ok(api::PortForwardResponse {
            url: format!("{}/portforward/{}", self.state.base_url, token),
        })
    }

    /// Run a command in a container, wiring the caller's stdio. A missing
    /// stdin is substituted by an empty reader and turns the session
    /// non-interactive. The session is unbounded; its lifetime is the
    /// socket's.
    pub async fn exec(
        &self,
        container_id: &str,
        cmd: &[String],
        stdin: Option<ExecInput>,
        stdout: ExecOutput,
        stderr: ExecOutput,
        tty: bool,
        resize: Option<mpsc::Receiver<TerminalSize>>,
    ) -> Result<()> {
        self.state
            .exec(container_id, cmd, stdin, stdout, stderr, tty, resize)
            .await
    }

    /// Forward a TCP port of the pod over the given stream.
    pub async fn port_forward<S>(&self, sandbox_id: &str, port: i32, stream: S) -> Result<()>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
    {
        portforward::port_forward(&self.state.shared, sandbox_id, port, stream).await
    }
}

impl StreamingState {
    async fn insert(&self, session: Session) -> String {
        let token = Uuid::new_v4().to_string();
        let mut sessions = self.sessions.lock().await;
        sessions.retain(|_, entry| entry.created.elapsed() < SESSION_TTL);
        sessions.insert(
            token.clone(),
            SessionEntry {
                session,
                created: Instant::now(),
            },
        );
        token
    }

    /// Take a pending session; each token is claimable exactly once.
    pub(crate) async fn claim(&self, token: &str) -> Option<Session> {
        let mut sessions = self.sessions.lock().await;
        let entry = sessions.remove(token)?;
        (entry.created.elapsed() < SESSION_TTL).then_some(entry.session)
    }

    pub(crate) async fn exec(
        &self,
        container_id: &str,
        cmd: &[String],
        stdin: Option<ExecInput>,
        stdout: ExecOutput,
        stderr: ExecOutput,
        tty: bool,
        resize: Option<mpsc::Receiver<TerminalSize>>,
    ) -> Result<()> {
        let interactive = stdin.is_some();
        let stdin = stdin.unwrap_or_else(|| Box::new(tokio::io::empty()));

        let result = self
            .shared
            .backend
            .exec(
                container_id,
                cmd,
                stdin,
                stdout,
                stderr,
                interactive,
                tty,
                0,
                resize,
            )
            .await;

        log::debug!(
            "received exit code {:?} for exec {:?} on container {}",
            result,
            cmd,
            container_id
        );

        match result {
            Ok(0) => Ok(()),
            Ok(code) => Err(Error::exec_failed(
                code,
                anyhow!("error executing command {:?}, exit code {}", cmd, code),
            )),
            Err(e) => Err(Error::exec_failed(
                1,
                anyhow::Error::from(e).context(format!("error executing command {:?}", cmd)),
            )),
        }
    }
}

async fn serve_exec_upgrade(
    State(state): State<Arc<StreamingState>>,
    Path(token): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    match state.claim(&token).await {
        Some(Session::Exec(session)) => ws
            .protocols([STREAM_PROTOCOL_V4])
            .on_upgrade(move |socket| exec::serve_exec(state, session, socket))
            .into_response(),
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn serve_port_forward_upgrade(
    State(state): State<Arc<StreamingState>>,
    Path(token): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    match state.claim(&token).await {
        Some(Session::PortForward(session)) => ws
            .protocols([STREAM_PROTOCOL_V4])
            .on_upgrade(move |socket| portforward::serve_port_forward(state, session, socket))
            .into_response(),
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}
