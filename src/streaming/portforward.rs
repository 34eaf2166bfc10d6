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

//! Port forwarding into a pod via a local socat child per forwarded port.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use anyhow::anyhow;
use axum::extract::ws::{Message, WebSocket};
use futures::StreamExt;
use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;

use super::exec::forward_messages;
use super::{PortForwardSession, StreamingState};
use crate::error::Result;
use crate::runtime::RuntimeShared;

/// Forward one pod port over the given stream: `stream -> socat stdin`,
/// `socat stdout -> stream`, until the socat child exits.
pub(crate) async fn port_forward<S>(
    shared: &RuntimeShared,
    sandbox_id: &str,
    port: i32,
    stream: S,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let sb = shared
        .get_sandbox(sandbox_id)
        .await
        .map_err(|e| anyhow!("unable to find pod {}: {}", sandbox_id, e))?;

    let pod_ip = shared.get_inet_address(&sb).await;

    look_path("socat")
        .ok_or_else(|| anyhow!("unable to do port forwarding: socat not found in PATH"))?;

    let target = format!("TCP4:{}:{},keepalive", pod_ip, port);
    debug!("executing port forwarding command: socat - {}", target);

    let mut child = Command::new("socat")
        .arg("-")
        .arg(&target)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| anyhow!("failed to spawn socat: {}", e))?;

    let mut child_stdin = child
        .stdin
        .take()
        .ok_or_else(|| anyhow!("no stdin pipe on socat"))?;
    let mut child_stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("no stdout pipe on socat"))?;
    let mut child_stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("no stderr pipe on socat"))?;

    let (mut stream_read, mut stream_write) = tokio::io::split(stream);

    // Attaching the stream to the child's stdin directly would keep the
    // child's exit pending on the client-held TCP session. The copy into a
    // pipe ends on the first write failure after the child is gone and
    // closes the pipe, which unblocks the teardown.
    tokio::spawn(async move {
        if let Err(e) = tokio::io::copy(&mut stream_read, &mut child_stdin).await {
            debug!("pipe copy ended: {}", e);
        }
        if let Err(e) = child_stdin.shutdown().await {
            debug!("pipe close errored: {}", e);
        }
    });

    let stdout_copy = tokio::spawn(async move {
        let _ = tokio::io::copy(&mut child_stdout, &mut stream_write).await;
    });

    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = child_stderr.read_to_end(&mut buf).await;
        buf
    });

    let status = child
        .wait()
        .await
        .map_err(|e| anyhow!("failed to wait for socat: {}", e))?;
    // the stream sees no writes past the child's exit
    let _ = stdout_copy.await;

    if !status.success() {
        let stderr = stderr_task.await.unwrap_or_default();
        return Err(anyhow!(
            "socat exited with {}: {}",
            status,
            String::from_utf8_lossy(&stderr).trim()
        )
        .into());
    }

    Ok(())
}

/// Websocket side of a port-forward session. Each requested port occupies a
/// data/error channel pair, first frame on each channel announces the port
/// in little endian.
pub(crate) async fn serve_port_forward(
    state: Arc<StreamingState>,
    session: PortForwardSession,
    socket: WebSocket,
) {
    debug!(
        "port forward session for sandbox {} starts: ports {:?}",
        session.sandbox_id, session.ports
    );

    let (ws_sink, mut ws_stream) = socket.split();
    let (out_tx, out_rx) = mpsc::channel::<Message>(64);
    let writer = tokio::spawn(forward_messages(ws_sink, out_rx));

    let mut stream_writers: HashMap<u8, tokio::io::WriteHalf<tokio::io::DuplexStream>> =
        HashMap::new();
    let mut forwarders = vec![];

    for (index, port) in session.ports.iter().copied().enumerate() {
        let data_channel = (index as u8) * 2;
        let error_channel = data_channel + 1;

        for channel in [data_channel, error_channel] {
            let mut frame = vec![channel];
            frame.extend_from_slice(&(port as u16).to_le_bytes());
            let _ = out_tx.send(Message::Binary(frame)).await;
        }

        let (host_end, forward_end) = tokio::io::duplex(32 * 1024);
        let (host_read, host_write) = tokio::io::split(host_end);
        stream_writers.insert(data_channel, host_write);

        tokio::spawn(super::exec::pump_output(
            host_read,
            data_channel,
            out_tx.clone(),
        ));

        let state = state.clone();
        let sandbox_id = session.sandbox_id.clone();
        let error_tx = out_tx.clone();
        forwarders.push(tokio::spawn(async move {
            if let Err(e) = port_forward(&state.shared, &sandbox_id, port, forward_end).await {
                warn!("port forward of {}:{} failed: {}", sandbox_id, port, e);
                let mut frame = vec![error_channel];
                frame.extend_from_slice(format!("{:#}", anyhow::Error::from(e)).as_bytes());
                let _ = error_tx.send(Message::Binary(frame)).await;
            }
        }));
    }
    drop(out_tx);

    while let Some(Ok(message)) = ws_stream.next().await {
        match message {
            Message::Binary(data) if !data.is_empty() => {
                if let Some(writer) = stream_writers.get_mut(&data[0]) {
                    if writer.write_all(&data[1..]).await.is_err() {
                        stream_writers.remove(&data[0]);
                    }
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    // closing our stream ends the copies, which in turn closes the socat
    // children
    drop(stream_writers);
    for forwarder in forwarders {
        let _ = forwarder.await;
    }
    let _ = writer.await;

    debug!(
        "port forward session for sandbox {} finished",
        session.sandbox_id
    );
}

/// Resolve an executable on $PATH, the way the shell would.
pub(crate) fn look_path(name: &str) -> Option<PathBuf> {
    look_path_in(name, std::env::var_os("PATH"))
}

fn look_path_in(name: &str, path: Option<OsString>) -> Option<PathBuf> {
    for dir in std::env::split_paths(&path?) {
        if dir.as_os_str().is_empty() {
            continue;
        }
        let candidate = dir.join(name);
        if is_executable(&candidate) {
            return Some(candidate);
        }
    }
    None
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_look_path_in_finds_executables_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("socat");
        std::fs::write(&exe, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();
        std::fs::write(dir.path().join("notes"), "plain file").unwrap();

        let path = Some(OsString::from(dir.path()));
        assert_eq!(look_path_in("socat", path.clone()), Some(exe));
        assert_eq!(look_path_in("notes", path.clone()), None);
        assert_eq!(look_path_in("missing", path), None);
        assert_eq!(look_path_in("socat", None), None);
    }

    #[test]
    fn test_look_path_in_searches_in_order() {
        use std::os::unix::fs::PermissionsExt;

        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        for dir in [&first, &second] {
            let exe = dir.path().join("tool");
            std::fs::write(&exe, "").unwrap();
            std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let joined =
            std::env::join_paths([first.path(), second.path()]).unwrap();
        assert_eq!(
            look_path_in("tool", Some(joined)),
            Some(first.path().join("tool"))
        );
    }
}
