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

//! Websocket side of an exec session.
//!
//! Channel framing: every binary message leads with the channel byte, stdin
//! 0, stdout 1, stderr 2, a final status on the error channel 3, terminal
//! resize events on 4.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, StreamExt};
use futures::SinkExt;
use log::debug;
use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use super::{ExecSession, StreamingState};
use crate::backend::{ExecInput, ExecOutput, TerminalSize};
use crate::error::Error;

const CHANNEL_STDIN: u8 = 0;
const CHANNEL_STDOUT: u8 = 1;
const CHANNEL_STDERR: u8 = 2;
const CHANNEL_ERROR: u8 = 3;
const CHANNEL_RESIZE: u8 = 4;

const PIPE_BUF: usize = 32 * 1024;

/// Wire layout of a resize event on channel 4.
#[derive(Deserialize)]
struct ResizeEvent {
    #[serde(rename = "Width")]
    width: u16,
    #[serde(rename = "Height")]
    height: u16,
}

pub(crate) async fn serve_exec(state: Arc<StreamingState>, session: ExecSession, socket: WebSocket) {
    debug!(
        "exec session for container {} starts: {:?}",
        session.container_id, session.cmd
    );

    let (ws_sink, mut ws_stream) = socket.split();
    let (out_tx, out_rx) = mpsc::channel::<Message>(64);
    let writer = tokio::spawn(forward_messages(ws_sink, out_rx));

    let (resize_tx, resize_rx) = mpsc::channel::<TerminalSize>(4);

    let (mut stdin_host, stdin_exec) = tokio::io::duplex(PIPE_BUF);
    let (stdout_exec, stdout_host) = tokio::io::duplex(PIPE_BUF);
    let (stderr_exec, stderr_host) = tokio::io::duplex(PIPE_BUF);

    let accept_stdin = session.stdin;
    let reader = tokio::spawn(async move {
        while let Some(Ok(message)) = ws_stream.next().await {
            match message {
                Message::Binary(data) if !data.is_empty() => match data[0] {
                    CHANNEL_STDIN if accept_stdin => {
                        if stdin_host.write_all(&data[1..]).await.is_err() {
                            break;
                        }
                    }
                    CHANNEL_RESIZE => {
                        if let Ok(event) = serde_json::from_slice::<ResizeEvent>(&data[1..]) {
                            let _ = resize_tx
                                .send(TerminalSize {
                                    width: event.width,
                                    height: event.height,
                                })
                                .await;
                        }
                    }
                    _ => {}
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
        // dropping the host end is the stdin EOF of the exec process
    });

    let stdout_pump = tokio::spawn(pump_output(stdout_host, CHANNEL_STDOUT, out_tx.clone()));
    let stderr_pump = tokio::spawn(pump_output(stderr_host, CHANNEL_STDERR, out_tx.clone()));

    let stdin_arg = session
        .stdin
        .then(|| Box::new(stdin_exec) as ExecInput);
    // unrequested output streams are discarded instead of piped, so the
    // backend never blocks on a pipe nobody drains; dropping the unused
    // pipe end lets its pump finish right away
    let stdout_arg: ExecOutput = if session.stdout {
        Box::new(stdout_exec)
    } else {
        drop(stdout_exec);
        Box::new(tokio::io::sink())
    };
    let stderr_arg: ExecOutput = if session.stderr {
        Box::new(stderr_exec)
    } else {
        drop(stderr_exec);
        Box::new(tokio::io::sink())
    };
    let result = state
        .exec(
            &session.container_id,
            &session.cmd,
            stdin_arg,
            stdout_arg,
            stderr_arg,
            session.tty,
            Some(resize_rx),
        )
        .await;

    // exec dropped its pipe ends, the pumps drain what is left and stop
    let _ = stdout_pump.await;
    let _ = stderr_pump.await;

    let status = match &result {
        Ok(()) => json!({"metadata": {}, "status": "Success"}),
        Err(Error::ExecFailed { code, source }) => json!({
            "metadata": {},
            "status": "Failure",
            "reason": "NonZeroExitCode",
            "message": source.to_string(),
            "details": {"causes": [{"reason": "ExitCode", "message": code.to_string()}]},
        }),
        Err(e) => json!({"metadata": {}, "status": "Failure", "message": e.to_string()}),
    };
    let mut frame = vec![CHANNEL_ERROR];
    frame.extend_from_slice(status.to_string().as_bytes());
    let _ = out_tx.send(Message::Binary(frame)).await;
    drop(out_tx);

    reader.abort();
    let _ = writer.await;

    debug!(
        "exec session for container {} finished: {:?}",
        session.container_id, result
    );
}

pub(super) async fn forward_messages(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Message>,
) {
    while let Some(message) = rx.recv().await {
        if sink.send(message).await.is_err() {
            return;
        }
    }
    let _ = sink.send(Message::Close(None)).await;
}

/// Copy one output pipe into channel-prefixed websocket frames.
pub(super) async fn pump_output<R>(mut source: R, channel: u8, tx: mpsc::Sender<Message>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = [0u8; 4096];
    loop {
        match source.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                let mut frame = Vec::with_capacity(n + 1);
                frame.push(channel);
                frame.extend_from_slice(&buf[..n]);
                if tx.send(Message::Binary(frame)).await.is_err() {
                    return;
                }
            }
        }
    }
}
