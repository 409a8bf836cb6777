use std::{collections::BTreeMap, io};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{UnixListener, UnixStream},
    sync::{oneshot, watch},
};

use super::{ContainerStart, EventSender, ResolverEvent};

#[derive(Error, Debug)]
pub enum RuntimeSourceError {
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// One JSON object per line from the runtime's lifecycle hook. The hook
/// invokes us serially per container and reads a single-line response.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
enum HookRequest {
    Start {
        pod_sandbox_id: String,
        pod_uid: String,
        pod_name: String,
        pod_namespace: String,
        #[serde(default)]
        labels: BTreeMap<String, String>,
        container_id: String,
        container_name: String,
        cgroup_id: u64,
        #[serde(default)]
        linux_namespaces: Vec<String>,
    },
    Stop {
        container_id: String,
    },
}

#[derive(Debug, Serialize)]
struct HookResponse {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl HookResponse {
    fn ok() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    fn error(message: String) -> Self {
        Self {
            ok: false,
            error: Some(message),
        }
    }
}

/// Listens on the runtime hook socket until cancellation. An empty socket
/// path never reaches this function; the caller skips the source entirely
/// and container resolution falls back to the pod watch.
pub async fn run(
    socket_path: String,
    tx: EventSender,
    mut cancel: watch::Receiver<bool>,
) -> Result<(), RuntimeSourceError> {
    // A stale socket from a previous agent instance would make bind fail.
    let _ = std::fs::remove_file(&socket_path);
    let listener = UnixListener::bind(&socket_path)?;
    info!("runtime hook socket listening on {socket_path}");

    loop {
        tokio::select! {
            biased;
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        tokio::spawn(handle_connection(stream, tx.clone(), cancel.clone()));
                    }
                    Err(e) => warn!("runtime socket accept failed: {e}"),
                }
            }
        }
    }

    let _ = std::fs::remove_file(&socket_path);
    Ok(())
}

async fn handle_connection(
    stream: UnixStream,
    tx: EventSender,
    mut cancel: watch::Receiver<bool>,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    loop {
        tokio::select! {
            biased;
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    break;
                }
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) if !line.trim().is_empty() => {
                        let response = handle_line(&line, &tx).await;
                        let mut out = serde_json::to_string(&response)
                            .unwrap_or_else(|_| r#"{"ok":false}"#.to_string());
                        out.push('\n');
                        if write_half.write_all(out.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                    Ok(Some(_)) => {}
                    Ok(None) => break,
                    Err(e) => {
                        debug!("runtime hook connection closed: {e}");
                        break;
                    }
                }
            }
        }
    }
}

async fn handle_line(line: &str, tx: &EventSender) -> HookResponse {
    let request: HookRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => return HookResponse::error(format!("malformed hook message: {e}")),
    };

    match request {
        HookRequest::Start {
            pod_sandbox_id,
            pod_uid,
            pod_name,
            pod_namespace,
            labels,
            container_id,
            container_name,
            cgroup_id,
            linux_namespaces: _,
        } => {
            let start = ContainerStart {
                pod_sandbox_id,
                pod_uid,
                pod_name,
                pod_namespace,
                labels,
                container_id,
                container_name,
                cgroup_id,
            };
            match tx.send(ResolverEvent::ContainerStarted(Box::new(start))) {
                Ok(()) => HookResponse::ok(),
                Err(e) => HookResponse::error(e.to_string()),
            }
        }
        HookRequest::Stop { container_id } => {
            let (responder, done) = oneshot::channel();
            if let Err(e) = tx.send(ResolverEvent::ContainerStopped {
                container_id,
                responder,
            }) {
                return HookResponse::error(e.to_string());
            }
            // The runtime must not free the cgroup id before the resolver
            // has removed every derived kernel entry, so this await is the
            // whole point of the stop hook.
            match done.await {
                Ok(()) => HookResponse::ok(),
                Err(_) => HookResponse::error("resolver dropped the stop request".to_string()),
            }
        }
    }
}
