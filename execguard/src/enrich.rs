use std::sync::Arc;

use log::{debug, info};
use serde::Serialize;
use tokio::sync::watch;

use crate::{
    ebpf::pump::{EventQueue, RawEvent},
    resolver::snapshot::SnapshotIndex,
    workload::WorkloadKind,
};
use execguard_common::{ACTION_DENY, KIND_LEARNING, KIND_MONITORING};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventAction {
    Monitor,
    Deny,
}

/// A kernel record joined with resolver state. Learning-stream events have
/// no action; monitoring-stream events always carry one.
#[derive(Debug, Clone, Serialize)]
pub struct EnrichedEvent {
    pub namespace: String,
    pub workload_kind: WorkloadKind,
    pub workload_name: String,
    pub pod_name: String,
    pub container_id: String,
    pub container_name: String,
    pub executable_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<EventAction>,
    /// Audit session id of the exec'ing task; lets consumers filter
    /// interactive (kubectl exec style) sessions.
    pub session_id: u32,
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: &EnrichedEvent);
}

/// Default sink: one JSON object per event through the log facade. The
/// remote exporters plug in behind the same trait.
pub struct LogSink {
    stream: &'static str,
}

impl LogSink {
    pub fn learning() -> Self {
        Self { stream: "learning" }
    }

    pub fn monitoring() -> Self {
        Self {
            stream: "monitoring",
        }
    }
}

impl EventSink for LogSink {
    fn emit(&self, event: &EnrichedEvent) {
        match serde_json::to_string(event) {
            Ok(json) => info!("{} {}", self.stream, json),
            Err(e) => debug!("failed to serialize {} event: {e}", self.stream),
        }
    }
}

/// Joins one raw record with resolver state. Returns None for records that
/// must not reach a sink: host processes (no binding for either cgroup id)
/// and learning records of bare pods, which have no stable workload name to
/// key a policy proposal on.
pub async fn enrich(snapshot: &SnapshotIndex, raw: &RawEvent) -> Option<EnrichedEvent> {
    let mut info = snapshot.lookup(raw.cgroup_id).await;
    if info.is_none() && raw.tracker_cgroup_id != 0 && raw.tracker_cgroup_id != raw.cgroup_id {
        info = snapshot.lookup(raw.tracker_cgroup_id).await;
    }
    let Some(info) = info else {
        debug!(
            "exec record from unbound cgroup {} (host process), path {}",
            raw.cgroup_id, raw.path
        );
        return None;
    };

    if raw.kind == KIND_LEARNING && info.workload_kind == WorkloadKind::Pod {
        return None;
    }

    let action = if raw.kind == KIND_MONITORING {
        Some(if raw.action == ACTION_DENY {
            EventAction::Deny
        } else {
            EventAction::Monitor
        })
    } else {
        None
    };

    Some(EnrichedEvent {
        namespace: info.namespace,
        workload_kind: info.workload_kind,
        workload_name: info.workload_name,
        pod_name: info.pod_name,
        container_id: info.container_id,
        container_name: info.container_name,
        executable_path: raw.path.clone(),
        policy_name: info.policy_name,
        action,
        session_id: raw.session_id,
    })
}

/// Drains one pump queue into one sink until cancellation.
pub async fn run_enricher(
    queue: EventQueue,
    snapshot: SnapshotIndex,
    sink: Arc<dyn EventSink>,
    mut cancel: watch::Receiver<bool>,
) {
    while let Some(raw) = queue.pop(&mut cancel).await {
        if let Some(event) = enrich(&snapshot, &raw).await {
            sink.emit(&event);
        }
    }
}
