use std::{collections::HashMap, sync::Arc};

use serde::Serialize;
use tokio::sync::RwLock;

use crate::workload::WorkloadKind;

use super::state::{CgroupId, ContainerId};

/// Everything the event enricher needs to know about one bound or
/// observed container, keyed by its cgroup id.
#[derive(Debug, Clone, Serialize)]
pub struct EnrichInfo {
    pub namespace: String,
    pub pod_name: String,
    pub workload_kind: WorkloadKind,
    pub workload_name: String,
    pub container_id: ContainerId,
    pub container_name: String,
    pub policy_name: Option<String>,
}

/// Read-side view of resolver state. Single writer (the resolver task),
/// many readers (the enricher). Replaced wholesale on every reconcile, so
/// readers never observe a half-applied update.
#[derive(Clone, Default)]
pub struct SnapshotIndex {
    inner: Arc<RwLock<HashMap<CgroupId, EnrichInfo>>>,
}

impl SnapshotIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn replace(&self, next: HashMap<CgroupId, EnrichInfo>) {
        *self.inner.write().await = next;
    }

    pub async fn lookup(&self, cgroup_id: CgroupId) -> Option<EnrichInfo> {
        self.inner.read().await.get(&cgroup_id).cloned()
    }
}
