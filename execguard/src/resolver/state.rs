use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::workload::WorkloadKind;
use execguard_common::{MODE_DISABLED, MODE_MONITOR, MODE_PROTECT};

pub type CgroupId = u64;
pub type PolicyId = u32;
pub type PodUid = String;
pub type ContainerId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyMode {
    Monitor,
    Protect,
    Disabled,
}

impl PolicyMode {
    /// Byte representation shared with the kernel maps.
    pub fn as_kernel(self) -> u8 {
        match self {
            PolicyMode::Disabled => MODE_DISABLED,
            PolicyMode::Monitor => MODE_MONITOR,
            PolicyMode::Protect => MODE_PROTECT,
        }
    }
}

/// Allow-list for one container name within a policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRules {
    pub allowed_executables: BTreeSet<String>,
}

/// A policy as delivered by the policy source. Containers without an entry
/// in `rules` get an empty allow-list: in protect mode every exec in them
/// is denied, in monitor mode every exec is reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyRecord {
    pub name: String,
    pub mode: PolicyMode,
    pub rules: BTreeMap<String, ContainerRules>,
    pub generation: i64,
}

/// Full pod state as delivered by the pod source. Always a complete
/// snapshot, never a delta.
#[derive(Debug, Clone)]
pub struct PodSnapshot {
    pub uid: PodUid,
    pub namespace: String,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub containers: Vec<ContainerStatusSnapshot>,
}

#[derive(Debug, Clone)]
pub struct ContainerStatusSnapshot {
    pub name: String,
    /// Runtime container id with the `<runtime>://` prefix stripped; None
    /// until the runtime has populated the pod status.
    pub id: Option<ContainerId>,
    pub image_repo: String,
    /// Only set when the runtime hook source is disabled and the pod source
    /// resolved the cgroup from cgroupfs itself.
    pub cgroup_id: Option<CgroupId>,
}

#[derive(Debug, Clone)]
pub struct PodRecord {
    pub uid: PodUid,
    pub namespace: String,
    pub name: String,
    pub workload_kind: WorkloadKind,
    pub workload_name: String,
    /// Value of the policy label; None means the pod is unenforced.
    pub policy_label: Option<String>,
    pub containers: BTreeMap<ContainerId, ContainerRecord>,
}

#[derive(Debug, Clone)]
pub struct ContainerRecord {
    pub id: ContainerId,
    pub name: String,
    pub image_repo: String,
    /// Set once the runtime source has observed the container; the record
    /// is complete (and bindable) only with this present.
    pub cgroup_id: Option<CgroupId>,
    /// Bumped whenever the cgroup binding changes, so a restarted container
    /// reusing its id is distinguishable from the previous generation.
    pub generation: u64,
}

impl ContainerRecord {
    pub fn new(id: ContainerId, name: String, image_repo: String) -> Self {
        Self {
            id,
            name,
            image_repo,
            cgroup_id: None,
            generation: 0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.cgroup_id.is_some()
    }
}
