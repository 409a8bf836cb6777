use std::collections::BTreeMap;

use aya::{
    maps::{HashMap as BpfHashMap, MapData, MapError},
    Ebpf,
};
use log::debug;
use thiserror::Error;

use crate::resolver::state::{CgroupId, ContainerRules, PolicyId, PolicyMode};
use execguard_common::{fnv1a_64, AllowedKey, CgroupPolicyValue};

#[derive(Error, Debug)]
pub enum ProjectorError {
    /// Map update/lookup failed; transient, callers retry with backoff.
    #[error(transparent)]
    Map(#[from] MapError),

    #[error("kernel map {0} is missing from the loaded object")]
    MissingMap(&'static str),
}

/// The only writer to the kernel tables. The resolver drives it; the exec
/// hook reads the result.
pub trait MapProjector: Send {
    /// Creates or replaces the allow-set of a policy. Replacement appears
    /// atomic to the exec hook: it sees either the old or the new set.
    fn set_policy(
        &mut self,
        policy_id: PolicyId,
        mode: PolicyMode,
        allowed_by_container: &BTreeMap<String, ContainerRules>,
    ) -> Result<(), ProjectorError>;

    fn delete_policy(&mut self, policy_id: PolicyId) -> Result<(), ProjectorError>;

    /// Installs the cgroup -> policy entry and the tracker identity entry.
    fn bind_cgroup(
        &mut self,
        cgroup_id: CgroupId,
        tracker_cgroup_id: CgroupId,
        container_name: &str,
        policy_id: PolicyId,
    ) -> Result<(), ProjectorError>;

    /// Removes every kernel entry keyed on the cgroup id, including cached
    /// nested-cgroup tracker entries pointing at it. Must complete before
    /// the kernel frees the cgroup id.
    fn unbind_cgroup(&mut self, cgroup_id: CgroupId) -> Result<(), ProjectorError>;

    /// O(1) mode switch without touching the allow-set.
    fn set_mode(&mut self, policy_id: PolicyId, mode: PolicyMode) -> Result<(), ProjectorError>;
}

/// Projects resolver state into the BPF maps loaded from the execguard
/// object file.
pub struct EbpfMapProjector {
    cgroup_policy: BpfHashMap<MapData, u64, CgroupPolicyValue>,
    cgroup_tracker: BpfHashMap<MapData, u64, u64>,
    policy_allowed: BpfHashMap<MapData, AllowedKey, u8>,
    policy_mode: BpfHashMap<MapData, u32, u8>,
    policy_slot: BpfHashMap<MapData, u32, u32>,
    /// Userspace shadow of mode and active slot per policy id; rebuildable,
    /// but there is exactly one writer so shadowing is safe.
    shadow: std::collections::HashMap<PolicyId, PolicyShadow>,
}

#[derive(Clone, Copy)]
struct PolicyShadow {
    mode: u8,
    active_slot: u32,
}

fn remove_if_present(result: Result<(), MapError>) -> Result<(), ProjectorError> {
    match result {
        Ok(()) | Err(MapError::KeyNotFound) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn take_hash_map<K, V>(
    bpf: &mut Ebpf,
    name: &'static str,
) -> Result<BpfHashMap<MapData, K, V>, ProjectorError>
where
    K: aya::Pod,
    V: aya::Pod,
{
    let map = bpf.take_map(name).ok_or(ProjectorError::MissingMap(name))?;
    Ok(BpfHashMap::try_from(map)?)
}

impl EbpfMapProjector {
    pub fn new(bpf: &mut Ebpf) -> Result<Self, ProjectorError> {
        Ok(Self {
            cgroup_policy: take_hash_map(bpf, "CGROUP_POLICY")?,
            cgroup_tracker: take_hash_map(bpf, "CGROUP_TRACKER")?,
            policy_allowed: take_hash_map(bpf, "POLICY_ALLOWED")?,
            policy_mode: take_hash_map(bpf, "POLICY_MODE")?,
            policy_slot: take_hash_map(bpf, "POLICY_SLOT")?,
            shadow: std::collections::HashMap::new(),
        })
    }

    fn clear_slot(&mut self, policy_id: PolicyId, slot: u32) -> Result<(), ProjectorError> {
        let stale: Vec<AllowedKey> = self
            .policy_allowed
            .keys()
            .filter_map(|k| k.ok())
            .filter(|k| k.policy_id == policy_id && k.slot == slot)
            .collect();
        for key in stale {
            self.policy_allowed.remove(&key)?;
        }
        Ok(())
    }
}

impl MapProjector for EbpfMapProjector {
    fn set_policy(
        &mut self,
        policy_id: PolicyId,
        mode: PolicyMode,
        allowed_by_container: &BTreeMap<String, ContainerRules>,
    ) -> Result<(), ProjectorError> {
        let active = self
            .shadow
            .get(&policy_id)
            .map(|s| s.active_slot)
            .unwrap_or(0);
        let staging = 1 - active;
        debug!("projecting policy {policy_id} into slot {staging}");

        // Write the new set into the inactive slot, flip the active-slot
        // pointer, then drop the stale slot. Readers never observe a
        // partial set.
        self.clear_slot(policy_id, staging)?;
        for (container_name, rules) in allowed_by_container {
            let container_name_hash = fnv1a_64(container_name.as_bytes());
            for path in &rules.allowed_executables {
                let key = AllowedKey {
                    policy_id,
                    slot: staging,
                    container_name_hash,
                    path_hash: fnv1a_64(path.as_bytes()),
                };
                self.policy_allowed.insert(key, 1, 0)?;
            }
        }
        self.policy_mode.insert(policy_id, mode.as_kernel(), 0)?;
        self.policy_slot.insert(policy_id, staging, 0)?;
        self.clear_slot(policy_id, active)?;

        self.shadow.insert(
            policy_id,
            PolicyShadow {
                mode: mode.as_kernel(),
                active_slot: staging,
            },
        );
        Ok(())
    }

    fn delete_policy(&mut self, policy_id: PolicyId) -> Result<(), ProjectorError> {
        debug!("deleting policy {policy_id} from kernel maps");
        self.clear_slot(policy_id, 0)?;
        self.clear_slot(policy_id, 1)?;
        // A never-inserted key is already the desired end state.
        remove_if_present(self.policy_mode.remove(&policy_id))?;
        remove_if_present(self.policy_slot.remove(&policy_id))?;
        self.shadow.remove(&policy_id);
        Ok(())
    }

    fn bind_cgroup(
        &mut self,
        cgroup_id: CgroupId,
        tracker_cgroup_id: CgroupId,
        container_name: &str,
        policy_id: PolicyId,
    ) -> Result<(), ProjectorError> {
        debug!("binding cgroup {cgroup_id} to policy {policy_id}");
        let mode = self
            .shadow
            .get(&policy_id)
            .map(|s| s.mode)
            .unwrap_or(execguard_common::MODE_DISABLED);
        let value = CgroupPolicyValue {
            policy_id,
            mode,
            _pad: [0; 3],
            container_name_hash: fnv1a_64(container_name.as_bytes()),
        };
        self.cgroup_policy.insert(cgroup_id, value, 0)?;
        self.cgroup_tracker.insert(cgroup_id, tracker_cgroup_id, 0)?;
        Ok(())
    }

    fn unbind_cgroup(&mut self, cgroup_id: CgroupId) -> Result<(), ProjectorError> {
        debug!("unbinding cgroup {cgroup_id}");
        remove_if_present(self.cgroup_policy.remove(&cgroup_id))?;
        // Purge the identity entry and any nested-cgroup cache entries the
        // exec hook added for this binding.
        let stale: Vec<u64> = self
            .cgroup_tracker
            .iter()
            .filter_map(|r| r.ok())
            .filter(|(nested, outer)| *nested == cgroup_id || *outer == cgroup_id)
            .map(|(nested, _)| nested)
            .collect();
        for nested in stale {
            remove_if_present(self.cgroup_tracker.remove(&nested))?;
        }
        Ok(())
    }

    fn set_mode(&mut self, policy_id: PolicyId, mode: PolicyMode) -> Result<(), ProjectorError> {
        debug!("switching policy {policy_id} mode");
        self.policy_mode.insert(policy_id, mode.as_kernel(), 0)?;
        if let Some(shadow) = self.shadow.get_mut(&policy_id) {
            shadow.mode = mode.as_kernel();
        }
        Ok(())
    }
}
