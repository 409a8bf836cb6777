use aya_ebpf::{
    macros::map,
    maps::{Array, HashMap, RingBuf},
};

use execguard_common::{AllowedKey, CgroupPolicyValue};

/// Upper bound of container-level cgroups bound on a single node.
const CGROUP_MAX_ENTRIES: u32 = 8192;
/// Upper bound of (policy, slot, container, path) allow entries.
const ALLOWED_MAX_ENTRIES: u32 = 65536;
const POLICY_MAX_ENTRIES: u32 = 1024;

const RING_SIZE: u32 = 256 * 1024;

/// BPF map binding a container cgroup id to the policy enforced on it.
/// Written exclusively by the userspace map projector.
#[map]
pub static CGROUP_POLICY: HashMap<u64, CgroupPolicyValue> =
    HashMap::pinned(CGROUP_MAX_ENTRIES, 0);

/// BPF map caching nested-cgroup -> container-outer-cgroup resolutions, so
/// repeated execs inside nested cgroups skip the ancestor walk. The
/// projector seeds it with the identity entry on bind and purges every
/// entry pointing at a cgroup on unbind.
#[map]
pub static CGROUP_TRACKER: HashMap<u64, u64> = HashMap::pinned(CGROUP_MAX_ENTRIES, 0);

/// Presence-only allow-set keyed by (policy id, slot, container name hash,
/// path hash). Readers resolve the active slot through `POLICY_SLOT`.
#[map]
pub static POLICY_ALLOWED: HashMap<AllowedKey, u8> =
    HashMap::pinned(ALLOWED_MAX_ENTRIES, 0);

/// Fast-path mode switch: policy id -> mode byte. Takes precedence over the
/// mode embedded in `CGROUP_POLICY` values.
#[map]
pub static POLICY_MODE: HashMap<u32, u8> = HashMap::pinned(POLICY_MAX_ENTRIES, 0);

/// Active allow-set slot (0/1) per policy id. Flipped by the projector
/// after the inactive slot has been fully written.
#[map]
pub static POLICY_SLOT: HashMap<u32, u32> = HashMap::pinned(POLICY_MAX_ENTRIES, 0);

/// Runtime flags set once at startup; see `CONFIG_*` indices in
/// execguard-common.
#[map]
pub static RUNTIME_CONFIG: Array<u64> = Array::pinned(4, 0);

/// Per-ring overflow counters; see `DROPS_*` indices in execguard-common.
#[map]
pub static RING_DROPS: Array<u64> = Array::pinned(2, 0);

/// Every exec that matched its allow-set, for policy authoring.
#[map]
pub static LEARNING_EVENTS: RingBuf = RingBuf::with_byte_size(RING_SIZE, 0);

/// Enforcement actions (monitor/deny) on execs that missed the allow-set.
#[map]
pub static MONITORING_EVENTS: RingBuf = RingBuf::with_byte_size(RING_SIZE, 0);
