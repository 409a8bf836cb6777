#![cfg_attr(not(test), no_std)]

/// Maximum length (including the terminating NUL) of an executable path
/// carried in kernel records and hashed into the allow-set. Paths longer
/// than this are truncated by the kernel probe and therefore never match.
pub const PATH_LEN: usize = 256;

/// How many cgroup ancestor levels the exec hook walks when the task's own
/// cgroup id is not bound (execs inside nested cgroups).
pub const MAX_CGROUP_ANCESTORS: u32 = 10;

pub const MODE_DISABLED: u8 = 0;
pub const MODE_MONITOR: u8 = 1;
pub const MODE_PROTECT: u8 = 2;

pub const ACTION_MONITOR: u8 = 0;
pub const ACTION_DENY: u8 = 1;

pub const KIND_LEARNING: u8 = 0;
pub const KIND_MONITORING: u8 = 1;

/// Index into the `RUNTIME_CONFIG` array map.
pub const CONFIG_LEARNING_ENABLED: u32 = 0;

/// Indices into the `RING_DROPS` array map.
pub const DROPS_LEARNING: u32 = 0;
pub const DROPS_MONITORING: u32 = 1;

/// Value of the `cgroup -> policy` kernel table.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CgroupPolicyValue {
    pub policy_id: u32,
    pub mode: u8,
    pub _pad: [u8; 3],
    pub container_name_hash: u64,
}

/// Key of the presence-only allow-set. The slot index is the two-slot
/// indirection used for atomic allow-list replacement; readers resolve the
/// active slot through the `POLICY_SLOT` map.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AllowedKey {
    pub policy_id: u32,
    pub slot: u32,
    pub container_name_hash: u64,
    pub path_hash: u64,
}

/// Record emitted by the exec hook on both the learning and the monitoring
/// ring. Self-describing: no userspace correlation is needed to interpret it.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ExecEvent {
    /// Cgroup id of the exec'ing task. May be a cgroup nested inside the
    /// container.
    pub cgroup_id: u64,
    /// The bound (container-outer) cgroup id the policy was found under.
    pub tracker_cgroup_id: u64,
    /// Audit session id of the exec'ing task, for filtering interactive
    /// sessions downstream.
    pub session_id: u32,
    pub kind: u8,
    pub action: u8,
    pub _pad: [u8; 2],
    /// NUL-terminated absolute path as observed by the kernel hook.
    pub path: [u8; PATH_LEN],
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for CgroupPolicyValue {}
#[cfg(feature = "user")]
unsafe impl aya::Pod for AllowedKey {}
#[cfg(feature = "user")]
unsafe impl aya::Pod for ExecEvent {}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-1a over the bytes of `data` up to (excluding) the first NUL. Used on
/// both sides of the map boundary: the projector hashes rule paths and
/// container names with it, the exec hook hashes the observed path with the
/// same loop. Byte-exact: no canonicalisation happens on either side.
#[inline]
pub fn fnv1a_64(data: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    let mut i = 0;
    while i < data.len() {
        let b = data[i];
        if b == 0 {
            break;
        }
        hash ^= b as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
        i += 1;
    }
    hash
}
