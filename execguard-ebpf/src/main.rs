#![no_std]
#![no_main]

mod maps;
#[allow(non_upper_case_globals)]
#[allow(non_snake_case)]
#[allow(non_camel_case_types)]
#[allow(dead_code)]
mod vmlinux;

use aya_ebpf::{
    cty::c_char,
    helpers::{
        bpf_get_current_ancestor_cgroup_id, bpf_get_current_cgroup_id, bpf_get_current_task,
        bpf_probe_read_kernel, bpf_probe_read_kernel_str_bytes,
    },
    macros::lsm,
    programs::LsmContext,
};
use aya_log_ebpf::debug;

use execguard_common::{
    fnv1a_64, AllowedKey, CgroupPolicyValue, ExecEvent, ACTION_DENY, ACTION_MONITOR,
    CONFIG_LEARNING_ENABLED, DROPS_LEARNING, DROPS_MONITORING, KIND_LEARNING, KIND_MONITORING,
    MAX_CGROUP_ANCESTORS, MODE_DISABLED, MODE_MONITOR, PATH_LEN,
};
use maps::*;
use vmlinux::{linux_binprm, task_struct};

const EPERM: i32 = 1;

/// Resolves the policy binding for the current task's cgroup. Returns the
/// task's own cgroup id, the bound (tracker) cgroup id and the binding.
///
/// The fast path is a direct lookup; execs inside nested cgroups fall back
/// to the tracker cache and finally to an ancestor walk, whose result is
/// cached so the walk runs once per nested cgroup.
#[inline]
unsafe fn resolve_binding() -> Option<(u64, u64, CgroupPolicyValue)> {
    let cgroup = bpf_get_current_cgroup_id();

    if let Some(v) = CGROUP_POLICY.get(&cgroup) {
        return Some((cgroup, cgroup, *v));
    }

    if let Some(outer) = CGROUP_TRACKER.get(&cgroup) {
        let outer = *outer;
        if let Some(v) = CGROUP_POLICY.get(&outer) {
            return Some((cgroup, outer, *v));
        }
        return None;
    }

    // Ancestor level 0 is the root; the deepest bound ancestor wins.
    let mut found: Option<(u64, CgroupPolicyValue)> = None;
    let mut level: u32 = 1;
    while level <= MAX_CGROUP_ANCESTORS {
        let ancestor = bpf_get_current_ancestor_cgroup_id(level);
        if ancestor == 0 {
            break;
        }
        if let Some(v) = CGROUP_POLICY.get(&ancestor) {
            found = Some((ancestor, *v));
        }
        level += 1;
    }

    match found {
        Some((outer, v)) => {
            // Lookup failures here only cost us the cache, not correctness.
            let _ = CGROUP_TRACKER.insert(&cgroup, &outer, 0);
            Some((cgroup, outer, v))
        }
        None => None,
    }
}

#[inline]
unsafe fn learning_enabled() -> bool {
    match RUNTIME_CONFIG.get(CONFIG_LEARNING_ENABLED) {
        Some(v) => *v != 0,
        None => false,
    }
}

#[inline]
unsafe fn current_session_id() -> u32 {
    let task = bpf_get_current_task() as *const task_struct;
    match bpf_probe_read_kernel(&(*task).sessionid) {
        Ok(sid) => sid,
        Err(_) => 0,
    }
}

#[inline]
unsafe fn bump_drop_counter(index: u32) {
    if let Some(counter) = RING_DROPS.get_ptr_mut(index) {
        *counter += 1;
    }
}

/// Emits one record on the given ring; on an overflowed ring the record is
/// dropped and the matching drop counter incremented. The hook never blocks
/// on a full ring.
#[inline]
unsafe fn emit(
    ring: &aya_ebpf::maps::RingBuf,
    drop_index: u32,
    cgroup_id: u64,
    tracker_cgroup_id: u64,
    kind: u8,
    action: u8,
    path: &[u8; PATH_LEN],
) {
    match ring.reserve::<ExecEvent>(0) {
        Some(mut slot) => {
            let event = &mut *slot.as_mut_ptr();
            event.cgroup_id = cgroup_id;
            event.tracker_cgroup_id = tracker_cgroup_id;
            event.session_id = current_session_id();
            event.kind = kind;
            event.action = action;
            event._pad = [0; 2];
            event.path = *path;
            slot.submit(0);
        }
        None => bump_drop_counter(drop_index),
    }
}

unsafe fn try_bprm_check_security(ctx: LsmContext) -> Result<i32, i32> {
    // Host and node processes have no binding; do nothing.
    let (cgroup_id, tracker_cgroup_id, binding) = match resolve_binding() {
        Some(resolved) => resolved,
        None => return Ok(0),
    };

    let mode = match POLICY_MODE.get(&binding.policy_id) {
        Some(m) => *m,
        None => binding.mode,
    };
    if mode == MODE_DISABLED {
        return Ok(0);
    }

    let bprm: *const linux_binprm = ctx.arg(0);
    let filename: *const c_char = bpf_probe_read_kernel(&(*bprm).filename).map_err(|_| 0i32)?;

    let mut path = [0u8; PATH_LEN];
    bpf_probe_read_kernel_str_bytes(filename as *const u8, &mut path).map_err(|_| 0i32)?;

    let slot = match POLICY_SLOT.get(&binding.policy_id) {
        Some(s) => *s,
        None => 0,
    };
    let key = AllowedKey {
        policy_id: binding.policy_id,
        slot,
        container_name_hash: binding.container_name_hash,
        path_hash: fnv1a_64(&path),
    };

    if POLICY_ALLOWED.get(&key).is_some() {
        if learning_enabled() {
            emit(
                &LEARNING_EVENTS,
                DROPS_LEARNING,
                cgroup_id,
                tracker_cgroup_id,
                KIND_LEARNING,
                ACTION_MONITOR,
                &path,
            );
        }
        return Ok(0);
    }

    if mode == MODE_MONITOR {
        emit(
            &MONITORING_EVENTS,
            DROPS_MONITORING,
            cgroup_id,
            tracker_cgroup_id,
            KIND_MONITORING,
            ACTION_MONITOR,
            &path,
        );
        return Ok(0);
    }

    debug!(
        &ctx,
        "denying exec in cgroup {} under policy {}", cgroup_id, binding.policy_id
    );
    emit(
        &MONITORING_EVENTS,
        DROPS_MONITORING,
        cgroup_id,
        tracker_cgroup_id,
        KIND_MONITORING,
        ACTION_DENY,
        &path,
    );
    Err(-EPERM)
}

/// LSM program run on every exec attempt after the kernel resolved the
/// binary. Returning -EPERM makes the exec fail with "operation not
/// permitted" in the calling process.
#[lsm(hook = "bprm_check_security")]
pub fn bprm_check_security(ctx: LsmContext) -> i32 {
    match unsafe { try_bprm_check_security(ctx) } {
        Ok(ret) => ret,
        Err(ret) => ret,
    }
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
