use std::{fs, io, path::Path};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CheckBpfLsmError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("BPF LSM is not enabled; add 'bpf' to the lsm= kernel parameter")]
    BpfLsmDisabled,
}

/// Checks whether the BPF LSM is active by parsing the comma-separated
/// list in /sys/kernel/security/lsm. Inside containers the file may hide
/// the real state, so callers can skip the check via environment.
pub fn check_bpf_lsm_enabled<P: AsRef<Path>>(sys_lsm_path: P) -> Result<(), CheckBpfLsmError> {
    let active = fs::read_to_string(sys_lsm_path)?;
    if active.trim().split(',').any(|lsm| lsm == "bpf") {
        Ok(())
    } else {
        Err(CheckBpfLsmError::BpfLsmDisabled)
    }
}

/// Resolves a container's cgroup id (the inode number of its cgroup
/// directory) by probing the kubelet cgroup layouts, for nodes where the
/// runtime hook source is disabled. Less timely than the hook, since the
/// directory only exists once the container runs, but the id is the same
/// one the kernel reports.
pub fn container_cgroup_id(cgroup_root: &Path, pod_uid: &str, container_id: &str) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;

    let uid_dashed = pod_uid.replace('-', "_");
    // systemd cgroup driver, per QoS class.
    let systemd_slices = [
        format!("kubepods.slice/kubepods-pod{uid_dashed}.slice"),
        format!(
            "kubepods.slice/kubepods-burstable.slice/kubepods-burstable-pod{uid_dashed}.slice"
        ),
        format!(
            "kubepods.slice/kubepods-besteffort.slice/kubepods-besteffort-pod{uid_dashed}.slice"
        ),
    ];
    for slice in &systemd_slices {
        for scope_prefix in ["cri-containerd-", "crio-", "docker-"] {
            let path = cgroup_root
                .join(slice)
                .join(format!("{scope_prefix}{container_id}.scope"));
            if let Ok(metadata) = fs::metadata(&path) {
                return Some(metadata.ino());
            }
        }
    }
    // cgroupfs driver.
    for qos in ["", "burstable/", "besteffort/"] {
        let path = cgroup_root.join(format!("kubepods/{qos}pod{pod_uid}/{container_id}"));
        if let Ok(metadata) = fs::metadata(&path) {
            return Some(metadata.ino());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn detects_enabled_bpf_lsm() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "lockdown,capability,selinux,bpf").unwrap();
        assert!(check_bpf_lsm_enabled(file.path()).is_ok());
    }

    #[test]
    fn rejects_missing_bpf_lsm() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "lockdown,capability,apparmor").unwrap();
        assert!(matches!(
            check_bpf_lsm_enabled(file.path()),
            Err(CheckBpfLsmError::BpfLsmDisabled)
        ));
    }

    #[test]
    fn cgroup_id_is_the_directory_inode() {
        use std::os::unix::fs::MetadataExt;

        let root = tempfile::tempdir().unwrap();
        let scope = root.path().join(
            "kubepods.slice/kubepods-poda1b2_c3d4.slice/cri-containerd-c0ffee.scope",
        );
        fs::create_dir_all(&scope).unwrap();

        let id = container_cgroup_id(root.path(), "a1b2-c3d4", "c0ffee").unwrap();
        assert_eq!(id, fs::metadata(&scope).unwrap().ino());
    }

    #[test]
    fn unknown_container_has_no_cgroup_id() {
        let root = tempfile::tempdir().unwrap();
        assert!(container_cgroup_id(root.path(), "uid", "cid").is_none());
    }
}
