use std::path::Path;

use aya::{
    include_bytes_aligned,
    maps::{Array, MapError},
    programs::{Lsm, ProgramError},
    Btf, BtfError, Ebpf, EbpfError, EbpfLoader,
};
use thiserror::Error;

use execguard_common::CONFIG_LEARNING_ENABLED;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error(transparent)]
    Ebpf(#[from] EbpfError),

    #[error(transparent)]
    Btf(#[from] BtfError),

    #[error(transparent)]
    Program(#[from] ProgramError),

    #[error(transparent)]
    Map(#[from] MapError),

    #[error("program {0} missing from the object file")]
    MissingProgram(&'static str),

    #[error("map {0} missing from the object file")]
    MissingMap(&'static str),
}

/// Loads the execguard BPF object built into the binary and pins its maps
/// under the given BPFFS directory.
pub fn load_bpf<P: AsRef<Path>>(pin_path: P) -> Result<Ebpf, LoadError> {
    let data = include_bytes_aligned!(concat!(env!("OUT_DIR"), "/execguard"));

    let bpf = EbpfLoader::new()
        .map_pin_path(pin_path.as_ref())
        .load(data)?;

    Ok(bpf)
}

/// Seeds the runtime flags the exec hook consults. Must run before
/// attaching so the first intercepted exec already sees them.
pub fn init_runtime_config(bpf: &mut Ebpf, learning_enabled: bool) -> Result<(), LoadError> {
    let mut config: Array<_, u64> = bpf
        .map_mut("RUNTIME_CONFIG")
        .ok_or(LoadError::MissingMap("RUNTIME_CONFIG"))?
        .try_into()?;
    config.set(CONFIG_LEARNING_ENABLED, learning_enabled as u64, 0)?;
    Ok(())
}

pub fn attach_programs(bpf: &mut Ebpf) -> Result<(), LoadError> {
    let btf = Btf::from_sys_fs()?;

    let bprm_check: &mut Lsm = bpf
        .program_mut("bprm_check_security")
        .ok_or(LoadError::MissingProgram("bprm_check_security"))?
        .try_into()?;
    bprm_check.load("bprm_check_security", &btf)?;
    bprm_check.attach()?;

    Ok(())
}
