/* automatically generated by `cargo xtask codegen`, do not edit manually */

use aya_ebpf::cty::{c_char, c_int, c_uint};

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct linux_binprm {
    pub _unused: [u8; 0],
    pub filename: *const c_char,
    pub interp: *const c_char,
}

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct task_struct {
    pub _unused: [u8; 0],
    pub pid: c_int,
    pub tgid: c_int,
    pub sessionid: c_uint,
}
