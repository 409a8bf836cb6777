use std::{env, path::PathBuf, process::Command};

fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());

    println!("cargo:rerun-if-changed=../execguard-ebpf/src");
    println!("cargo:rerun-if-changed=../execguard-common/src");

    let arch = env::var("CARGO_CFG_TARGET_ARCH").unwrap();
    let bpf_target = match arch.as_str() {
        "x86_64" | "x86" | "aarch64" | "arm" | "riscv64" => "bpfel-unknown-none",
        "mips" | "mips64" | "powerpc" | "powerpc64" | "s390x" => "bpfeb-unknown-none",
        _ => "bpfel-unknown-none",
    };

    let ebpf_dir = PathBuf::from("../execguard-ebpf");
    // Separate target directory: the outer cargo holds a lock on the
    // workspace one.
    let ebpf_target_dir = out_dir.join("ebpf-target");
    let cargo = env::var("CARGO").unwrap_or_else(|_| "cargo".to_string());

    let status = Command::new(cargo)
        .current_dir(&ebpf_dir)
        .env("RUSTUP_TOOLCHAIN", "nightly")
        .env("CARGO_TARGET_DIR", &ebpf_target_dir)
        .args([
            "build",
            "--release",
            &format!("--target={bpf_target}"),
            "-Z",
            "build-std=core",
        ])
        .stdout(std::process::Stdio::inherit())
        .stderr(std::process::Stdio::inherit())
        .status()
        .expect("failed to run cargo for the eBPF crate");
    if !status.success() {
        panic!("eBPF build failed");
    }

    let object = ebpf_target_dir.join(format!("{bpf_target}/release/execguard"));
    std::fs::copy(&object, out_dir.join("execguard")).expect("failed to copy eBPF object file");
}
