pub mod ebpf;
pub mod enrich;
pub mod health;
pub mod resolver;
pub mod settings;
pub mod sources;
pub mod sysutils;
pub mod workload;
