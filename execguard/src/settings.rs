use config::{Config, ConfigError, Environment};
use serde::Deserialize;

/// Agent configuration, sourced from `EXECGUARD_*` environment variables.
/// `node_name` is the only required option; everything else has defaults.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    /// Name of the node this agent runs on; used to filter the pod watch.
    pub node_name: String,

    /// When false, the learning ring is not pumped and the kernel hook
    /// skips emitting learning records.
    #[serde(default = "default_learning_enabled")]
    pub learning_enabled: bool,

    /// Path to the container runtime lifecycle-hook socket. Empty disables
    /// the runtime source; container resolution then relies on the pod
    /// watch alone.
    #[serde(default)]
    pub container_runtime_socket: String,

    /// Host:port the readiness/liveness endpoints listen on.
    #[serde(default = "default_readiness_endpoint")]
    pub readiness_endpoint: String,

    /// Bounded size of each enriched-event channel.
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// Cap on the map-projector retry backoff, in seconds.
    #[serde(default = "default_projector_retry_max_secs")]
    pub projector_retry_max_secs: u64,

    /// Pod label whose value names the policy enforced on the pod. Pods
    /// without the label are unenforced.
    #[serde(default = "default_policy_label_key")]
    pub policy_label_key: String,

    /// BPFFS directory the maps are pinned under.
    #[serde(default = "default_bpf_pin_path")]
    pub bpf_pin_path: String,
}

fn default_learning_enabled() -> bool {
    true
}

fn default_readiness_endpoint() -> String {
    "0.0.0.0:8787".to_string()
}

fn default_event_channel_capacity() -> usize {
    4096
}

fn default_projector_retry_max_secs() -> u64 {
    60
}

fn default_policy_label_key() -> String {
    "execguard.dev/policy".to_string()
}

fn default_bpf_pin_path() -> String {
    "/sys/fs/bpf/execguard".to_string()
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(Environment::with_prefix("EXECGUARD"))
            .build()?;

        s.try_deserialize()
    }
}
