use std::collections::{BTreeMap, BTreeSet};

use futures::StreamExt;
use kube::{
    api::Api,
    runtime::watcher::{self, watcher, Event},
    Client, CustomResource,
};
use log::warn;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::{EventSender, ResolverEvent, ShutdownInProgress};
use crate::resolver::state::{ContainerRules, PolicyMode, PolicyRecord};

/// Cluster-scoped policy resource. The agent only consumes these; the
/// controllers that author and approve them live off-node.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(group = "execguard.dev", version = "v1alpha1", kind = "ExecPolicy")]
#[serde(rename_all = "camelCase")]
pub struct ExecPolicySpec {
    pub mode: ExecPolicyMode,
    #[serde(default)]
    pub rules: BTreeMap<String, ContainerRuleSpec>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ExecPolicyMode {
    Monitor,
    Protect,
    Disabled,
}

impl From<ExecPolicyMode> for PolicyMode {
    fn from(mode: ExecPolicyMode) -> Self {
        match mode {
            ExecPolicyMode::Monitor => PolicyMode::Monitor,
            ExecPolicyMode::Protect => PolicyMode::Protect,
            ExecPolicyMode::Disabled => PolicyMode::Disabled,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContainerRuleSpec {
    #[serde(default)]
    pub allowed_executables: BTreeSet<String>,
}

/// Watches ExecPolicy resources and feeds policy records into the resolver
/// queue.
pub async fn run(client: Client, tx: EventSender, mut cancel: watch::Receiver<bool>) {
    let policies: Api<ExecPolicy> = Api::all(client);
    let mut stream = watcher(policies, watcher::Config::default()).boxed();

    loop {
        tokio::select! {
            biased;
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    break;
                }
            }
            item = stream.next() => {
                match item {
                    Some(Ok(event)) => {
                        if dispatch(event, &tx).is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => warn!("policy watch error: {e}"),
                    None => break,
                }
            }
        }
    }
}

fn dispatch(event: Event<ExecPolicy>, tx: &EventSender) -> Result<(), ShutdownInProgress> {
    match event {
        Event::Init => Ok(()),
        Event::InitApply(policy) | Event::Apply(policy) => match record_from(policy) {
            Some(record) => tx.send(ResolverEvent::PolicyApplied(record)),
            None => Ok(()),
        },
        Event::InitDone => tx.send(ResolverEvent::PolicySyncDone),
        Event::Delete(policy) => match policy.metadata.name {
            Some(name) => tx.send(ResolverEvent::PolicyDeleted(name)),
            None => Ok(()),
        },
    }
}

pub(crate) fn record_from(policy: ExecPolicy) -> Option<PolicyRecord> {
    let name = policy.metadata.name?;
    let generation = policy.metadata.generation.unwrap_or(0);
    let rules = policy
        .spec
        .rules
        .into_iter()
        .map(|(container, spec)| {
            (
                container,
                ContainerRules {
                    allowed_executables: spec.allowed_executables,
                },
            )
        })
        .collect();

    Some(PolicyRecord {
        name,
        mode: policy.spec.mode.into(),
        rules,
        generation,
    })
}
