use std::path::Path;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::Api,
    runtime::watcher::{self, watcher, Event},
    Client,
};
use log::warn;

use tokio::sync::watch;

use super::{EventSender, ResolverEvent, ShutdownInProgress};
use crate::resolver::state::{ContainerStatusSnapshot, PodSnapshot};

const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Watches pods scheduled on this node and feeds full snapshots into the
/// resolver queue. The watcher restarts itself on API errors; a relist
/// simply replays snapshots, which the resolver absorbs idempotently.
///
/// With `resolve_cgroups` set (runtime hook source disabled) the source
/// also probes cgroupfs for each container's cgroup id, so bindings can
/// form from the pod watch alone.
pub async fn run(
    client: Client,
    node_name: String,
    resolve_cgroups: bool,
    tx: EventSender,
    mut cancel: watch::Receiver<bool>,
) {
    let pods: Api<Pod> = Api::all(client);
    let config = watcher::Config::default().fields(&format!("spec.nodeName={node_name}"));
    let mut stream = watcher(pods, config).boxed();

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
                        if dispatch(event, resolve_cgroups, &tx).is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => warn!("pod watch error: {e}"),
                    None => break,
                }
            }
        }
    }
}

fn dispatch(
    event: Event<Pod>,
    resolve_cgroups: bool,
    tx: &EventSender,
) -> Result<(), ShutdownInProgress> {
    match event {
        Event::Init => Ok(()),
        Event::InitApply(pod) | Event::Apply(pod) => match snapshot_from(pod, resolve_cgroups) {
            Some(snapshot) => tx.send(ResolverEvent::PodApplied(snapshot)),
            None => Ok(()),
        },
        Event::InitDone => tx.send(ResolverEvent::PodSyncDone),
        Event::Delete(pod) => match pod.metadata.uid {
            Some(uid) => tx.send(ResolverEvent::PodDeleted(uid)),
            None => Ok(()),
        },
    }
}

pub(crate) fn snapshot_from(pod: Pod, resolve_cgroups: bool) -> Option<PodSnapshot> {
    let uid = pod.metadata.uid?;
    let name = pod.metadata.name.unwrap_or_default();
    let namespace = pod.metadata.namespace.unwrap_or_default();
    let labels = pod.metadata.labels.unwrap_or_default();

    let mut containers = Vec::new();
    if let Some(status) = pod.status {
        for list in [status.init_container_statuses, status.container_statuses] {
            let Some(list) = list else { continue };
            for cs in list {
                let id = cs
                    .container_id
                    .as_deref()
                    .map(|id| strip_runtime_prefix(id).to_string());
                let cgroup_id = match (&id, resolve_cgroups) {
                    (Some(id), true) => {
                        crate::sysutils::container_cgroup_id(Path::new(CGROUP_ROOT), &uid, id)
                    }
                    _ => None,
                };
                containers.push(ContainerStatusSnapshot {
                    name: cs.name,
                    id,
                    image_repo: cs.image,
                    cgroup_id,
                });
            }
        }
    }

    Some(PodSnapshot {
        uid,
        namespace,
        name,
        labels,
        containers,
    })
}

/// Container ids arrive from the status as `<runtime>://<id>`.
fn strip_runtime_prefix(id: &str) -> &str {
    id.split_once("://").map(|(_, rest)| rest).unwrap_or(id)
}
