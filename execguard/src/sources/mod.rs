use std::collections::BTreeMap;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::resolver::state::{CgroupId, ContainerId, PodSnapshot, PodUid, PolicyRecord};

pub mod pod;
pub mod policy;
pub mod runtime;

/// Everything the resolver consumes. Sources only construct these and
/// enqueue them; all state mutation happens on the resolver task.
#[derive(Debug)]
pub enum ResolverEvent {
    PodApplied(PodSnapshot),
    PodDeleted(PodUid),
    /// The pod watch finished its initial listing.
    PodSyncDone,
    ContainerStarted(Box<ContainerStart>),
    /// The responder is resolved only after every derived kernel entry for
    /// the container has been removed; the runtime source keeps the
    /// lifecycle hook blocked until then.
    ContainerStopped {
        container_id: ContainerId,
        responder: oneshot::Sender<()>,
    },
    PolicyApplied(PolicyRecord),
    PolicyDeleted(String),
    /// The policy watch finished its initial listing.
    PolicySyncDone,
}

/// Container start notification from the runtime lifecycle hook. Carries
/// enough pod metadata to resolve a policy before the pod watch catches up.
#[derive(Debug, Clone)]
pub struct ContainerStart {
    pub pod_sandbox_id: String,
    pub pod_uid: PodUid,
    pub pod_name: String,
    pub pod_namespace: String,
    pub labels: BTreeMap<String, String>,
    pub container_id: ContainerId,
    pub container_name: String,
    pub cgroup_id: CgroupId,
}

#[derive(Error, Debug)]
#[error("resolver is shutting down")]
pub struct ShutdownInProgress;

/// Send half of the resolver queue. Unbounded on purpose: input events must
/// never be dropped, correctness depends on replayability.
#[derive(Clone)]
pub struct EventSender(mpsc::UnboundedSender<ResolverEvent>);

impl EventSender {
    pub fn send(&self, event: ResolverEvent) -> Result<(), ShutdownInProgress> {
        self.0.send(event).map_err(|_| ShutdownInProgress)
    }
}

pub fn event_channel() -> (EventSender, mpsc::UnboundedReceiver<ResolverEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender(tx), rx)
}
