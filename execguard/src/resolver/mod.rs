use std::{
    collections::{BTreeSet, HashMap},
    time::Duration,
};

use log::{debug, warn};
use tokio::{
    sync::{mpsc, watch},
    time::sleep,
};

use crate::{
    ebpf::projector::{MapProjector, ProjectorError},
    health::ReadyFlag,
    sources::{ContainerStart, ResolverEvent},
    workload,
};

pub mod snapshot;
pub mod state;

use snapshot::{EnrichInfo, SnapshotIndex};
use state::{
    CgroupId, ContainerId, ContainerRecord, PodRecord, PodSnapshot, PodUid, PolicyId, PolicyRecord,
};

const RETRY_INITIAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
struct PolicyEntry {
    id: PolicyId,
    record: PolicyRecord,
}

/// The resolver's intent that a cgroup is bound to a policy, together with
/// the inputs the binding was derived from so changes are detectable.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Assignment {
    policy_id: PolicyId,
    policy_name: String,
    container_name: String,
}

/// Central state machine joining the pod, container-runtime and policy
/// sources into a consistent pod/container/cgroup/policy graph, and the
/// only driver of the map projector.
///
/// All state is owned exclusively by the task running [`Resolver::run`];
/// sources communicate through the unbounded event queue and the enricher
/// through the read-only [`SnapshotIndex`].
pub struct Resolver<P: MapProjector> {
    projector: P,
    policy_label_key: String,
    retry_max: Duration,

    pods: HashMap<PodUid, PodRecord>,
    policies: HashMap<String, PolicyEntry>,
    container_index: HashMap<ContainerId, PodUid>,
    cg_index: HashMap<CgroupId, (PodUid, ContainerId)>,
    assignments: HashMap<CgroupId, Assignment>,
    /// Monotonic; an id is never reused for a different policy name within
    /// the process lifetime.
    next_policy_id: PolicyId,

    snapshot: SnapshotIndex,
    ready: ReadyFlag,
    pod_synced: bool,
    policy_synced: bool,
    shutting_down: bool,
}

impl<P: MapProjector> Resolver<P> {
    pub fn new(
        projector: P,
        policy_label_key: String,
        retry_max: Duration,
        snapshot: SnapshotIndex,
        ready: ReadyFlag,
    ) -> Self {
        Self {
            projector,
            policy_label_key,
            retry_max,
            pods: HashMap::new(),
            policies: HashMap::new(),
            container_index: HashMap::new(),
            cg_index: HashMap::new(),
            assignments: HashMap::new(),
            next_policy_id: 1,
            snapshot,
            ready,
            pod_synced: false,
            policy_synced: false,
            shutting_down: false,
        }
    }

    /// Drains the event queue until cancellation, then tears down every
    /// kernel entry so a restarted agent never inherits a stale policy-id
    /// mapping.
    pub async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<ResolverEvent>,
        mut cancel: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                biased;
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        break;
                    }
                }
                event = rx.recv() => {
                    match event {
                        Some(event) => {
                            self.handle(event).await;
                            while let Ok(event) = rx.try_recv() {
                                self.handle(event).await;
                            }
                            self.update_readiness();
                        }
                        None => break,
                    }
                }
            }
        }
        self.shutdown(&mut rx).await;
    }

    async fn handle(&mut self, event: ResolverEvent) {
        match event {
            ResolverEvent::PodApplied(snapshot) => {
                self.apply_pod(snapshot);
                self.reconcile().await;
            }
            ResolverEvent::PodDeleted(uid) => {
                self.apply_pod_delete(&uid);
                self.reconcile().await;
            }
            ResolverEvent::PodSyncDone => self.pod_synced = true,
            ResolverEvent::ContainerStarted(start) => {
                self.apply_container_start(*start);
                self.reconcile().await;
            }
            ResolverEvent::ContainerStopped {
                container_id,
                responder,
            } => {
                self.apply_container_stop(&container_id);
                // The stop hook stays blocked until the kernel entries are
                // gone; only then may the runtime free the cgroup id.
                self.reconcile().await;
                let _ = responder.send(());
            }
            ResolverEvent::PolicyApplied(record) => {
                self.apply_policy_put(record).await;
                self.reconcile().await;
            }
            ResolverEvent::PolicyDeleted(name) => {
                self.apply_policy_delete(&name).await;
            }
            ResolverEvent::PolicySyncDone => self.policy_synced = true,
        }
    }

    fn update_readiness(&self) {
        if self.pod_synced && self.policy_synced {
            self.ready.set(true);
        }
    }

    async fn shutdown(mut self, rx: &mut mpsc::UnboundedReceiver<ResolverEvent>) {
        self.shutting_down = true;
        // Late events still get handled (stop hooks must be unblocked),
        // but projector failures are no longer retried.
        while let Ok(event) = rx.try_recv() {
            self.handle(event).await;
        }

        let bound: Vec<CgroupId> = self.assignments.keys().copied().collect();
        for cgroup_id in bound {
            self.project(|p| p.unbind_cgroup(cgroup_id)).await;
            self.assignments.remove(&cgroup_id);
        }
        let policy_ids: Vec<PolicyId> = self.policies.values().map(|e| e.id).collect();
        for policy_id in policy_ids {
            self.project(|p| p.delete_policy(policy_id)).await;
        }
        self.ready.set(false);
        debug!("resolver teardown complete");
    }

    /// Runs one projector operation, retrying transient kernel errors with
    /// exponential backoff. A failure never discards userspace state; during
    /// shutdown a single attempt is made and failures are skipped.
    async fn project<F>(&mut self, mut op: F)
    where
        F: FnMut(&mut P) -> Result<(), ProjectorError>,
    {
        let mut delay = RETRY_INITIAL;
        loop {
            match op(&mut self.projector) {
                Ok(()) => return,
                Err(e) if self.shutting_down => {
                    warn!("projector error during shutdown, skipping: {e}");
                    return;
                }
                Err(e) => {
                    warn!("projector error: {e}; retrying in {delay:?}");
                    sleep(delay).await;
                    delay = (delay * 2).min(self.retry_max);
                }
            }
        }
    }

    fn apply_pod(&mut self, snapshot: PodSnapshot) {
        let policy_label = snapshot.labels.get(&self.policy_label_key).cloned();
        let (workload_kind, workload_name) = workload::infer(&snapshot.name, &snapshot.labels);

        let mut pod = self
            .pods
            .remove(&snapshot.uid)
            .unwrap_or_else(|| PodRecord {
                uid: snapshot.uid.clone(),
                namespace: String::new(),
                name: String::new(),
                workload_kind,
                workload_name: workload_name.clone(),
                policy_label: None,
                containers: Default::default(),
            });
        pod.namespace = snapshot.namespace;
        pod.name = snapshot.name;
        pod.workload_kind = workload_kind;
        pod.workload_name = workload_name;
        pod.policy_label = policy_label;

        let mut seen: BTreeSet<ContainerId> = BTreeSet::new();
        for status in snapshot.containers {
            let Some(id) = status.id else {
                // Runtime has not populated the status yet.
                continue;
            };
            // The runtime source is authoritative for container ownership;
            // a pod snapshot never steals an id claimed by another pod
            // (pod recreated while the old status lingers).
            if let Some(owner) = self.container_index.get(&id) {
                if owner != &snapshot.uid {
                    warn!(
                        "pod {} reports container {} owned by another pod; ignoring",
                        snapshot.uid, id
                    );
                    continue;
                }
            }
            seen.insert(id.clone());
            let record = pod.containers.entry(id.clone()).or_insert_with(|| {
                ContainerRecord::new(id.clone(), status.name.clone(), status.image_repo.clone())
            });
            record.name = status.name;
            record.image_repo = status.image_repo;
            // Pod-watch cgroup resolution (runtime source disabled) never
            // overrides the runtime hook and never steals a bound cgroup.
            if let Some(cgroup_id) = status.cgroup_id {
                if record.cgroup_id.is_none() && !self.cg_index.contains_key(&cgroup_id) {
                    record.cgroup_id = Some(cgroup_id);
                    record.generation += 1;
                    self.cg_index
                        .insert(cgroup_id, (snapshot.uid.clone(), id.clone()));
                }
            }
            self.container_index.insert(id, snapshot.uid.clone());
        }

        // Containers that vanished from the status and hold no cgroup can
        // go now; bound ones are removed by the runtime stop hook, which
        // is the only place the unbind-before-free ordering is guaranteed.
        let dropped: Vec<ContainerId> = pod
            .containers
            .iter()
            .filter(|(id, record)| !seen.contains(*id) && record.cgroup_id.is_none())
            .map(|(id, _)| id.clone())
            .collect();
        for id in dropped {
            pod.containers.remove(&id);
            self.container_index.remove(&id);
        }

        self.pods.insert(pod.uid.clone(), pod);
    }

    fn apply_pod_delete(&mut self, uid: &PodUid) {
        let Some(pod) = self.pods.remove(uid) else {
            debug!("delete for unknown pod {uid}");
            return;
        };
        for (id, record) in pod.containers {
            self.container_index.remove(&id);
            if let Some(cgroup_id) = record.cgroup_id {
                self.cg_index.remove(&cgroup_id);
            }
        }
    }

    fn apply_container_start(&mut self, start: ContainerStart) {
        // On (container id, pod uid) disagreement the runtime wins: the pod
        // was deleted and recreated while reusing the container id.
        if let Some(previous_uid) = self.container_index.get(&start.container_id).cloned() {
            if previous_uid != start.pod_uid {
                warn!(
                    "container {} moved from pod {} to pod {}",
                    start.container_id, previous_uid, start.pod_uid
                );
                if let Some(pod) = self.pods.get_mut(&previous_uid) {
                    if let Some(record) = pod.containers.remove(&start.container_id) {
                        if let Some(cgroup_id) = record.cgroup_id {
                            self.cg_index.remove(&cgroup_id);
                        }
                    }
                }
            }
        }

        // A cgroup id is bound to at most one (pod, container) pair.
        if let Some((previous_uid, previous_id)) = self.cg_index.get(&start.cgroup_id).cloned() {
            if previous_uid != start.pod_uid || previous_id != start.container_id {
                if let Some(pod) = self.pods.get_mut(&previous_uid) {
                    if let Some(record) = pod.containers.get_mut(&previous_id) {
                        record.cgroup_id = None;
                        record.generation += 1;
                    }
                }
            }
        }

        let mut pod = match self.pods.remove(&start.pod_uid) {
            Some(pod) => pod,
            None => {
                // The runtime hook outran the pod watch; build the record
                // from hook metadata and let the watch refine it later.
                debug!(
                    "container start for not-yet-watched pod {}/{}",
                    start.pod_namespace, start.pod_name
                );
                let (workload_kind, workload_name) =
                    workload::infer(&start.pod_name, &start.labels);
                PodRecord {
                    uid: start.pod_uid.clone(),
                    namespace: start.pod_namespace.clone(),
                    name: start.pod_name.clone(),
                    workload_kind,
                    workload_name,
                    policy_label: start.labels.get(&self.policy_label_key).cloned(),
                    containers: Default::default(),
                }
            }
        };

        let record = pod
            .containers
            .entry(start.container_id.clone())
            .or_insert_with(|| {
                ContainerRecord::new(
                    start.container_id.clone(),
                    start.container_name.clone(),
                    String::new(),
                )
            });
        record.name = start.container_name.clone();
        if record.cgroup_id != Some(start.cgroup_id) {
            record.cgroup_id = Some(start.cgroup_id);
            record.generation += 1;
        }

        self.container_index
            .insert(start.container_id.clone(), start.pod_uid.clone());
        self.cg_index.insert(
            start.cgroup_id,
            (start.pod_uid.clone(), start.container_id.clone()),
        );
        self.pods.insert(start.pod_uid, pod);
    }

    fn apply_container_stop(&mut self, container_id: &ContainerId) {
        let Some(uid) = self.container_index.get(container_id).cloned() else {
            warn!("stop for unknown container {container_id}");
            return;
        };
        if let Some(pod) = self.pods.get_mut(&uid) {
            if let Some(record) = pod.containers.get_mut(container_id) {
                if let Some(cgroup_id) = record.cgroup_id.take() {
                    self.cg_index.remove(&cgroup_id);
                    record.generation += 1;
                }
            }
        }
    }

    async fn apply_policy_put(&mut self, record: PolicyRecord) {
        let existing = self
            .policies
            .get(&record.name)
            .map(|e| (e.id, e.record.clone()));
        match existing {
            None => {
                let id = self.next_policy_id;
                self.next_policy_id += 1;
                self.project(|p| p.set_policy(id, record.mode, &record.rules))
                    .await;
                self.policies
                    .insert(record.name.clone(), PolicyEntry { id, record });
            }
            Some((id, old)) => {
                if record.generation < old.generation {
                    debug!(
                        "stale policy {} generation {} < {}; ignoring",
                        record.name, record.generation, old.generation
                    );
                    return;
                }
                if old.mode == record.mode && old.rules == record.rules {
                    // Replayed event; nothing to project.
                    self.policies.get_mut(&record.name).unwrap().record.generation =
                        record.generation;
                    return;
                }
                if old.rules == record.rules {
                    self.project(|p| p.set_mode(id, record.mode)).await;
                } else {
                    self.project(|p| p.set_policy(id, record.mode, &record.rules))
                        .await;
                }
                self.policies.get_mut(&record.name).unwrap().record = record;
            }
        }
    }

    async fn apply_policy_delete(&mut self, name: &str) {
        let Some(entry) = self.policies.remove(name) else {
            debug!("delete for unknown policy {name}");
            return;
        };
        // Bound cgroups are released before the policy tables go away.
        self.reconcile().await;
        let id = entry.id;
        self.project(|p| p.delete_policy(id)).await;
    }

    /// Recomputes the desired cgroup -> policy assignments from the primary
    /// tables and converges the kernel state towards them. Idempotent: a
    /// reconcile without state changes issues no projector calls.
    async fn reconcile(&mut self) {
        let mut desired: HashMap<CgroupId, Assignment> = HashMap::new();
        for pod in self.pods.values() {
            let Some(label) = &pod.policy_label else {
                continue;
            };
            let Some(entry) = self.policies.get(label) else {
                continue;
            };
            for container in pod.containers.values() {
                if let Some(cgroup_id) = container.cgroup_id {
                    desired.insert(
                        cgroup_id,
                        Assignment {
                            policy_id: entry.id,
                            policy_name: label.clone(),
                            container_name: container.name.clone(),
                        },
                    );
                }
            }
        }

        // Unbind first: a label change is an unbind under the old policy
        // followed by a bind under the new one, in that order.
        let current: Vec<CgroupId> = self.assignments.keys().copied().collect();
        for cgroup_id in current {
            let keep = matches!(
                (self.assignments.get(&cgroup_id), desired.get(&cgroup_id)),
                (Some(have), Some(want)) if have == want
            );
            if !keep {
                self.project(|p| p.unbind_cgroup(cgroup_id)).await;
                self.assignments.remove(&cgroup_id);
            }
        }

        let missing: Vec<(CgroupId, Assignment)> = desired
            .into_iter()
            .filter(|(cgroup_id, _)| !self.assignments.contains_key(cgroup_id))
            .collect();
        for (cgroup_id, assignment) in missing {
            let policy_id = assignment.policy_id;
            let container_name = assignment.container_name.clone();
            self.project(|p| p.bind_cgroup(cgroup_id, cgroup_id, &container_name, policy_id))
                .await;
            self.assignments.insert(cgroup_id, assignment);
        }

        self.refresh_snapshot().await;
    }

    #[cfg(test)]
    pub(crate) async fn apply(&mut self, event: ResolverEvent) {
        self.handle(event).await;
    }

    async fn refresh_snapshot(&self) {
        let mut next = HashMap::new();
        for (cgroup_id, (uid, container_id)) in &self.cg_index {
            let Some(pod) = self.pods.get(uid) else {
                continue;
            };
            let Some(container) = pod.containers.get(container_id) else {
                continue;
            };
            next.insert(
                *cgroup_id,
                EnrichInfo {
                    namespace: pod.namespace.clone(),
                    pod_name: pod.name.clone(),
                    workload_kind: pod.workload_kind,
                    workload_name: pod.workload_name.clone(),
                    container_id: container.id.clone(),
                    container_name: container.name.clone(),
                    policy_name: self
                        .assignments
                        .get(cgroup_id)
                        .map(|a| a.policy_name.clone()),
                },
            );
        }
        self.snapshot.replace(next).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::state::{ContainerRules, ContainerStatusSnapshot, PolicyMode};
    use crate::sources::ContainerStart;
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::{Arc, Mutex};
    use tokio::sync::oneshot;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        SetPolicy {
            policy_id: PolicyId,
            mode: PolicyMode,
            rules: BTreeMap<String, ContainerRules>,
        },
        DeletePolicy(PolicyId),
        Bind {
            cgroup_id: CgroupId,
            tracker: CgroupId,
            container_name: String,
            policy_id: PolicyId,
        },
        Unbind(CgroupId),
        SetMode {
            policy_id: PolicyId,
            mode: PolicyMode,
        },
    }

    #[derive(Default)]
    struct KernelState {
        policies: HashMap<PolicyId, (PolicyMode, BTreeMap<String, ContainerRules>)>,
        bindings: HashMap<CgroupId, (PolicyId, String)>,
    }

    /// In-memory stand-in for the kernel tables: records every call and
    /// materializes the net state, so tests can assert on either.
    #[derive(Clone, Default)]
    struct RecordingProjector {
        calls: Arc<Mutex<Vec<Call>>>,
        kernel: Arc<Mutex<KernelState>>,
        failures_left: Arc<Mutex<u32>>,
    }

    impl RecordingProjector {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn bindings(&self) -> HashMap<CgroupId, (PolicyId, String)> {
            self.kernel.lock().unwrap().bindings.clone()
        }

        fn policies(&self) -> HashMap<PolicyId, (PolicyMode, BTreeMap<String, ContainerRules>)> {
            self.kernel.lock().unwrap().policies.clone()
        }

        fn fail_next(&self, n: u32) {
            *self.failures_left.lock().unwrap() = n;
        }

        fn maybe_fail(&self) -> Result<(), ProjectorError> {
            let mut left = self.failures_left.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                Err(ProjectorError::MissingMap("injected failure"))
            } else {
                Ok(())
            }
        }
    }

    impl MapProjector for RecordingProjector {
        fn set_policy(
            &mut self,
            policy_id: PolicyId,
            mode: PolicyMode,
            allowed_by_container: &BTreeMap<String, ContainerRules>,
        ) -> Result<(), ProjectorError> {
            self.maybe_fail()?;
            self.calls.lock().unwrap().push(Call::SetPolicy {
                policy_id,
                mode,
                rules: allowed_by_container.clone(),
            });
            self.kernel
                .lock()
                .unwrap()
                .policies
                .insert(policy_id, (mode, allowed_by_container.clone()));
            Ok(())
        }

        fn delete_policy(&mut self, policy_id: PolicyId) -> Result<(), ProjectorError> {
            self.maybe_fail()?;
            self.calls.lock().unwrap().push(Call::DeletePolicy(policy_id));
            self.kernel.lock().unwrap().policies.remove(&policy_id);
            Ok(())
        }

        fn bind_cgroup(
            &mut self,
            cgroup_id: CgroupId,
            tracker_cgroup_id: CgroupId,
            container_name: &str,
            policy_id: PolicyId,
        ) -> Result<(), ProjectorError> {
            self.maybe_fail()?;
            self.calls.lock().unwrap().push(Call::Bind {
                cgroup_id,
                tracker: tracker_cgroup_id,
                container_name: container_name.to_string(),
                policy_id,
            });
            self.kernel
                .lock()
                .unwrap()
                .bindings
                .insert(cgroup_id, (policy_id, container_name.to_string()));
            Ok(())
        }

        fn unbind_cgroup(&mut self, cgroup_id: CgroupId) -> Result<(), ProjectorError> {
            self.maybe_fail()?;
            self.calls.lock().unwrap().push(Call::Unbind(cgroup_id));
            self.kernel.lock().unwrap().bindings.remove(&cgroup_id);
            Ok(())
        }

        fn set_mode(&mut self, policy_id: PolicyId, mode: PolicyMode) -> Result<(), ProjectorError> {
            self.maybe_fail()?;
            self.calls
                .lock()
                .unwrap()
                .push(Call::SetMode { policy_id, mode });
            if let Some(policy) = self.kernel.lock().unwrap().policies.get_mut(&policy_id) {
                policy.0 = mode;
            }
            Ok(())
        }
    }

    fn resolver(projector: RecordingProjector) -> Resolver<RecordingProjector> {
        Resolver::new(
            projector,
            "policy".to_string(),
            Duration::from_millis(400),
            SnapshotIndex::new(),
            ReadyFlag::new(),
        )
    }

    fn rules(entries: &[(&str, &[&str])]) -> BTreeMap<String, ContainerRules> {
        entries
            .iter()
            .map(|(container, paths)| {
                (
                    container.to_string(),
                    ContainerRules {
                        allowed_executables: paths
                            .iter()
                            .map(|p| p.to_string())
                            .collect::<BTreeSet<_>>(),
                    },
                )
            })
            .collect()
    }

    fn policy(name: &str, mode: PolicyMode, generation: i64, r: &[(&str, &[&str])]) -> PolicyRecord {
        PolicyRecord {
            name: name.to_string(),
            mode,
            rules: rules(r),
            generation,
        }
    }

    fn pod(uid: &str, name: &str, label: Option<&str>) -> PodSnapshot {
        let mut labels = BTreeMap::new();
        if let Some(label) = label {
            labels.insert("policy".to_string(), label.to_string());
        }
        PodSnapshot {
            uid: uid.to_string(),
            namespace: "default".to_string(),
            name: name.to_string(),
            labels,
            containers: Vec::new(),
        }
    }

    fn start(uid: &str, container_id: &str, container_name: &str, cgroup_id: u64) -> ResolverEvent {
        ResolverEvent::ContainerStarted(Box::new(ContainerStart {
            pod_sandbox_id: format!("sandbox-{uid}"),
            pod_uid: uid.to_string(),
            pod_name: format!("pod-{uid}"),
            pod_namespace: "default".to_string(),
            labels: BTreeMap::new(),
            container_id: container_id.to_string(),
            container_name: container_name.to_string(),
            cgroup_id,
        }))
    }

    /// Same as `start` but with the policy label attached, for cases where
    /// the runtime hook outruns the pod watch.
    fn start_labeled(
        uid: &str,
        container_id: &str,
        container_name: &str,
        cgroup_id: u64,
        label: &str,
    ) -> ResolverEvent {
        let mut event = match start(uid, container_id, container_name, cgroup_id) {
            ResolverEvent::ContainerStarted(event) => event,
            _ => unreachable!(),
        };
        event
            .labels
            .insert("policy".to_string(), label.to_string());
        ResolverEvent::ContainerStarted(event)
    }

    #[tokio::test]
    async fn no_label_never_binds() {
        let projector = RecordingProjector::default();
        let mut resolver = resolver(projector.clone());

        resolver
            .apply(ResolverEvent::PolicyApplied(policy(
                "p1",
                PolicyMode::Protect,
                1,
                &[("main", &["/usr/bin/ls"])],
            )))
            .await;
        resolver
            .apply(ResolverEvent::PodApplied(pod("u1", "web-abc-xyz12", None)))
            .await;
        resolver.apply(start("u1", "c1", "main", 100)).await;

        assert!(projector.bindings().is_empty());
        assert!(!projector
            .calls()
            .iter()
            .any(|c| matches!(c, Call::Bind { .. })));
    }

    #[tokio::test]
    async fn binding_forms_once_all_prerequisites_met() {
        let projector = RecordingProjector::default();
        let mut resolver = resolver(projector.clone());

        // Pod with label, container incomplete: nothing yet.
        resolver
            .apply(ResolverEvent::PodApplied(pod("u1", "web-abc-xyz12", Some("p1"))))
            .await;
        resolver.apply(start("u1", "c1", "main", 100)).await;
        assert!(projector.bindings().is_empty(), "policy still unknown");

        // The policy arrives last; the binding must appear now.
        resolver
            .apply(ResolverEvent::PolicyApplied(policy(
                "p1",
                PolicyMode::Protect,
                1,
                &[("main", &["/usr/bin/ls"])],
            )))
            .await;

        let bindings = projector.bindings();
        assert_eq!(bindings.len(), 1);
        let (policy_id, container_name) = &bindings[&100];
        assert_eq!(container_name, "main");
        assert_eq!(projector.policies()[policy_id].0, PolicyMode::Protect);
    }

    #[tokio::test]
    async fn event_order_does_not_change_the_outcome() {
        let make_events = || {
            vec![
                ResolverEvent::PolicyApplied(policy(
                    "p1",
                    PolicyMode::Protect,
                    1,
                    &[("main", &["/usr/bin/ls"])],
                )),
                ResolverEvent::PodApplied(pod("u1", "web-abc-xyz12", Some("p1"))),
                start("u1", "c1", "main", 100),
            ]
        };
        // All permutations of three distinct-source events.
        let orders: Vec<Vec<usize>> = vec![
            vec![0, 1, 2],
            vec![0, 2, 1],
            vec![1, 0, 2],
            vec![1, 2, 0],
            vec![2, 0, 1],
            vec![2, 1, 0],
        ];

        let mut outcomes = Vec::new();
        for order in orders {
            let projector = RecordingProjector::default();
            let mut resolver = resolver(projector.clone());
            let mut events: Vec<Option<ResolverEvent>> =
                make_events().into_iter().map(Some).collect();
            for index in order {
                resolver.apply(events[index].take().unwrap()).await;
            }
            outcomes.push((projector.bindings(), projector.policies()));
        }

        for outcome in &outcomes[1..] {
            assert_eq!(outcome.0, outcomes[0].0);
            assert_eq!(outcome.1, outcomes[0].1);
        }
        assert_eq!(outcomes[0].0.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_events_project_nothing_new() {
        let projector = RecordingProjector::default();
        let mut resolver = resolver(projector.clone());

        let events = || {
            vec![
                ResolverEvent::PolicyApplied(policy(
                    "p1",
                    PolicyMode::Monitor,
                    1,
                    &[("main", &["/usr/bin/ls"])],
                )),
                ResolverEvent::PodApplied(pod("u1", "web-abc-xyz12", Some("p1"))),
                start("u1", "c1", "main", 100),
            ]
        };
        for event in events() {
            resolver.apply(event).await;
        }
        let calls_after_first = projector.calls().len();
        let bindings_after_first = projector.bindings();

        for event in events() {
            resolver.apply(event).await;
        }

        assert_eq!(projector.calls().len(), calls_after_first);
        assert_eq!(projector.bindings(), bindings_after_first);
    }

    #[tokio::test]
    async fn container_stop_unbinds_before_acknowledging() {
        let projector = RecordingProjector::default();
        let mut resolver = resolver(projector.clone());

        resolver
            .apply(ResolverEvent::PolicyApplied(policy(
                "p1",
                PolicyMode::Protect,
                1,
                &[("main", &["/usr/bin/ls"])],
            )))
            .await;
        resolver
            .apply(ResolverEvent::PodApplied(pod("u1", "web-abc-xyz12", Some("p1"))))
            .await;
        resolver.apply(start("u1", "c1", "main", 100)).await;
        assert_eq!(projector.bindings().len(), 1);

        let (responder, mut done) = oneshot::channel();
        resolver
            .apply(ResolverEvent::ContainerStopped {
                container_id: "c1".to_string(),
                responder,
            })
            .await;

        // The acknowledgement arrived, and by then the kernel entry was gone.
        done.try_recv().expect("stop must be acknowledged");
        assert!(projector.bindings().is_empty());
        assert!(projector.calls().contains(&Call::Unbind(100)));
    }

    #[tokio::test]
    async fn stop_for_unknown_container_still_acknowledges() {
        let projector = RecordingProjector::default();
        let mut resolver = resolver(projector.clone());

        let (responder, mut done) = oneshot::channel();
        resolver
            .apply(ResolverEvent::ContainerStopped {
                container_id: "ghost".to_string(),
                responder,
            })
            .await;
        done.try_recv().expect("stop must be acknowledged");
    }

    #[tokio::test]
    async fn policy_delete_unbinds_every_cgroup_first() {
        let projector = RecordingProjector::default();
        let mut resolver = resolver(projector.clone());

        resolver
            .apply(ResolverEvent::PolicyApplied(policy(
                "p1",
                PolicyMode::Protect,
                1,
                &[("main", &["/usr/bin/ls"])],
            )))
            .await;
        resolver
            .apply(ResolverEvent::PodApplied(pod("u1", "web-abc-xyz12", Some("p1"))))
            .await;
        resolver.apply(start("u1", "c1", "main", 100)).await;
        resolver.apply(start("u1", "c2", "main", 200)).await;

        resolver
            .apply(ResolverEvent::PolicyDeleted("p1".to_string()))
            .await;

        let calls = projector.calls();
        let delete_position = calls
            .iter()
            .position(|c| matches!(c, Call::DeletePolicy(_)))
            .expect("policy must be deleted");
        for cgroup_id in [100, 200] {
            let unbind_position = calls
                .iter()
                .position(|c| *c == Call::Unbind(cgroup_id))
                .expect("every bound cgroup must be unbound");
            assert!(unbind_position < delete_position);
        }
        assert!(projector.bindings().is_empty());
        assert!(projector.policies().is_empty());
    }

    #[tokio::test]
    async fn label_change_unbinds_old_before_binding_new() {
        let projector = RecordingProjector::default();
        let mut resolver = resolver(projector.clone());

        for (name, generation) in [("p1", 1), ("p2", 1)] {
            resolver
                .apply(ResolverEvent::PolicyApplied(policy(
                    name,
                    PolicyMode::Protect,
                    generation,
                    &[("main", &["/usr/bin/ls"])],
                )))
                .await;
        }
        resolver
            .apply(ResolverEvent::PodApplied(pod("u1", "web-abc-xyz12", Some("p1"))))
            .await;
        resolver.apply(start("u1", "c1", "main", 100)).await;

        let calls_before = projector.calls().len();
        resolver
            .apply(ResolverEvent::PodApplied(pod("u1", "web-abc-xyz12", Some("p2"))))
            .await;

        let calls = projector.calls()[calls_before..].to_vec();
        let unbind_position = calls
            .iter()
            .position(|c| *c == Call::Unbind(100))
            .expect("old binding must be removed");
        let bind_position = calls
            .iter()
            .position(|c| matches!(c, Call::Bind { cgroup_id: 100, .. }))
            .expect("new binding must be installed");
        assert!(unbind_position < bind_position);

        let bindings = projector.bindings();
        let p2_id = resolver.policies["p2"].id;
        assert_eq!(bindings[&100].0, p2_id);
    }

    #[tokio::test]
    async fn label_removal_unbinds() {
        let projector = RecordingProjector::default();
        let mut resolver = resolver(projector.clone());

        resolver
            .apply(ResolverEvent::PolicyApplied(policy(
                "p1",
                PolicyMode::Protect,
                1,
                &[("main", &["/usr/bin/apt"])],
            )))
            .await;
        resolver
            .apply(ResolverEvent::PodApplied(pod("u1", "web-abc-xyz12", Some("p1"))))
            .await;
        resolver.apply(start("u1", "c1", "main", 100)).await;
        assert_eq!(projector.bindings().len(), 1);

        resolver
            .apply(ResolverEvent::PodApplied(pod("u1", "web-abc-xyz12", None)))
            .await;
        assert!(projector.bindings().is_empty());
    }

    #[tokio::test]
    async fn mode_switch_is_an_o1_operation() {
        let projector = RecordingProjector::default();
        let mut resolver = resolver(projector.clone());

        let allow: &[(&str, &[&str])] = &[("main", &["/usr/bin/ls"])];
        resolver
            .apply(ResolverEvent::PolicyApplied(policy(
                "p1",
                PolicyMode::Protect,
                1,
                allow,
            )))
            .await;
        resolver
            .apply(ResolverEvent::PodApplied(pod("u1", "web-abc-xyz12", Some("p1"))))
            .await;
        resolver.apply(start("u1", "c1", "main", 100)).await;

        let calls_before = projector.calls().len();
        resolver
            .apply(ResolverEvent::PolicyApplied(policy(
                "p1",
                PolicyMode::Monitor,
                2,
                allow,
            )))
            .await;

        let new_calls = projector.calls()[calls_before..].to_vec();
        assert_eq!(new_calls.len(), 1);
        assert!(matches!(
            new_calls[0],
            Call::SetMode {
                mode: PolicyMode::Monitor,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn rules_change_replaces_the_allow_set_without_rebinding() {
        let projector = RecordingProjector::default();
        let mut resolver = resolver(projector.clone());

        resolver
            .apply(ResolverEvent::PolicyApplied(policy(
                "p1",
                PolicyMode::Protect,
                1,
                &[("main", &["/usr/bin/ls"])],
            )))
            .await;
        resolver
            .apply(ResolverEvent::PodApplied(pod("u1", "web-abc-xyz12", Some("p1"))))
            .await;
        resolver.apply(start("u1", "c1", "main", 100)).await;

        let calls_before = projector.calls().len();
        resolver
            .apply(ResolverEvent::PolicyApplied(policy(
                "p1",
                PolicyMode::Protect,
                2,
                &[("main", &["/usr/bin/ls", "/usr/bin/sleep"])],
            )))
            .await;

        let new_calls = projector.calls()[calls_before..].to_vec();
        assert_eq!(new_calls.len(), 1);
        assert!(matches!(new_calls[0], Call::SetPolicy { .. }));
    }

    #[tokio::test]
    async fn stale_policy_generation_is_ignored() {
        let projector = RecordingProjector::default();
        let mut resolver = resolver(projector.clone());

        resolver
            .apply(ResolverEvent::PolicyApplied(policy(
                "p1",
                PolicyMode::Protect,
                5,
                &[("main", &["/usr/bin/ls"])],
            )))
            .await;
        let calls_before = projector.calls().len();

        resolver
            .apply(ResolverEvent::PolicyApplied(policy(
                "p1",
                PolicyMode::Monitor,
                3,
                &[("main", &["/usr/bin/bash"])],
            )))
            .await;

        assert_eq!(projector.calls().len(), calls_before);
        assert_eq!(
            resolver.policies["p1"].record.mode,
            PolicyMode::Protect
        );
    }

    #[tokio::test]
    async fn policy_ids_are_never_reused() {
        let projector = RecordingProjector::default();
        let mut resolver = resolver(projector.clone());

        resolver
            .apply(ResolverEvent::PolicyApplied(policy(
                "p1",
                PolicyMode::Monitor,
                1,
                &[],
            )))
            .await;
        let first_id = resolver.policies["p1"].id;

        resolver
            .apply(ResolverEvent::PolicyDeleted("p1".to_string()))
            .await;
        resolver
            .apply(ResolverEvent::PolicyApplied(policy(
                "p2",
                PolicyMode::Monitor,
                1,
                &[],
            )))
            .await;

        assert_ne!(resolver.policies["p2"].id, first_id);
    }

    #[tokio::test(start_paused = true)]
    async fn projector_errors_are_retried_until_they_stick() {
        let projector = RecordingProjector::default();
        let mut resolver = resolver(projector.clone());

        projector.fail_next(3);
        resolver
            .apply(ResolverEvent::PolicyApplied(policy(
                "p1",
                PolicyMode::Protect,
                1,
                &[("main", &["/usr/bin/ls"])],
            )))
            .await;

        assert_eq!(projector.policies().len(), 1);
    }

    #[tokio::test]
    async fn pod_delete_cascades_to_every_binding() {
        let projector = RecordingProjector::default();
        let mut resolver = resolver(projector.clone());

        resolver
            .apply(ResolverEvent::PolicyApplied(policy(
                "p1",
                PolicyMode::Protect,
                1,
                &[("main", &["/usr/bin/ls"]), ("sidecar", &["/usr/bin/sleep"])],
            )))
            .await;
        resolver
            .apply(ResolverEvent::PodApplied(pod("u1", "web-abc-xyz12", Some("p1"))))
            .await;
        resolver.apply(start("u1", "c1", "main", 100)).await;
        resolver.apply(start("u1", "c2", "sidecar", 200)).await;
        assert_eq!(projector.bindings().len(), 2);

        resolver
            .apply(ResolverEvent::PodDeleted("u1".to_string()))
            .await;
        assert!(projector.bindings().is_empty());
    }

    #[tokio::test]
    async fn runtime_source_wins_on_pod_uid_disagreement() {
        let projector = RecordingProjector::default();
        let mut resolver = resolver(projector.clone());

        resolver
            .apply(ResolverEvent::PolicyApplied(policy(
                "p1",
                PolicyMode::Protect,
                1,
                &[("main", &["/usr/bin/ls"])],
            )))
            .await;
        resolver.apply(start_labeled("u1", "c1", "main", 100, "p1")).await;
        assert_eq!(projector.bindings().len(), 1);

        // The pod was deleted and recreated reusing the container id; the
        // runtime event rebinds it to the new pod.
        resolver.apply(start_labeled("u2", "c1", "main", 300, "p1")).await;

        let bindings = projector.bindings();
        assert_eq!(bindings.len(), 1);
        assert!(bindings.contains_key(&300));
        assert!(!bindings.contains_key(&100));
    }

    #[tokio::test]
    async fn incomplete_container_record_never_binds() {
        let projector = RecordingProjector::default();
        let mut resolver = resolver(projector.clone());

        resolver
            .apply(ResolverEvent::PolicyApplied(policy(
                "p1",
                PolicyMode::Protect,
                1,
                &[("main", &["/usr/bin/ls"])],
            )))
            .await;
        let mut snapshot = pod("u1", "web-abc-xyz12", Some("p1"));
        snapshot.containers.push(ContainerStatusSnapshot {
            name: "main".to_string(),
            id: Some("c1".to_string()),
            image_repo: "nginx:1.27".to_string(),
            cgroup_id: None,
        });
        resolver.apply(ResolverEvent::PodApplied(snapshot)).await;

        assert!(projector.bindings().is_empty());
    }

    #[tokio::test]
    async fn snapshot_carries_policy_and_workload_details() {
        let projector = RecordingProjector::default();
        let snapshot_index = SnapshotIndex::new();
        let mut resolver = Resolver::new(
            projector.clone(),
            "policy".to_string(),
            Duration::from_millis(400),
            snapshot_index.clone(),
            ReadyFlag::new(),
        );

        resolver
            .apply(ResolverEvent::PolicyApplied(policy(
                "p1",
                PolicyMode::Protect,
                1,
                &[("main", &["/usr/bin/ls"])],
            )))
            .await;
        let mut pod_snapshot = pod("u1", "web-5b4f8d6c9d-kx7m2", Some("p1"));
        pod_snapshot
            .labels
            .insert("pod-template-hash".to_string(), "5b4f8d6c9d".to_string());
        resolver.apply(ResolverEvent::PodApplied(pod_snapshot)).await;
        resolver.apply(start("u1", "c1", "main", 100)).await;

        let info = snapshot_index.lookup(100).await.expect("binding visible");
        assert_eq!(info.policy_name.as_deref(), Some("p1"));
        assert_eq!(info.workload_kind, crate::workload::WorkloadKind::Deployment);
        assert_eq!(info.workload_name, "web");
        assert_eq!(info.container_name, "main");
    }
}
