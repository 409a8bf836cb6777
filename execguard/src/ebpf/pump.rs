use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use aya::{maps::RingBuf, Ebpf};
use thiserror::Error;
use tokio::sync::{watch, Notify};

use crate::health::PumpHeartbeat;
use execguard_common::ExecEvent;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Error, Debug)]
pub enum PumpError {
    #[error("ring buffer map {0} missing from the object file")]
    MissingMap(&'static str),

    #[error(transparent)]
    Map(#[from] aya::maps::MapError),
}

/// A kernel record in userspace-friendly form.
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub cgroup_id: u64,
    pub tracker_cgroup_id: u64,
    pub session_id: u32,
    pub kind: u8,
    pub action: u8,
    pub path: String,
}

impl From<ExecEvent> for RawEvent {
    fn from(event: ExecEvent) -> Self {
        let end = event
            .path
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(event.path.len());
        Self {
            cgroup_id: event.cgroup_id,
            tracker_cgroup_id: event.tracker_cgroup_id,
            session_id: event.session_id,
            kind: event.kind,
            action: event.action,
            path: String::from_utf8_lossy(&event.path[..end]).into_owned(),
        }
    }
}

struct QueueInner {
    records: VecDeque<RawEvent>,
    dropped: u64,
}

/// Bounded queue between a ring-buffer pump and its enricher. When full the
/// oldest pending record is dropped and counted; pushing never blocks, so
/// the ring reader keeps up regardless of how slow the sink is.
#[derive(Clone)]
pub struct EventQueue {
    inner: Arc<Mutex<QueueInner>>,
    notify: Arc<Notify>,
    capacity: usize,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(QueueInner {
                records: VecDeque::with_capacity(capacity),
                dropped: 0,
            })),
            notify: Arc::new(Notify::new()),
            capacity,
        }
    }

    pub fn push(&self, event: RawEvent) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.records.len() >= self.capacity {
                inner.records.pop_front();
                inner.dropped += 1;
            }
            inner.records.push_back(event);
        }
        self.notify.notify_one();
    }

    pub fn try_pop(&self) -> Option<RawEvent> {
        self.inner.lock().unwrap().records.pop_front()
    }

    /// Waits for the next record; returns None once cancelled.
    pub async fn pop(&self, cancel: &mut watch::Receiver<bool>) -> Option<RawEvent> {
        loop {
            if let Some(event) = self.try_pop() {
                return Some(event);
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        return self.try_pop();
                    }
                }
            }
        }
    }

    /// Number of records dropped to keep the queue bounded.
    pub fn dropped(&self) -> u64 {
        self.inner.lock().unwrap().dropped
    }
}

/// Moves records from one kernel ring into the given queue on a dedicated
/// blocking thread until cancellation. The heartbeat feeds the liveness
/// probe.
pub fn spawn_ring_pump(
    bpf: &mut Ebpf,
    map_name: &'static str,
    queue: EventQueue,
    heartbeat: PumpHeartbeat,
    cancel: watch::Receiver<bool>,
) -> Result<(), PumpError> {
    let map = bpf
        .take_map(map_name)
        .ok_or(PumpError::MissingMap(map_name))?;
    let mut ring = RingBuf::try_from(map)?;

    tokio::task::spawn_blocking(move || {
        while !*cancel.borrow() {
            heartbeat.beat();
            let mut has_work = false;
            while let Some(item) = ring.next() {
                has_work = true;
                if item.len() >= std::mem::size_of::<ExecEvent>() {
                    let event = unsafe { (item.as_ptr() as *const ExecEvent).read_unaligned() };
                    queue.push(RawEvent::from(event));
                }
            }
            if !has_work {
                std::thread::sleep(POLL_INTERVAL);
            }
        }
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use execguard_common::{ACTION_MONITOR, KIND_LEARNING, PATH_LEN};

    fn raw(path: &str) -> RawEvent {
        RawEvent {
            cgroup_id: 7,
            tracker_cgroup_id: 7,
            session_id: 1,
            kind: KIND_LEARNING,
            action: ACTION_MONITOR,
            path: path.to_string(),
        }
    }

    #[test]
    fn full_queue_drops_oldest_and_counts() {
        let queue = EventQueue::new(2);
        queue.push(raw("/bin/a"));
        queue.push(raw("/bin/b"));
        queue.push(raw("/bin/c"));

        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.try_pop().unwrap().path, "/bin/b");
        assert_eq!(queue.try_pop().unwrap().path, "/bin/c");
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn kernel_record_path_is_cut_at_nul() {
        let mut path = [0u8; PATH_LEN];
        path[..11].copy_from_slice(b"/usr/bin/ls");
        let event = ExecEvent {
            cgroup_id: 1,
            tracker_cgroup_id: 2,
            session_id: 3,
            kind: KIND_LEARNING,
            action: ACTION_MONITOR,
            _pad: [0; 2],
            path,
        };
        let raw = RawEvent::from(event);
        assert_eq!(raw.path, "/usr/bin/ls");
        assert_eq!(raw.tracker_cgroup_id, 2);
    }
}
