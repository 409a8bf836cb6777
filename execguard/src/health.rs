use std::sync::{
    atomic::{AtomicBool, AtomicI64, Ordering},
    Arc,
};

use axum::{http::StatusCode, routing::get, Router};
use chrono::Utc;
use log::info;
use thiserror::Error;
use tokio::{net::TcpListener, sync::watch};

/// How long the event pump may go without polling its rings before the
/// agent reports itself dead.
const PUMP_STALL_SECS: i64 = 30;

/// Set by the resolver once both sources finished their initial sync and
/// the input queue has drained; read by the readiness endpoint.
#[derive(Clone, Default)]
pub struct ReadyFlag(Arc<AtomicBool>);

impl ReadyFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, ready: bool) {
        self.0.store(ready, Ordering::Release);
    }

    pub fn get(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Updated by the event pump every time it polls its ring buffers; the
/// liveness endpoint flags a stalled pump.
#[derive(Clone)]
pub struct PumpHeartbeat(Arc<AtomicI64>);

impl Default for PumpHeartbeat {
    fn default() -> Self {
        Self::new()
    }
}

impl PumpHeartbeat {
    pub fn new() -> Self {
        Self(Arc::new(AtomicI64::new(Utc::now().timestamp())))
    }

    pub fn beat(&self) {
        self.0.store(Utc::now().timestamp(), Ordering::Release);
    }

    pub fn is_live(&self) -> bool {
        Utc::now().timestamp() - self.0.load(Ordering::Acquire) <= PUMP_STALL_SECS
    }
}

#[derive(Error, Debug)]
pub enum HealthServerError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

async fn readyz(ready: ReadyFlag) -> StatusCode {
    if ready.get() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn healthz(heartbeat: PumpHeartbeat) -> StatusCode {
    if heartbeat.is_live() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Serves the kubelet-facing probe endpoints until cancellation.
pub async fn serve(
    endpoint: String,
    ready: ReadyFlag,
    heartbeat: PumpHeartbeat,
    mut cancel: watch::Receiver<bool>,
) -> Result<(), HealthServerError> {
    let app = Router::new()
        .route("/readyz", get(move || readyz(ready.clone())))
        .route("/healthz", get(move || healthz(heartbeat.clone())));

    let listener = TcpListener::bind(&endpoint).await?;
    info!("probe endpoints listening on {endpoint}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = cancel.changed().await;
        })
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_flag_round_trips() {
        let flag = ReadyFlag::new();
        assert!(!flag.get());
        flag.set(true);
        assert!(flag.get());
        flag.set(false);
        assert!(!flag.get());
    }

    #[test]
    fn fresh_heartbeat_is_live() {
        assert!(PumpHeartbeat::new().is_live());
    }

    #[test]
    fn stale_heartbeat_is_dead() {
        let heartbeat = PumpHeartbeat::new();
        heartbeat
            .0
            .store(Utc::now().timestamp() - PUMP_STALL_SECS - 1, Ordering::Release);
        assert!(!heartbeat.is_live());
    }
}
