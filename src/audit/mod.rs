//! Asynchronous audit sink.
//!
//! A bounded queue feeds a fixed worker pool; each worker persists events
//! with a per-event timeout and keeps going on store errors. The hot path
//! never blocks: `log_event` drops on a full queue and bumps a counter —
//! operators alert on the counter, not on request latency.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use serde_json::json;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{error, warn};
use uuid::Uuid;

use crate::models::audit::{AuditAction, AuditLog};
use crate::models::inference::Usage;
use crate::scope::RequestScope;
use crate::store::AuditWriter;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuditError {
    #[error("audit sink is stopped")]
    Closed,

    #[error("cancelled before the queue had capacity")]
    Cancelled,

    #[error("workers did not drain within the deadline")]
    DrainTimeout,
}

pub struct AuditSink {
    sender: std::sync::Mutex<Option<mpsc::Sender<AuditLog>>>,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
    dropped: Arc<AtomicU64>,
}

impl AuditSink {
    /// Spawn the worker pool and return the running sink.
    pub fn start(
        writer: Arc<dyn AuditWriter>,
        buffer_size: usize,
        worker_count: usize,
        persist_timeout: Duration,
    ) -> Self {
        let (sender, receiver) = mpsc::channel::<AuditLog>(buffer_size.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        let mut workers = Vec::with_capacity(worker_count.max(1));
        for worker_id in 0..worker_count.max(1) {
            let receiver = Arc::clone(&receiver);
            let writer = Arc::clone(&writer);
            workers.push(tokio::spawn(async move {
                loop {
                    let event = { receiver.lock().await.recv().await };
                    let Some(event) = event else { break };
                    match timeout(persist_timeout, writer.persist_audit(&event)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            error!(worker_id, request_id = %event.request_id, "audit persist failed: {}", e);
                        }
                        Err(_) => {
                            error!(worker_id, request_id = %event.request_id, "audit persist timed out");
                        }
                    }
                }
            }));
        }

        Self {
            sender: std::sync::Mutex::new(Some(sender)),
            workers: std::sync::Mutex::new(workers),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Non-blocking enqueue. A full or closed queue drops the event; the
    /// caller's request path never sees an error.
    pub fn log_event(&self, event: AuditLog) {
        let sender = self.sender.lock().expect("audit sender lock poisoned");
        let Some(sender) = sender.as_ref() else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!("audit event dropped: sink stopped");
            return;
        };
        if let Err(e) = sender.try_send(event) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            match e {
                mpsc::error::TrySendError::Full(ev) => {
                    warn!(request_id = %ev.request_id, "audit event dropped: queue full");
                }
                mpsc::error::TrySendError::Closed(ev) => {
                    warn!(request_id = %ev.request_id, "audit event dropped: queue closed");
                }
            }
        }
    }

    /// Wait for capacity up to `deadline`. Used by callers that must not lose
    /// the event (administrative mutations), never by the inference path.
    pub async fn log_event_blocking(
        &self,
        event: AuditLog,
        deadline: Duration,
    ) -> Result<(), AuditError> {
        let sender = {
            let guard = self.sender.lock().expect("audit sender lock poisoned");
            guard.as_ref().cloned().ok_or(AuditError::Closed)?
        };
        match timeout(deadline, sender.send(event)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(AuditError::Closed),
            Err(_) => Err(AuditError::Cancelled),
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Close the queue and wait for the workers to drain what is buffered.
    pub async fn stop(&self, deadline: Duration) -> Result<(), AuditError> {
        // Dropping the sender closes the channel; workers exit on recv None.
        self.sender
            .lock()
            .expect("audit sender lock poisoned")
            .take();

        let workers = {
            let mut guard = self.workers.lock().expect("audit workers lock poisoned");
            std::mem::take(&mut *guard)
        };

        let drain = async {
            for worker in workers {
                let _ = worker.await;
            }
        };
        timeout(deadline, drain)
            .await
            .map_err(|_| AuditError::DrainTimeout)
    }

    // ── Convenience emitters ──────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub fn log_inference(
        &self,
        scope: &RequestScope,
        inference_id: Uuid,
        provider: &str,
        model: &str,
        usage: &Usage,
        cost: Decimal,
        latency_ms: i64,
        status_code: i32,
    ) {
        let mut entry =
            AuditLog::for_scope(scope, AuditAction::InferenceRequest, "inference_request")
                .with_resource_id(inference_id.to_string());
        entry.provider = Some(provider.to_string());
        entry.model = Some(model.to_string());
        entry.tokens_used = Some(usage.total_tokens as i32);
        entry.cost = Some(cost);
        entry.latency_ms = Some(latency_ms);
        entry.status_code = Some(status_code);
        self.log_event(entry);
    }

    pub fn log_policy_violation(
        &self,
        scope: &RequestScope,
        inference_id: Uuid,
        reason: &str,
        details: serde_json::Value,
    ) {
        let entry = AuditLog::for_scope(scope, AuditAction::PolicyViolation, "inference_request")
            .with_resource_id(inference_id.to_string())
            .with_details(json!({ "reason": reason, "violation": details }))
            .with_error(reason, 403);
        self.log_event(entry);
    }

    pub fn log_policy_change(&self, scope: &RequestScope, action: AuditAction, policy_id: Uuid) {
        debug_assert!(matches!(
            action,
            AuditAction::PolicyCreated | AuditAction::PolicyUpdated | AuditAction::PolicyDeleted
        ));
        let entry = AuditLog::for_scope(scope, action, "policy")
            .with_resource_id(policy_id.to_string());
        self.log_event(entry);
    }

    pub fn log_user_change(&self, scope: &RequestScope, action: AuditAction, user_id: Uuid) {
        let entry =
            AuditLog::for_scope(scope, action, "user").with_resource_id(user_id.to_string());
        self.log_event(entry);
    }

    pub fn log_app_change(&self, scope: &RequestScope, action: AuditAction, app_id: Uuid) {
        let entry =
            AuditLog::for_scope(scope, action, "application").with_resource_id(app_id.to_string());
        self.log_event(entry);
    }
}
