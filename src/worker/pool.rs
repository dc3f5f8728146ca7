//! Worker pool: a fixed set of tasks that lease messages and run handlers.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::QueueConfig;
use crate::error::HandlerError;
use crate::queue::{Delivery, Lease, QueueMessage};
use crate::runtime::{Runtime, report};
use crate::worker::handler::{HandlerOutcome, HandlerRegistry};

/// Delay before a retryable failure is redelivered: exponential in the
/// receive count, capped, with up to 25% jitter.
pub fn retry_backoff(config: &QueueConfig, receive_count: u32) -> Duration {
    let exp = receive_count.saturating_sub(1).min(16);
    let base = config.retry_base.saturating_mul(1u32 << exp);
    let capped = base.min(config.retry_max);
    let jitter_ms = (capped.as_millis() as u64) / 4;
    let jitter = if jitter_ms == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=jitter_ms)
    };
    capped + Duration::from_millis(jitter)
}

/// Runs handlers for queued messages on `concurrency` tasks.
pub struct WorkerPool {
    runtime: Runtime,
    handlers: Arc<HandlerRegistry>,
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(runtime: Runtime, handlers: HandlerRegistry) -> Self {
        let (shutdown_tx, _rx) = watch::channel(false);
        Self {
            runtime,
            handlers: Arc::new(handlers),
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the worker tasks. Start times are staggered across one poll
    /// interval so idle workers do not hit the queue in lockstep.
    pub async fn start(&self) {
        let concurrency = self.runtime.config.worker.concurrency.max(1);
        let poll = self.runtime.config.worker.poll_interval;
        let mut handles = self.handles.lock().await;

        for index in 0..concurrency {
            let worker = Worker {
                index,
                runtime: self.runtime.clone(),
                handlers: Arc::clone(&self.handlers),
                shutdown: self.shutdown_tx.subscribe(),
            };
            let stagger = poll.mul_f64(index as f64 / concurrency as f64);
            handles.push(tokio::spawn(async move {
                tokio::time::sleep(stagger).await;
                worker.run().await;
            }));
        }

        info!(
            concurrency,
            kinds = ?self.handlers.kinds(),
            "Worker pool started"
        );
    }

    /// Signal shutdown and wait for in-flight handlers, aborting whatever is
    /// still running after the timeout. Unfinished messages are redelivered
    /// once their leases expire.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<JoinHandle<()>> = self.handles.lock().await.drain(..).collect();
        if handles.is_empty() {
            return;
        }

        let timeout = self.runtime.config.worker.shutdown_timeout;
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        if tokio::time::timeout(timeout, futures::future::join_all(handles))
            .await
            .is_err()
        {
            warn!(timeout_secs = timeout.as_secs(), "Workers did not stop in time, aborting");
            for abort in aborts {
                abort.abort();
            }
        }
        info!("Worker pool stopped");
    }
}

struct Worker {
    index: usize,
    runtime: Runtime,
    handlers: Arc<HandlerRegistry>,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    async fn run(mut self) {
        let poll = self.runtime.config.worker.poll_interval;
        debug!(worker = self.index, "Worker running");

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            match self.runtime.queue.receive().await {
                Ok(Some(Delivery::Leased(lease))) => self.process(lease).await,
                Ok(Some(Delivery::DeadLettered {
                    message,
                    receive_count,
                })) => self.dead_lettered(&message, receive_count).await,
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(poll) => {}
                        _ = self.shutdown.changed() => {}
                    }
                }
                Err(e) => {
                    error!(worker = self.index, "Queue receive failed: {}", e);
                    tokio::time::sleep(poll).await;
                }
            }
        }

        debug!(worker = self.index, "Worker exiting");
    }

    async fn process(&self, lease: Lease) {
        let msg = &lease.message;
        let Some(handler) = self.handlers.get(&msg.kind) else {
            error!(kind = %msg.kind, message_id = %msg.id, "No handler for message kind, dropping");
            self.ack(&lease).await;
            return;
        };

        debug!(
            worker = self.index,
            kind = %msg.kind,
            job_id = %msg.job_id,
            attempt = lease.receive_count,
            "Handling message"
        );

        // Keep the lease alive while the handler runs.
        let lease_for = self.runtime.config.queue.lease;
        let mut keepalive = tokio::time::interval((lease_for / 3).max(Duration::from_millis(10)));
        keepalive.tick().await;

        let work = handler.handle(&lease);
        tokio::pin!(work);
        let result = loop {
            tokio::select! {
                result = &mut work => break result,
                _ = keepalive.tick() => {
                    match self.runtime.queue.extend(&lease, lease_for).await {
                        Ok(true) => {}
                        Ok(false) => warn!(message_id = %msg.id, "Lease lost while handling"),
                        Err(e) => warn!(message_id = %msg.id, "Lease extension failed: {}", e),
                    }
                }
            }
        };

        match result {
            Ok(HandlerOutcome::Done) => self.ack(&lease).await,
            Ok(HandlerOutcome::Reschedule { delay, payload }) => {
                if let Err(e) = self
                    .runtime
                    .queue
                    .requeue(&lease, delay, payload.as_ref())
                    .await
                {
                    error!(message_id = %msg.id, "Requeue failed: {}", e);
                }
            }
            Err(HandlerError::Retryable(reason)) => {
                let delay = retry_backoff(&self.runtime.config.queue, lease.receive_count);
                warn!(
                    kind = %msg.kind,
                    job_id = %msg.job_id,
                    attempt = lease.receive_count,
                    delay_ms = delay.as_millis() as u64,
                    "Handler failed, will retry: {}",
                    reason
                );
                if let Err(e) = self.runtime.queue.release(&lease, delay).await {
                    error!(message_id = %msg.id, "Release failed: {}", e);
                }
            }
            Err(HandlerError::Terminal(reason)) => {
                warn!(kind = %msg.kind, job_id = %msg.job_id, "Handler failed: {}", reason);
                self.ack(&lease).await;
                if let Err(e) = self.runtime.fail(msg.job_id, &reason, None).await {
                    report("Failed to record job failure", &e);
                }
            }
        }
    }

    async fn ack(&self, lease: &Lease) {
        match self.runtime.queue.delete(lease).await {
            Ok(true) => {}
            Ok(false) => debug!(message_id = %lease.message.id, "Message re-armed or lease lost before ack"),
            Err(e) => error!(message_id = %lease.message.id, "Ack failed: {}", e),
        }
    }

    async fn dead_lettered(&self, message: &QueueMessage, receive_count: u32) {
        error!(
            kind = %message.kind,
            job_id = %message.job_id,
            receive_count,
            "Message dead-lettered"
        );
        let reason = format!("message dead-lettered after {receive_count} deliveries");
        if let Err(e) = self
            .runtime
            .fail(message.job_id, &reason, Some("dead_lettered"))
            .await
        {
            report("Failed to record dead-lettered job", &e);
        }
    }
}
