//! Inbound dispatch: bounded intake, parallel across threads, serial
//! within one.
//!
//! The coordinator owns a per-thread queue map and an in-flight set. A
//! message for an idle thread starts a worker immediately; messages for a
//! busy thread wait in that thread's queue and run in arrival order. The
//! store's CAS remains the correctness authority; this ordering only keeps
//! the common case free of lost races and out-of-order follow-up replies.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info};

use crate::error::PipelineError;
use crate::mail::InboundEmail;
use crate::pipeline::PipelineEngine;

/// Default intake capacity before `submit` applies backpressure.
pub const DEFAULT_CAPACITY: usize = 256;

/// Handle for feeding emails into the pipeline.
pub struct Dispatcher {
    tx: mpsc::Sender<InboundEmail>,
    coordinator: tokio::task::JoinHandle<()>,
}

impl Dispatcher {
    /// Spawn the coordinator over `engine`.
    pub fn spawn(engine: Arc<PipelineEngine>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        let coordinator = tokio::spawn(coordinate(engine, rx));
        Self { tx, coordinator }
    }

    /// Enqueue one email; awaits when the intake is full.
    pub async fn submit(&self, email: InboundEmail) -> Result<(), PipelineError> {
        self.tx
            .send(email)
            .await
            .map_err(|_| PipelineError::Shutdown)
    }

    /// Stop accepting input and wait for everything queued to finish.
    pub async fn close(self) {
        drop(self.tx);
        let _ = self.coordinator.await;
    }
}

async fn coordinate(engine: Arc<PipelineEngine>, mut rx: mpsc::Receiver<InboundEmail>) {
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<String>();

    let mut queued: HashMap<String, VecDeque<InboundEmail>> = HashMap::new();
    let mut in_flight: HashSet<String> = HashSet::new();
    let mut intake_open = true;

    loop {
        tokio::select! {
            incoming = rx.recv(), if intake_open => match incoming {
                Some(email) => {
                    let thread = email.thread_id.clone();
                    if in_flight.contains(&thread) {
                        queued.entry(thread).or_default().push_back(email);
                    } else {
                        in_flight.insert(thread);
                        start_worker(&engine, &done_tx, email);
                    }
                }
                None => {
                    intake_open = false;
                    if in_flight.is_empty() {
                        break;
                    }
                }
            },
            finished = done_rx.recv() => {
                // done_tx lives in this scope, so the channel cannot close
                // while we are still looping.
                let Some(thread) = finished else { break };
                match queued.get_mut(&thread).and_then(VecDeque::pop_front) {
                    Some(next) => start_worker(&engine, &done_tx, next),
                    None => {
                        queued.remove(&thread);
                        in_flight.remove(&thread);
                        if !intake_open && in_flight.is_empty() {
                            break;
                        }
                    }
                }
            }
        }
    }
    info!("Dispatcher drained");
}

fn start_worker(
    engine: &Arc<PipelineEngine>,
    done_tx: &mpsc::UnboundedSender<String>,
    email: InboundEmail,
) {
    let engine = engine.clone();
    let done_tx = done_tx.clone();
    tokio::spawn(async move {
        let thread = email.thread_id.clone();
        let message_id = email.message_id.clone();
        if let Err(e) = engine.handle(email).await {
            error!(thread_id = %thread, message_id, error = %e, "Message processing failed");
        }
        let _ = done_tx.send(thread);
    });
}
