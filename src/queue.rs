//! Receive queue and dispatcher
//!
//! Producers enqueue response messages from any task; a single dispatcher
//! task drains the queue and invokes the callback registered for each
//! message kind. Messages enqueued by one producer are delivered in order;
//! no order is guaranteed between producers.

use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::AdapterCallbacks;
use crate::message::{ResponseKind, ResponseMessage};

struct QueueWorker {
    tx: mpsc::UnboundedSender<ResponseMessage>,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// The adapter-wide response queue. Created at configure time, started
/// lazily on the first connect, torn down when the last session goes away.
pub(crate) struct ReceiveQueue {
    callbacks: AdapterCallbacks,
    worker: Mutex<Option<QueueWorker>>,
}

impl ReceiveQueue {
    pub fn new(callbacks: AdapterCallbacks) -> Self {
        Self {
            callbacks,
            worker: Mutex::new(None),
        }
    }

    /// Start the dispatcher task if it is not already running.
    pub fn ensure_started(&self) {
        let mut guard = self.worker.lock().expect("queue worker lock");
        if guard.is_some() {
            return;
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<ResponseMessage>();
        let token = CancellationToken::new();
        let callbacks = self.callbacks.clone();
        let worker_token = token.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = worker_token.cancelled() => break,
                    msg = rx.recv() => {
                        match msg {
                            Some(msg) => dispatch(&callbacks, msg),
                            None => break,
                        }
                    }
                }
            }
            // Drain whatever was enqueued before the stop was requested.
            while let Ok(msg) = rx.try_recv() {
                dispatch(&callbacks, msg);
            }
        });

        *guard = Some(QueueWorker { tx, token, handle });
    }

    /// Enqueue a message for dispatch. Messages enqueued before the queue is
    /// started, or after teardown, are dropped with a warning.
    pub fn enqueue(&self, msg: ResponseMessage) {
        let guard = self.worker.lock().expect("queue worker lock");
        match guard.as_ref() {
            Some(worker) => {
                if worker.tx.send(msg).is_err() {
                    tracing::warn!("Receive queue dispatcher is gone, dropping message");
                }
            }
            None => {
                tracing::warn!("Receive queue is not running, dropping message");
            }
        }
    }

    /// Stop the dispatcher and wait for in-flight messages to be delivered.
    pub async fn shutdown(&self) {
        let worker = {
            let mut guard = self.worker.lock().expect("queue worker lock");
            guard.take()
        };
        if let Some(worker) = worker {
            worker.token.cancel();
            drop(worker.tx);
            if let Err(e) = worker.handle.await {
                tracing::warn!("Receive queue dispatcher did not shut down cleanly: {}", e);
            }
            tracing::debug!("Receive queue dispatcher stopped");
        }
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        self.worker.lock().expect("queue worker lock").is_some()
    }
}

fn dispatch(callbacks: &AdapterCallbacks, msg: ResponseMessage) {
    match msg.kind {
        ResponseKind::GeneralResponse => (callbacks.on_response)(msg),
        ResponseKind::BrowseResponse => (callbacks.on_browse)(msg),
        ResponseKind::Report => (callbacks.on_report)(msg),
        ResponseKind::Error => (callbacks.on_error)(msg),
    }
}
