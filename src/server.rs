//! Embedded server lifecycle
//!
//! Namespace content and node storage belong to the application; the adapter
//! only manages the run lifecycle and reports status transitions. The
//! runtime contract is the seam: the application hands in something that can
//! serve its namespace and the adapter runs it as a cancellable task.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use opcua::types::StatusCode;

use crate::config::EdgeStatus;
use crate::error::AdapterError;

/// A runnable OPC-UA server with an application-defined namespace.
///
/// `run` serves until the token is cancelled; a clean stop returns `Ok`.
#[async_trait]
pub trait ServerRuntime: Send + Sync {
    async fn run(&self, token: CancellationToken) -> Result<(), StatusCode>;
}

pub(crate) struct ServerHandle {
    endpoint: String,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub(crate) struct ServerHost {
    running: tokio::sync::Mutex<Option<ServerHandle>>,
}

impl ServerHost {
    pub fn new() -> Self {
        Self {
            running: tokio::sync::Mutex::new(None),
        }
    }

    pub async fn start(
        &self,
        endpoint: &str,
        runtime: Arc<dyn ServerRuntime>,
        on_status: impl Fn(&str, EdgeStatus) + Send + 'static,
    ) -> Result<(), AdapterError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(AdapterError::ServerAlreadyRunning);
        }

        let token = CancellationToken::new();
        let worker_token = token.clone();
        let worker_endpoint = endpoint.to_string();

        let handle = tokio::spawn(async move {
            tracing::info!("Server starting at {}", worker_endpoint);
            match runtime.run(worker_token).await {
                Ok(()) => tracing::info!("Server at {} stopped", worker_endpoint),
                Err(status) => {
                    tracing::error!("Server at {} failed: {}", worker_endpoint, status)
                }
            }
        });

        *running = Some(ServerHandle {
            endpoint: endpoint.to_string(),
            token,
            handle,
        });
        on_status(endpoint, EdgeStatus::ServerStarted);
        Ok(())
    }

    pub async fn stop(
        &self,
        on_status: impl Fn(&str, EdgeStatus) + Send + 'static,
    ) -> Result<(), AdapterError> {
        let server = {
            let mut running = self.running.lock().await;
            running.take().ok_or(AdapterError::ServerNotRunning)?
        };

        server.token.cancel();
        if let Err(e) = server.handle.await {
            tracing::warn!("Server task did not stop cleanly: {}", e);
        }
        on_status(&server.endpoint, EdgeStatus::StopServer);
        Ok(())
    }
}
