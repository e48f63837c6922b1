//! Adapter facade
//!
//! Every verb validates its arguments synchronously, resolves the session,
//! and delegates to the owning subsystem. Data results are delivered through
//! the receive queue; discovery results return directly.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::attributes;
use crate::browse;
use crate::config::{AdapterConfig, AdapterSettings, EdgeStatus};
use crate::discovery::{self, EdgeApplication, EdgeEndpoint};
use crate::error::AdapterError;
use crate::message::{Command, RequestMessage};
use crate::method;
use crate::queue::ReceiveQueue;
use crate::server::{ServerHost, ServerRuntime};
use crate::session::{session_key, SessionEntry, SessionRegistry};
use crate::stack::{OpcUaConnector, StackConnector};
use crate::subscription;

/// The adapter context. All shared state lives here; independent adapters
/// can coexist in one process.
pub struct OpcUaAdapter {
    config: AdapterConfig,
    connector: Arc<dyn StackConnector>,
    registry: SessionRegistry,
    queue: Arc<ReceiveQueue>,
    serial: Arc<tokio::sync::Mutex<()>>,
    server: ServerHost,
    next_message_id: AtomicU32,
}

impl OpcUaAdapter {
    /// Create an adapter backed by the production OPC-UA stack.
    pub fn configure(config: AdapterConfig) -> Self {
        let connector = Arc::new(OpcUaConnector::new(config.settings.clone()));
        Self::with_connector(config, connector)
    }

    /// Create an adapter over a caller-supplied stack implementation.
    pub fn with_connector(config: AdapterConfig, connector: Arc<dyn StackConnector>) -> Self {
        let queue = Arc::new(ReceiveQueue::new(config.callbacks.clone()));
        Self {
            config,
            connector,
            registry: SessionRegistry::default(),
            queue,
            serial: Arc::new(tokio::sync::Mutex::new(())),
            server: ServerHost::new(),
            next_message_id: AtomicU32::new(1),
        }
    }

    pub fn settings(&self) -> &AdapterSettings {
        &self.config.settings
    }

    /// Connect a client session to an endpoint.
    pub async fn connect_client(&self, endpoint_url: &str) -> Result<(), AdapterError> {
        let key = session_key(endpoint_url)?;
        if self.registry.contains(&key) {
            return Err(AdapterError::AlreadyConnected(endpoint_url.to_string()));
        }

        let services = self
            .connector
            .connect(endpoint_url)
            .await
            .map_err(|status| {
                tracing::error!("Connect to {} failed: {}", endpoint_url, status);
                AdapterError::ConnectFailed(endpoint_url.to_string())
            })?;

        self.queue.ensure_started();

        let entry = Arc::new(SessionEntry::new(
            endpoint_url.to_string(),
            key,
            services.clone(),
        ));
        if let Err(e) = self.registry.insert(entry) {
            // Lost a connect race for the same key; this session is surplus.
            services.disconnect().await;
            return Err(e);
        }

        (self.config.callbacks.on_status)(endpoint_url, EdgeStatus::ClientStarted);
        Ok(())
    }

    /// Disconnect and destroy the session for an endpoint.
    pub async fn disconnect_client(&self, endpoint_url: &str) -> Result<(), AdapterError> {
        let entry = self.registry.remove(endpoint_url)?;

        subscription::drain(&entry, &self.serial).await;
        entry.services.disconnect().await;

        (self.config.callbacks.on_status)(&entry.endpoint, EdgeStatus::StopClient);

        if self.registry.count() == 0 {
            self.queue.shutdown().await;
        }
        Ok(())
    }

    /// Whether a session exists for the endpoint.
    pub fn is_connected(&self, endpoint_url: &str) -> bool {
        self.registry.get(endpoint_url).is_ok()
    }

    /// Number of live client sessions.
    pub fn session_count(&self) -> usize {
        self.registry.count()
    }

    /// Find and validate servers known to a discovery server. Surviving
    /// descriptions are also announced through the endpoint-found callback.
    pub async fn find_servers(
        &self,
        discovery_url: &str,
        server_uris: &[String],
        locale_ids: &[String],
    ) -> Result<Vec<EdgeApplication>, AdapterError> {
        discovery::find_servers(
            self.connector.as_ref(),
            &self.config,
            discovery_url,
            server_uris,
            locale_ids,
        )
        .await
    }

    /// Summarize the endpoints offered by a server.
    pub async fn get_endpoint_info(
        &self,
        server_url: &str,
    ) -> Result<Vec<EdgeEndpoint>, AdapterError> {
        discovery::get_endpoints(self.connector.as_ref(), server_url).await
    }

    /// Read the Value attribute of every requested node.
    pub async fn read_node(&self, mut msg: RequestMessage) -> Result<(), AdapterError> {
        self.prepare(&mut msg, true)?;
        let session = self.registry.get(&msg.endpoint)?;
        attributes::execute_read(&session, &self.queue, &self.serial, &msg, false).await
    }

    /// Read the MinimumSamplingInterval attribute of every requested node.
    pub async fn read_sampling_interval(&self, mut msg: RequestMessage) -> Result<(), AdapterError> {
        self.prepare(&mut msg, true)?;
        let session = self.registry.get(&msg.endpoint)?;
        attributes::execute_read(&session, &self.queue, &self.serial, &msg, true).await
    }

    /// Write typed values to the requested nodes.
    pub async fn write_node(&self, mut msg: RequestMessage) -> Result<(), AdapterError> {
        self.prepare(&mut msg, true)?;
        let session = self.registry.get(&msg.endpoint)?;
        attributes::execute_write(&session, &self.queue, &self.serial, &msg).await
    }

    /// Invoke one method on one object.
    pub async fn call_method(&self, mut msg: RequestMessage) -> Result<(), AdapterError> {
        self.prepare(&mut msg, true)?;
        let session = self.registry.get(&msg.endpoint)?;
        method::execute_call(&session, &self.queue, &self.serial, &msg).await
    }

    /// Recursively browse from the requested start nodes (or the root
    /// folder when none are named).
    pub async fn browse_node(&self, mut msg: RequestMessage) -> Result<(), AdapterError> {
        self.prepare(&mut msg, false)?;
        let session = self.registry.get(&msg.endpoint)?;
        browse::execute_browse(&session, &self.queue, &self.serial, &msg).await
    }

    /// Browse for view nodes; the accumulated list arrives as one browse
    /// response.
    pub async fn browse_views(&self, mut msg: RequestMessage) -> Result<(), AdapterError> {
        self.prepare(&mut msg, false)?;
        let session = self.registry.get(&msg.endpoint)?;
        browse::execute_browse_views(&session, &self.queue, &self.serial, &msg).await
    }

    /// Resume truncated browses from previously delivered continuation
    /// points.
    pub async fn browse_next(&self, mut msg: RequestMessage) -> Result<(), AdapterError> {
        self.prepare(&mut msg, false)?;
        let session = self.registry.get(&msg.endpoint)?;
        browse::execute_browse_next(&session, &self.queue, &self.serial, &msg).await
    }

    /// Create, modify, delete, or republish a subscription.
    pub async fn handle_subscription(&self, mut msg: RequestMessage) -> Result<(), AdapterError> {
        self.prepare(&mut msg, true)?;
        let session = self.registry.get(&msg.endpoint)?;
        subscription::execute_subscription(&session, &self.queue, &self.serial, &msg).await
    }

    /// Dispatch a request message by its command code.
    pub async fn send_request(&self, msg: RequestMessage) -> Result<(), AdapterError> {
        match msg.command {
            Command::Read => self.read_node(msg).await,
            Command::ReadSamplingInterval => self.read_sampling_interval(msg).await,
            Command::Write => self.write_node(msg).await,
            Command::Browse => self.browse_node(msg).await,
            Command::BrowseNext => self.browse_next(msg).await,
            Command::BrowseView => self.browse_views(msg).await,
            Command::MethodCall => self.call_method(msg).await,
            Command::Subscription => self.handle_subscription(msg).await,
        }
    }

    /// Host an application-provided server runtime.
    pub async fn create_server(
        &self,
        endpoint_url: &str,
        runtime: Arc<dyn ServerRuntime>,
    ) -> Result<(), AdapterError> {
        self.queue.ensure_started();
        let on_status = self.config.callbacks.on_status.clone();
        self.server
            .start(endpoint_url, runtime, move |endpoint, status| {
                on_status(endpoint, status)
            })
            .await
    }

    /// Stop the hosted server runtime.
    pub async fn close_server(&self) -> Result<(), AdapterError> {
        let on_status = self.config.callbacks.on_status.clone();
        self.server
            .stop(move |endpoint, status| on_status(endpoint, status))
            .await
    }

    /// Number of subscription records on a session.
    pub async fn subscription_count(&self, endpoint_url: &str) -> Result<usize, AdapterError> {
        let session = self.registry.get(endpoint_url)?;
        let state = session.subscriptions.lock().await;
        Ok(state.count())
    }

    /// Whether the session's publish pump task is running.
    pub async fn has_publish_pump(&self, endpoint_url: &str) -> Result<bool, AdapterError> {
        let session = self.registry.get(endpoint_url)?;
        let state = session.subscriptions.lock().await;
        Ok(state.pump_running())
    }

    fn prepare(&self, msg: &mut RequestMessage, require_requests: bool) -> Result<(), AdapterError> {
        if require_requests && msg.requests.is_empty() {
            return Err(AdapterError::EmptyRequest);
        }
        if msg.message_id == 0 {
            msg.message_id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}
