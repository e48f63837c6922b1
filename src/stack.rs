//! Contracts consumed from the OPC-UA stack
//!
//! The rest of the adapter only sees these two traits. The production
//! implementation wraps the `async-opcua` client; tests substitute scripted
//! stand-ins.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use opcua::client::{Client, ClientBuilder, DataChangeCallback, IdentityToken, Session};
use opcua::types::{
    ApplicationDescription, BrowseDescription, BrowseResult, ByteString, CallMethodRequest,
    CallMethodResult, DataValue, EndpointDescription, MessageSecurityMode,
    MonitoredItemCreateRequest, MonitoredItemCreateResult, MonitoredItemModifyRequest,
    MonitoredItemModifyResult, MonitoringMode, ReadValueId, StatusCode, TimestampsToReturn,
    UserTokenPolicy, WriteValue,
};

use crate::config::AdapterSettings;
use crate::message::SubscriptionParameter;

static NEXT_CLIENT_HANDLE: AtomicU32 = AtomicU32::new(1);

/// Allocate a process-unique client handle for a monitored item.
pub(crate) fn next_client_handle() -> u32 {
    NEXT_CLIENT_HANDLE.fetch_add(1, Ordering::Relaxed)
}

/// Called by the stack for every data-change notification, with the client
/// handle of the monitored item that produced the value.
pub type DataChangeHandler = Arc<dyn Fn(u32, DataValue) + Send + Sync>;

/// Services available on one connected session.
#[async_trait]
pub trait StackServices: Send + Sync {
    async fn read(&self, nodes: Vec<ReadValueId>) -> Result<Vec<DataValue>, StatusCode>;

    async fn write(&self, nodes: Vec<WriteValue>) -> Result<Vec<StatusCode>, StatusCode>;

    async fn browse(
        &self,
        nodes: Vec<BrowseDescription>,
        max_references_per_node: u32,
    ) -> Result<Vec<BrowseResult>, StatusCode>;

    async fn browse_next(
        &self,
        continuation_points: Vec<ByteString>,
    ) -> Result<Vec<BrowseResult>, StatusCode>;

    async fn call_method(
        &self,
        request: CallMethodRequest,
    ) -> Result<CallMethodResult, StatusCode>;

    async fn create_subscription(
        &self,
        parameter: &SubscriptionParameter,
        on_data_change: DataChangeHandler,
    ) -> Result<u32, StatusCode>;

    async fn create_monitored_item(
        &self,
        subscription_id: u32,
        request: MonitoredItemCreateRequest,
    ) -> Result<MonitoredItemCreateResult, StatusCode>;

    async fn modify_subscription(
        &self,
        subscription_id: u32,
        parameter: &SubscriptionParameter,
    ) -> Result<(), StatusCode>;

    async fn modify_monitored_item(
        &self,
        subscription_id: u32,
        request: MonitoredItemModifyRequest,
    ) -> Result<MonitoredItemModifyResult, StatusCode>;

    async fn set_monitoring_mode(
        &self,
        subscription_id: u32,
        mode: MonitoringMode,
        monitored_item_ids: Vec<u32>,
    ) -> Result<Vec<StatusCode>, StatusCode>;

    async fn set_publishing_mode(
        &self,
        subscription_ids: Vec<u32>,
        enabled: bool,
    ) -> Result<Vec<StatusCode>, StatusCode>;

    async fn delete_monitored_item(
        &self,
        subscription_id: u32,
        monitored_item_id: u32,
    ) -> Result<StatusCode, StatusCode>;

    async fn delete_subscription(&self, subscription_id: u32) -> Result<StatusCode, StatusCode>;

    async fn republish(
        &self,
        subscription_id: u32,
        retransmit_sequence_number: u32,
    ) -> Result<(), StatusCode>;

    /// Drive one publish round. The publish pump calls this on its tick.
    async fn run_publish_cycle(&self);

    async fn disconnect(&self);
}

/// Connection and discovery services, independent of any session.
#[async_trait]
pub trait StackConnector: Send + Sync {
    async fn connect(&self, endpoint_url: &str) -> Result<Arc<dyn StackServices>, StatusCode>;

    async fn find_servers(
        &self,
        discovery_url: &str,
    ) -> Result<Vec<ApplicationDescription>, StatusCode>;

    async fn get_endpoints(&self, server_url: &str)
        -> Result<Vec<EndpointDescription>, StatusCode>;
}

/// Production connector backed by `async-opcua`.
pub struct OpcUaConnector {
    settings: AdapterSettings,
}

impl OpcUaConnector {
    pub fn new(settings: AdapterSettings) -> Self {
        Self { settings }
    }

    fn build_client(&self) -> Result<Client, StatusCode> {
        ClientBuilder::new()
            .application_name(self.settings.application_name.as_str())
            .application_uri(self.settings.application_uri.as_str())
            .product_uri(self.settings.product_uri.as_str())
            .create_sample_keypair(false)
            .trust_server_certs(true)
            .session_retry_limit(self.settings.session_retry_limit)
            .session_timeout(self.settings.session_timeout_ms)
            .client()
            .map_err(|e| {
                tracing::error!("Failed to build OPC-UA client: {:?}", e);
                StatusCode::BadConfigurationError
            })
    }
}

#[async_trait]
impl StackConnector for OpcUaConnector {
    async fn connect(&self, endpoint_url: &str) -> Result<Arc<dyn StackServices>, StatusCode> {
        tracing::info!("Connecting to OPC-UA server: {}", endpoint_url);

        let mut client = self.build_client()?;

        let endpoint: EndpointDescription = (
            endpoint_url,
            "None",
            MessageSecurityMode::None,
            UserTokenPolicy::anonymous(),
        )
            .into();

        let (session, event_loop) = client
            .connect_to_matching_endpoint(endpoint, IdentityToken::Anonymous)
            .await
            .map_err(|e| {
                tracing::error!("Failed to connect to {}: {:?}", endpoint_url, e);
                StatusCode::BadConnectionRejected
            })?;

        let event_loop_handle = event_loop.spawn();
        if !session.wait_for_connection().await {
            tracing::error!("Session for {} never became connected", endpoint_url);
            event_loop_handle.abort();
            return Err(StatusCode::BadConnectionRejected);
        }

        tracing::info!("OPC-UA session established for {}", endpoint_url);

        Ok(Arc::new(OpcUaSession {
            _client: client,
            session,
            event_loop_handle,
        }))
    }

    async fn find_servers(
        &self,
        discovery_url: &str,
    ) -> Result<Vec<ApplicationDescription>, StatusCode> {
        tracing::info!("Finding servers at {}", discovery_url);
        let client = self.build_client()?;
        client.find_servers(discovery_url, None, None).await
    }

    async fn get_endpoints(
        &self,
        server_url: &str,
    ) -> Result<Vec<EndpointDescription>, StatusCode> {
        tracing::info!("Discovering endpoints at {}", server_url);
        let client = self.build_client()?;
        client
            .get_server_endpoints_from_url(server_url)
            .await
            .map_err(|e| e.status())
    }
}

/// One live `async-opcua` session. The event loop task drives connection
/// maintenance; publish timing is triggered by the adapter's pump.
struct OpcUaSession {
    _client: Client,
    session: Arc<Session>,
    event_loop_handle: JoinHandle<StatusCode>,
}

#[async_trait]
impl StackServices for OpcUaSession {
    async fn read(&self, nodes: Vec<ReadValueId>) -> Result<Vec<DataValue>, StatusCode> {
        self.session
            .read(&nodes, TimestampsToReturn::Both, 0.0)
            .await
    }

    async fn write(&self, nodes: Vec<WriteValue>) -> Result<Vec<StatusCode>, StatusCode> {
        self.session.write(&nodes).await
    }

    async fn browse(
        &self,
        nodes: Vec<BrowseDescription>,
        max_references_per_node: u32,
    ) -> Result<Vec<BrowseResult>, StatusCode> {
        self.session
            .browse(&nodes, max_references_per_node, None)
            .await
    }

    async fn browse_next(
        &self,
        continuation_points: Vec<ByteString>,
    ) -> Result<Vec<BrowseResult>, StatusCode> {
        self.session.browse_next(false, &continuation_points).await
    }

    async fn call_method(
        &self,
        request: CallMethodRequest,
    ) -> Result<CallMethodResult, StatusCode> {
        let results = self.session.call(vec![request]).await?;
        results.into_iter().next().ok_or(StatusCode::BadUnexpectedError)
    }

    async fn create_subscription(
        &self,
        parameter: &SubscriptionParameter,
        on_data_change: DataChangeHandler,
    ) -> Result<u32, StatusCode> {
        let callback = DataChangeCallback::new(move |value, item| {
            on_data_change(item.client_handle(), value);
        });
        self.session
            .create_subscription(
                Duration::from_millis(parameter.publishing_interval_ms as u64),
                parameter.lifetime_count,
                parameter.max_keep_alive_count,
                parameter.max_notifications_per_publish,
                parameter.priority,
                parameter.publishing_enabled,
                callback,
            )
            .await
    }

    async fn create_monitored_item(
        &self,
        subscription_id: u32,
        request: MonitoredItemCreateRequest,
    ) -> Result<MonitoredItemCreateResult, StatusCode> {
        let results = self
            .session
            .create_monitored_items(subscription_id, TimestampsToReturn::Both, vec![request])
            .await?;
        results
            .into_iter()
            .next()
            .map(|item| item.result)
            .ok_or(StatusCode::BadUnexpectedError)
    }

    async fn modify_subscription(
        &self,
        subscription_id: u32,
        parameter: &SubscriptionParameter,
    ) -> Result<(), StatusCode> {
        self.session
            .modify_subscription(
                subscription_id,
                Duration::from_millis(parameter.publishing_interval_ms as u64),
                parameter.lifetime_count,
                parameter.max_keep_alive_count,
                parameter.max_notifications_per_publish,
                parameter.priority,
            )
            .await
            .map_err(|e| {
                tracing::warn!("ModifySubscription failed for {}: {}", subscription_id, e);
                e
            })
    }

    async fn modify_monitored_item(
        &self,
        subscription_id: u32,
        request: MonitoredItemModifyRequest,
    ) -> Result<MonitoredItemModifyResult, StatusCode> {
        let results = self
            .session
            .modify_monitored_items(subscription_id, TimestampsToReturn::Both, &[request])
            .await?;
        results.into_iter().next().ok_or(StatusCode::BadUnexpectedError)
    }

    async fn set_monitoring_mode(
        &self,
        subscription_id: u32,
        mode: MonitoringMode,
        monitored_item_ids: Vec<u32>,
    ) -> Result<Vec<StatusCode>, StatusCode> {
        self.session
            .set_monitoring_mode(subscription_id, mode, &monitored_item_ids)
            .await
    }

    async fn set_publishing_mode(
        &self,
        subscription_ids: Vec<u32>,
        enabled: bool,
    ) -> Result<Vec<StatusCode>, StatusCode> {
        self.session
            .set_publishing_mode(&subscription_ids, enabled)
            .await
    }

    async fn delete_monitored_item(
        &self,
        subscription_id: u32,
        monitored_item_id: u32,
    ) -> Result<StatusCode, StatusCode> {
        let results = self
            .session
            .delete_monitored_items(subscription_id, &[monitored_item_id])
            .await?;
        results.into_iter().next().ok_or(StatusCode::BadUnexpectedError)
    }

    async fn delete_subscription(&self, subscription_id: u32) -> Result<StatusCode, StatusCode> {
        self.session.delete_subscription(subscription_id).await
    }

    async fn republish(
        &self,
        subscription_id: u32,
        retransmit_sequence_number: u32,
    ) -> Result<(), StatusCode> {
        self.session
            .republish(subscription_id, retransmit_sequence_number)
            .await
            .map(|_| ())
    }

    async fn run_publish_cycle(&self) {
        self.session.trigger_publish_now();
    }

    async fn disconnect(&self) {
        tracing::info!("Disconnecting OPC-UA session");
        if let Err(e) = self.session.disconnect().await {
            tracing::warn!("Session disconnect returned {}", e);
        }
        self.event_loop_handle.abort();
    }
}
