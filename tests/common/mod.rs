//! Scripted stack stand-ins and a callback-capturing harness for the
//! integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use opcua_edge_adapter::opcua::types::{
    ApplicationDescription, BrowseDescription, BrowseResult, ByteString, CallMethodRequest,
    CallMethodResult, DataValue, EndpointDescription, MonitoredItemCreateRequest,
    MonitoredItemCreateResult, MonitoredItemModifyRequest, MonitoredItemModifyResult,
    MonitoringMode, ReadValueId, StatusCode, WriteValue,
};
use opcua_edge_adapter::{
    AdapterCallbacks, AdapterConfig, AdapterSettings, DataChangeHandler, EdgeStatus, OpcUaAdapter,
    ResponseMessage, StackConnector, StackServices, SubscriptionParameter,
};

type BrowseFn = Box<dyn Fn(&[BrowseDescription]) -> Result<Vec<BrowseResult>, StatusCode> + Send + Sync>;

static INIT_TRACING: std::sync::Once = std::sync::Once::new();

/// Route adapter logs into the test output, once per process.
fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Scripted session. Every service call is recorded by name so tests can
/// assert what did (or did not) reach the network.
#[derive(Default)]
pub struct MockSession {
    pub calls: Mutex<Vec<String>>,
    pub read_results: Mutex<VecDeque<Result<Vec<DataValue>, StatusCode>>>,
    pub write_results: Mutex<VecDeque<Result<Vec<StatusCode>, StatusCode>>>,
    pub call_results: Mutex<VecDeque<Result<CallMethodResult, StatusCode>>>,
    pub browse_fn: Mutex<Option<BrowseFn>>,
    pub browse_next_results: Mutex<VecDeque<Result<Vec<BrowseResult>, StatusCode>>>,
    pub monitored_item_results: Mutex<VecDeque<Result<MonitoredItemCreateResult, StatusCode>>>,
    pub republish_results: Mutex<VecDeque<Result<(), StatusCode>>>,
    pub handlers: Mutex<Vec<DataChangeHandler>>,
    pub created_handles: Mutex<Vec<u32>>,
    pub next_subscription_id: AtomicU32,
    pub next_item_id: AtomicU32,
    pub publish_cycles: AtomicU32,
}

impl MockSession {
    pub fn new() -> Arc<Self> {
        let session = Self::default();
        session.next_subscription_id.store(100, Ordering::SeqCst);
        session.next_item_id.store(1000, Ordering::SeqCst);
        Arc::new(session)
    }

    fn record(&self, name: &str) {
        self.calls.lock().expect("calls lock").push(name.to_string());
    }

    pub fn recorded_calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }

    /// Fire a data change into the most recently registered subscription.
    pub fn fire_data_change(&self, client_handle: u32, value: DataValue) {
        let handlers = self.handlers.lock().expect("handlers lock");
        let handler = handlers.last().expect("no subscription handler registered");
        handler(client_handle, value);
    }

    /// Client handle assigned to the n-th created monitored item.
    pub fn created_handles(&self) -> Vec<u32> {
        self.created_handles
            .lock()
            .expect("created handles lock")
            .clone()
    }
}

#[async_trait]
impl StackServices for MockSession {
    async fn read(&self, _nodes: Vec<ReadValueId>) -> Result<Vec<DataValue>, StatusCode> {
        self.record("read");
        self.read_results
            .lock()
            .expect("read results lock")
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn write(&self, nodes: Vec<WriteValue>) -> Result<Vec<StatusCode>, StatusCode> {
        self.record("write");
        self.write_results
            .lock()
            .expect("write results lock")
            .pop_front()
            .unwrap_or_else(|| Ok(vec![StatusCode::Good; nodes.len()]))
    }

    async fn browse(
        &self,
        nodes: Vec<BrowseDescription>,
        _max_references_per_node: u32,
    ) -> Result<Vec<BrowseResult>, StatusCode> {
        self.record("browse");
        let browse_fn = self.browse_fn.lock().expect("browse fn lock");
        match browse_fn.as_ref() {
            Some(f) => f(&nodes),
            None => Ok(nodes
                .iter()
                .map(|_| BrowseResult {
                    status_code: StatusCode::Good,
                    continuation_point: ByteString::null(),
                    references: Some(Vec::new()),
                })
                .collect()),
        }
    }

    async fn browse_next(
        &self,
        _continuation_points: Vec<ByteString>,
    ) -> Result<Vec<BrowseResult>, StatusCode> {
        self.record("browse_next");
        self.browse_next_results
            .lock()
            .expect("browse next lock")
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn call_method(
        &self,
        _request: CallMethodRequest,
    ) -> Result<CallMethodResult, StatusCode> {
        self.record("call_method");
        self.call_results
            .lock()
            .expect("call results lock")
            .pop_front()
            .unwrap_or(Err(StatusCode::BadNotImplemented))
    }

    async fn create_subscription(
        &self,
        _parameter: &SubscriptionParameter,
        on_data_change: DataChangeHandler,
    ) -> Result<u32, StatusCode> {
        self.record("create_subscription");
        self.handlers
            .lock()
            .expect("handlers lock")
            .push(on_data_change);
        Ok(self.next_subscription_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn create_monitored_item(
        &self,
        _subscription_id: u32,
        request: MonitoredItemCreateRequest,
    ) -> Result<MonitoredItemCreateResult, StatusCode> {
        self.record("create_monitored_item");
        self.created_handles
            .lock()
            .expect("created handles lock")
            .push(request.requested_parameters.client_handle);
        if let Some(scripted) = self
            .monitored_item_results
            .lock()
            .expect("item results lock")
            .pop_front()
        {
            return scripted;
        }
        Ok(MonitoredItemCreateResult {
            status_code: StatusCode::Good,
            monitored_item_id: self.next_item_id.fetch_add(1, Ordering::SeqCst),
            revised_sampling_interval: request.requested_parameters.sampling_interval,
            revised_queue_size: request.requested_parameters.queue_size,
            filter_result: Default::default(),
        })
    }

    async fn modify_subscription(
        &self,
        _subscription_id: u32,
        _parameter: &SubscriptionParameter,
    ) -> Result<(), StatusCode> {
        self.record("modify_subscription");
        Ok(())
    }

    async fn modify_monitored_item(
        &self,
        _subscription_id: u32,
        request: MonitoredItemModifyRequest,
    ) -> Result<MonitoredItemModifyResult, StatusCode> {
        self.record("modify_monitored_item");
        Ok(MonitoredItemModifyResult {
            status_code: StatusCode::Good,
            revised_sampling_interval: request.requested_parameters.sampling_interval,
            revised_queue_size: request.requested_parameters.queue_size,
            filter_result: Default::default(),
        })
    }

    async fn set_monitoring_mode(
        &self,
        _subscription_id: u32,
        _mode: MonitoringMode,
        monitored_item_ids: Vec<u32>,
    ) -> Result<Vec<StatusCode>, StatusCode> {
        self.record("set_monitoring_mode");
        Ok(vec![StatusCode::Good; monitored_item_ids.len()])
    }

    async fn set_publishing_mode(
        &self,
        subscription_ids: Vec<u32>,
        _enabled: bool,
    ) -> Result<Vec<StatusCode>, StatusCode> {
        self.record("set_publishing_mode");
        Ok(vec![StatusCode::Good; subscription_ids.len()])
    }

    async fn delete_monitored_item(
        &self,
        _subscription_id: u32,
        _monitored_item_id: u32,
    ) -> Result<StatusCode, StatusCode> {
        self.record("delete_monitored_item");
        Ok(StatusCode::Good)
    }

    async fn delete_subscription(&self, _subscription_id: u32) -> Result<StatusCode, StatusCode> {
        self.record("delete_subscription");
        Ok(StatusCode::Good)
    }

    async fn republish(
        &self,
        _subscription_id: u32,
        _retransmit_sequence_number: u32,
    ) -> Result<(), StatusCode> {
        self.record("republish");
        self.republish_results
            .lock()
            .expect("republish lock")
            .pop_front()
            .unwrap_or(Ok(()))
    }

    async fn run_publish_cycle(&self) {
        self.publish_cycles.fetch_add(1, Ordering::SeqCst);
    }

    async fn disconnect(&self) {
        self.record("disconnect");
    }
}

/// Scripted connector handing out one shared mock session.
pub struct MockConnector {
    pub session: Arc<MockSession>,
    pub connect_results: Mutex<VecDeque<Result<(), StatusCode>>>,
    pub servers: Mutex<Vec<ApplicationDescription>>,
    pub endpoints: Mutex<Vec<EndpointDescription>>,
}

impl MockConnector {
    pub fn new(session: Arc<MockSession>) -> Arc<Self> {
        Arc::new(Self {
            session,
            connect_results: Mutex::new(VecDeque::new()),
            servers: Mutex::new(Vec::new()),
            endpoints: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl StackConnector for MockConnector {
    async fn connect(&self, _endpoint_url: &str) -> Result<Arc<dyn StackServices>, StatusCode> {
        if let Some(scripted) = self
            .connect_results
            .lock()
            .expect("connect results lock")
            .pop_front()
        {
            scripted?;
        }
        Ok(self.session.clone())
    }

    async fn find_servers(
        &self,
        _discovery_url: &str,
    ) -> Result<Vec<ApplicationDescription>, StatusCode> {
        Ok(self.servers.lock().expect("servers lock").clone())
    }

    async fn get_endpoints(
        &self,
        _server_url: &str,
    ) -> Result<Vec<EndpointDescription>, StatusCode> {
        Ok(self.endpoints.lock().expect("endpoints lock").clone())
    }
}

/// Adapter plus channels capturing everything the callbacks see.
pub struct Harness {
    pub adapter: OpcUaAdapter,
    pub session: Arc<MockSession>,
    pub connector: Arc<MockConnector>,
    pub responses: Receiver<ResponseMessage>,
    pub browses: Receiver<ResponseMessage>,
    pub reports: Receiver<ResponseMessage>,
    pub errors: Receiver<ResponseMessage>,
    pub statuses: Receiver<(String, EdgeStatus)>,
}

fn channel_callback<T: Send + 'static>(tx: Sender<T>) -> impl Fn(T) + Send + Sync {
    let tx = Mutex::new(tx);
    move |value| {
        let _ = tx.lock().expect("callback tx lock").send(value);
    }
}

impl Harness {
    pub fn new() -> Self {
        init_tracing();
        let session = MockSession::new();
        let connector = MockConnector::new(session.clone());

        let (response_tx, responses) = std::sync::mpsc::channel();
        let (browse_tx, browses) = std::sync::mpsc::channel();
        let (report_tx, reports) = std::sync::mpsc::channel();
        let (error_tx, errors) = std::sync::mpsc::channel();
        let (status_tx, statuses) = std::sync::mpsc::channel();

        let status_cb = channel_callback(status_tx);
        let callbacks = AdapterCallbacks::noop()
            .with_response(channel_callback(response_tx))
            .with_browse(channel_callback(browse_tx))
            .with_report(channel_callback(report_tx))
            .with_error(channel_callback(error_tx))
            .with_status(move |endpoint, status| status_cb((endpoint.to_string(), status)));

        let adapter = OpcUaAdapter::with_connector(
            AdapterConfig::new(AdapterSettings::default(), callbacks),
            connector.clone(),
        );

        Self {
            adapter,
            session,
            connector,
            responses,
            browses,
            reports,
            errors,
            statuses,
        }
    }
}

/// Await one message from a capture channel without blocking the runtime.
pub async fn recv<T>(rx: &Receiver<T>) -> T {
    for _ in 0..500 {
        if let Ok(value) = rx.try_recv() {
            return value;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for a message");
}

/// Assert that nothing arrives on a capture channel.
pub async fn assert_silent<T>(rx: &Receiver<T>) {
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err(), "unexpected message delivered");
}
