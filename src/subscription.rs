//! Subscription engine and publish pump
//!
//! Per session: a map of value alias to subscription record, and one pump
//! task that drives publish rounds while at least one record exists. The
//! pump takes the adapter-wide serialization lock around every cycle so
//! request traffic never races publish handling.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use opcua::types::{
    DataValue, ExtensionObject, MonitoredItemCreateRequest, MonitoredItemModifyRequest,
    MonitoringMode, MonitoringParameters, StatusCode,
};

use crate::error::AdapterError;
use crate::message::{
    EdgeNodeId, EdgeTimestamp, NodeRequest, NodeResponse, RequestMessage, ResponseMessage,
    SubscriptionOperation,
};
use crate::queue::ReceiveQueue;
use crate::session::SessionEntry;
use crate::stack::{next_client_handle, DataChangeHandler};
use crate::value::EdgeValue;

/// Publish pump tick.
pub const PUBLISH_TICK: Duration = Duration::from_millis(5);

/// Default retransmit sequence number for republish.
pub const REPUBLISH_RETRANSMIT_SEQUENCE: u32 = 2;

/// Context attached to a monitored item for report dispatch.
#[derive(Debug, Clone)]
pub(crate) struct DispatchContext {
    pub alias: String,
    pub node: EdgeNodeId,
    pub message_id: u32,
    pub endpoint: String,
}

pub(crate) type DispatchMap = Mutex<HashMap<u32, DispatchContext>>;

/// One subscribed node on a session.
#[derive(Debug, Clone)]
pub(crate) struct SubRecord {
    pub request: NodeRequest,
    pub subscription_id: u32,
    pub monitored_item_id: u32,
    pub client_handle: u32,
}

pub(crate) struct PumpHandle {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Subscription bookkeeping for one session.
pub(crate) struct SubscriptionState {
    /// value alias -> record; (session, alias) is unique
    pub records: HashMap<String, SubRecord>,
    pub pump: Option<PumpHandle>,
    /// client handle -> dispatch context, read from the stack callback
    pub dispatch: Arc<DispatchMap>,
}

impl Default for SubscriptionState {
    fn default() -> Self {
        Self {
            records: HashMap::new(),
            pump: None,
            dispatch: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl SubscriptionState {
    pub fn count(&self) -> usize {
        self.records.len()
    }

    pub fn pump_running(&self) -> bool {
        self.pump.is_some()
    }
}

/// Entry point for the subscription command.
pub(crate) async fn execute_subscription(
    session: &Arc<SessionEntry>,
    queue: &Arc<ReceiveQueue>,
    serial: &Arc<tokio::sync::Mutex<()>>,
    msg: &RequestMessage,
) -> Result<(), AdapterError> {
    let operation = msg
        .requests
        .first()
        .and_then(|r| r.subscription.as_ref())
        .map(|p| p.operation)
        .ok_or_else(|| {
            AdapterError::UnsupportedValue("subscription request without parameters".to_string())
        })?;

    match operation {
        SubscriptionOperation::Create => create(session, queue, serial, msg).await,
        SubscriptionOperation::Modify => modify(session, serial, msg).await,
        SubscriptionOperation::Delete => delete(session, serial, msg).await,
        SubscriptionOperation::Republish => republish(session, serial, msg).await,
    }
}

async fn create(
    session: &Arc<SessionEntry>,
    queue: &Arc<ReceiveQueue>,
    serial: &Arc<tokio::sync::Mutex<()>>,
    msg: &RequestMessage,
) -> Result<(), AdapterError> {
    // Both alias checks happen before any network traffic.
    let aliases: Vec<String> = msg.requests.iter().map(|r| r.effective_alias()).collect();
    for (i, alias) in aliases.iter().enumerate() {
        if aliases[..i].contains(alias) {
            return Err(AdapterError::DuplicateAlias(alias.clone()));
        }
    }
    let dispatch = {
        let state = session.subscriptions.lock().await;
        for alias in &aliases {
            if state.records.contains_key(alias) {
                return Err(AdapterError::AlreadySubscribed(alias.clone()));
            }
        }
        state.dispatch.clone()
    };

    let parameter = msg.requests[0]
        .subscription
        .clone()
        .unwrap_or_default();

    let handler: DataChangeHandler = {
        let queue = queue.clone();
        let dispatch = dispatch.clone();
        Arc::new(move |client_handle, value| {
            deliver_report(&queue, &dispatch, client_handle, value);
        })
    };

    let subscription_id = {
        let _guard = serial.lock().await;
        session
            .services
            .create_subscription(&parameter, handler)
            .await
            .map_err(AdapterError::Service)?
    };

    let collides = {
        let state = session.subscriptions.lock().await;
        state
            .records
            .values()
            .any(|r| r.subscription_id == subscription_id)
    };
    if collides {
        let _guard = serial.lock().await;
        let _ = session.services.delete_subscription(subscription_id).await;
        return Err(AdapterError::SubscriptionIdCollision(subscription_id));
    }

    tracing::info!(
        "Created subscription {} on {} for {} nodes",
        subscription_id,
        session.endpoint,
        msg.requests.len()
    );

    let mut created = 0usize;
    for (request, alias) in msg.requests.iter().zip(aliases.iter()) {
        let item_parameter = request.subscription.clone().unwrap_or_else(|| parameter.clone());
        let client_handle = next_client_handle();

        let mut item: MonitoredItemCreateRequest = request.node.to_node_id().into();
        item.requested_parameters.client_handle = client_handle;
        item.requested_parameters.sampling_interval = item_parameter.sampling_interval_ms;
        item.requested_parameters.queue_size = item_parameter.queue_size;
        item.requested_parameters.discard_oldest = true;

        let result = {
            let _guard = serial.lock().await;
            session
                .services
                .create_monitored_item(subscription_id, item)
                .await
        };

        let result = match result {
            Ok(result) if result.status_code.is_good() => result,
            Ok(result) => {
                tracing::warn!(
                    "Monitored item for {:?} rejected: {}",
                    alias,
                    result.status_code
                );
                continue;
            }
            Err(status) => {
                tracing::warn!("Monitored item for {:?} failed: {}", alias, status);
                continue;
            }
        };

        dispatch.lock().expect("dispatch map lock").insert(
            client_handle,
            DispatchContext {
                alias: alias.clone(),
                node: request.node.clone(),
                message_id: msg.message_id,
                endpoint: msg.endpoint.clone(),
            },
        );

        let mut state = session.subscriptions.lock().await;
        state.records.insert(
            alias.clone(),
            SubRecord {
                request: request.clone(),
                subscription_id,
                monitored_item_id: result.monitored_item_id,
                client_handle,
            },
        );
        created += 1;
        tracing::debug!(
            "Monitored item {} registered for alias {:?}",
            result.monitored_item_id,
            alias
        );
    }

    if created == 0 {
        let _guard = serial.lock().await;
        let _ = session.services.delete_subscription(subscription_id).await;
        return Err(AdapterError::NoValidResponses);
    }

    start_pump(session, serial).await;
    Ok(())
}

async fn modify(
    session: &Arc<SessionEntry>,
    serial: &Arc<tokio::sync::Mutex<()>>,
    msg: &RequestMessage,
) -> Result<(), AdapterError> {
    let request = msg.requests.first().ok_or(AdapterError::EmptyRequest)?;
    let parameter = request.subscription.clone().ok_or_else(|| {
        AdapterError::UnsupportedValue("subscription request without parameters".to_string())
    })?;
    let alias = request.effective_alias();

    let record = {
        let state = session.subscriptions.lock().await;
        state
            .records
            .get(&alias)
            .cloned()
            .ok_or(AdapterError::UnknownAlias(alias.clone()))?
    };

    {
        let _guard = serial.lock().await;
        session
            .services
            .modify_subscription(record.subscription_id, &parameter)
            .await
            .map_err(AdapterError::Service)?;
    }

    let item = MonitoredItemModifyRequest {
        monitored_item_id: record.monitored_item_id,
        requested_parameters: MonitoringParameters {
            client_handle: 1,
            sampling_interval: parameter.sampling_interval_ms,
            filter: ExtensionObject::null(),
            queue_size: parameter.queue_size,
            discard_oldest: true,
        },
    };
    let modified = {
        let _guard = serial.lock().await;
        session
            .services
            .modify_monitored_item(record.subscription_id, item)
            .await
            .map_err(AdapterError::Service)?
    };
    if !modified.status_code.is_good() {
        return Err(AdapterError::Service(modified.status_code));
    }

    let modes = {
        let _guard = serial.lock().await;
        session
            .services
            .set_monitoring_mode(
                record.subscription_id,
                MonitoringMode::Reporting,
                vec![record.monitored_item_id],
            )
            .await
            .map_err(AdapterError::Service)?
    };
    if let Some(status) = modes.iter().find(|s| !s.is_good()) {
        return Err(AdapterError::Service(*status));
    }

    let results = {
        let _guard = serial.lock().await;
        session
            .services
            .set_publishing_mode(vec![record.subscription_id], parameter.publishing_enabled)
            .await
            .map_err(AdapterError::Service)?
    };
    if let Some(status) = results.iter().find(|s| !s.is_good()) {
        return Err(AdapterError::Service(*status));
    }

    let mut state = session.subscriptions.lock().await;
    if let Some(stored) = state.records.get_mut(&alias) {
        stored.request.subscription = Some(parameter);
    }

    tracing::info!("Modified subscription for alias {:?}", alias);
    Ok(())
}

async fn delete(
    session: &Arc<SessionEntry>,
    serial: &Arc<tokio::sync::Mutex<()>>,
    msg: &RequestMessage,
) -> Result<(), AdapterError> {
    let request = msg.requests.first().ok_or(AdapterError::EmptyRequest)?;
    let alias = request.effective_alias();

    let record = {
        let state = session.subscriptions.lock().await;
        state
            .records
            .get(&alias)
            .cloned()
            .ok_or(AdapterError::UnknownAlias(alias.clone()))?
    };

    let status = {
        let _guard = serial.lock().await;
        session
            .services
            .delete_monitored_item(record.subscription_id, record.monitored_item_id)
            .await
            .map_err(AdapterError::Service)?
    };
    if !status.is_good() {
        tracing::warn!(
            "Delete of monitored item {} returned {}",
            record.monitored_item_id,
            status
        );
    }

    let (last_of_subscription, last_of_session) = {
        let mut state = session.subscriptions.lock().await;
        state.records.remove(&alias);
        state
            .dispatch
            .lock()
            .expect("dispatch map lock")
            .remove(&record.client_handle);
        let last_of_subscription = !state
            .records
            .values()
            .any(|r| r.subscription_id == record.subscription_id);
        (last_of_subscription, state.records.is_empty())
    };

    if last_of_subscription {
        let _guard = serial.lock().await;
        let _ = session
            .services
            .delete_subscription(record.subscription_id)
            .await;
        tracing::info!("Deleted subscription {}", record.subscription_id);
    }

    if last_of_session {
        stop_pump(session, serial).await;
    }

    Ok(())
}

async fn republish(
    session: &Arc<SessionEntry>,
    serial: &Arc<tokio::sync::Mutex<()>>,
    msg: &RequestMessage,
) -> Result<(), AdapterError> {
    let request = msg.requests.first().ok_or(AdapterError::EmptyRequest)?;
    let alias = request.effective_alias();

    let record = {
        let state = session.subscriptions.lock().await;
        state
            .records
            .get(&alias)
            .cloned()
            .ok_or(AdapterError::UnknownAlias(alias.clone()))?
    };

    let sequence = request
        .subscription
        .as_ref()
        .and_then(|p| p.retransmit_sequence_number)
        .unwrap_or(REPUBLISH_RETRANSMIT_SEQUENCE);

    let result = {
        let _guard = serial.lock().await;
        session
            .services
            .republish(record.subscription_id, sequence)
            .await
    };

    match result {
        Ok(()) => Ok(()),
        Err(status) if status == StatusCode::BadMessageNotAvailable => {
            tracing::warn!(
                "Republish for subscription {} had no message available",
                record.subscription_id
            );
            Ok(())
        }
        Err(status) => Err(AdapterError::Service(status)),
    }
}

/// Stop the pump and forget every record. Used by session teardown.
pub(crate) async fn drain(session: &Arc<SessionEntry>, serial: &Arc<tokio::sync::Mutex<()>>) {
    stop_pump(session, serial).await;
    let mut state = session.subscriptions.lock().await;
    state.records.clear();
    state.dispatch.lock().expect("dispatch map lock").clear();
}

/// Start the pump unless it is already running.
async fn start_pump(session: &Arc<SessionEntry>, serial: &Arc<tokio::sync::Mutex<()>>) {
    let mut state = session.subscriptions.lock().await;
    if state.pump.is_some() {
        return;
    }

    let token = CancellationToken::new();
    let worker_token = token.clone();
    let services = session.services.clone();
    let serial = serial.clone();
    let endpoint = session.endpoint.clone();

    let handle = tokio::spawn(async move {
        tracing::debug!("Publish pump started for {}", endpoint);
        let mut interval = tokio::time::interval(PUBLISH_TICK);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = worker_token.cancelled() => break,
                _ = interval.tick() => {
                    let _guard = serial.lock().await;
                    services.run_publish_cycle().await;
                }
            }
        }
        tracing::debug!("Publish pump stopped for {}", endpoint);
    });

    state.pump = Some(PumpHandle { token, handle });
}

/// Clear the running flag under the serialization lock, then join the task.
async fn stop_pump(session: &Arc<SessionEntry>, serial: &Arc<tokio::sync::Mutex<()>>) {
    let pump = {
        let _guard = serial.lock().await;
        let mut state = session.subscriptions.lock().await;
        state.pump.take()
    };
    if let Some(pump) = pump {
        pump.token.cancel();
        if let Err(e) = pump.handle.await {
            tracing::warn!("Publish pump did not stop cleanly: {}", e);
        }
    }
}

/// Build and enqueue one report from a data-change notification.
fn deliver_report(
    queue: &ReceiveQueue,
    dispatch: &DispatchMap,
    client_handle: u32,
    value: DataValue,
) {
    let context = {
        let map = dispatch.lock().expect("dispatch map lock");
        map.get(&client_handle).cloned()
    };
    let Some(context) = context else {
        tracing::warn!("Data change for unknown client handle {}", client_handle);
        return;
    };

    let timestamp = normalize_server_timestamp(value.server_timestamp.as_ref());
    let edge_value = value.value.as_ref().and_then(EdgeValue::from_variant);

    queue.enqueue(ResponseMessage::report(
        context.message_id,
        context.endpoint,
        NodeResponse {
            node: context.node,
            value: edge_value,
            timestamp: Some(timestamp),
        },
    ));
}

/// Normalize the stack epoch to Unix seconds plus microseconds, falling back
/// to wall clock when the server sent no timestamp.
fn normalize_server_timestamp(timestamp: Option<&opcua::types::DateTime>) -> EdgeTimestamp {
    let instant = match timestamp {
        Some(dt) => dt.as_chrono(),
        None => Utc::now(),
    };
    EdgeTimestamp {
        seconds: instant.timestamp(),
        microseconds: instant.timestamp_subsec_micros(),
    }
}
