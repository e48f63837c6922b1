//! Batched read and write dispatch
//!
//! One application request addressing N nodes becomes one stack service
//! call. Per-node failures are isolated: the failing position becomes an
//! error response and the surviving positions are aggregated into a single
//! general response.

use opcua::types::{AttributeId, ReadValueId, StatusCode, WriteValue};

use crate::error::{status_code_name, AdapterError};
use crate::message::{NodeResponse, RequestMessage, ResponseMessage};
use crate::queue::ReceiveQueue;
use crate::session::SessionEntry;
use crate::value::EdgeValue;

/// Execute a read request. `sampling` selects the MinimumSamplingInterval
/// attribute instead of Value.
pub(crate) async fn execute_read(
    session: &SessionEntry,
    queue: &ReceiveQueue,
    serial: &tokio::sync::Mutex<()>,
    msg: &RequestMessage,
    sampling: bool,
) -> Result<(), AdapterError> {
    let read_ids: Vec<ReadValueId> = msg
        .requests
        .iter()
        .map(|r| {
            let node_id = r.node.to_node_id();
            if sampling {
                ReadValueId::new(node_id, AttributeId::MinimumSamplingInterval)
            } else {
                ReadValueId::from(node_id)
            }
        })
        .collect();

    tracing::debug!(
        "Reading {} nodes from {} (sampling: {})",
        read_ids.len(),
        msg.endpoint,
        sampling
    );

    let results = {
        let _guard = serial.lock().await;
        session.services.read(read_ids).await
    };

    let results = match results {
        Ok(results) => results,
        Err(status) => {
            queue.enqueue(ResponseMessage::error(
                msg.message_id,
                &msg.endpoint,
                format!("read failed: {}", status_code_name(status)),
                None,
            ));
            return Ok(());
        }
    };

    let single = msg.requests.len() == 1;
    let mut responses = Vec::new();

    for (i, request) in msg.requests.iter().enumerate() {
        let result = results.get(i);
        let status = result
            .and_then(|r| r.status)
            .unwrap_or(StatusCode::Good);

        if result.is_none() || !status.is_good() {
            let status = if result.is_none() {
                StatusCode::BadNoDataAvailable
            } else {
                status
            };
            let err = AdapterError::Position { index: i, status };
            tracing::warn!("Read of {} failed: {}", request.node, err);
            queue.enqueue(ResponseMessage::error(
                msg.message_id,
                &msg.endpoint,
                err.to_string(),
                Some(request.node.clone()),
            ));
            if single {
                return Ok(());
            }
            continue;
        }

        let value = result
            .and_then(|r| r.value.as_ref())
            .and_then(EdgeValue::from_variant);
        match value {
            Some(value) => responses.push(NodeResponse {
                node: request.node.clone(),
                value: Some(value),
                timestamp: None,
            }),
            None => {
                let err = AdapterError::Position {
                    index: i,
                    status: StatusCode::BadDataEncodingUnsupported,
                };
                queue.enqueue(ResponseMessage::error(
                    msg.message_id,
                    &msg.endpoint,
                    err.to_string(),
                    Some(request.node.clone()),
                ));
                if single {
                    return Ok(());
                }
            }
        }
    }

    if responses.is_empty() {
        queue.enqueue(ResponseMessage::error(
            msg.message_id,
            &msg.endpoint,
            AdapterError::NoValidResponses.to_string(),
            None,
        ));
    } else {
        queue.enqueue(ResponseMessage::general(
            msg.message_id,
            &msg.endpoint,
            responses,
        ));
    }

    Ok(())
}

/// Execute a write request. Every request entry must carry a typed value;
/// a value that cannot be encoded is a synchronous precondition failure.
pub(crate) async fn execute_write(
    session: &SessionEntry,
    queue: &ReceiveQueue,
    serial: &tokio::sync::Mutex<()>,
    msg: &RequestMessage,
) -> Result<(), AdapterError> {
    let mut writes = Vec::with_capacity(msg.requests.len());
    for request in &msg.requests {
        let value = request
            .value
            .as_ref()
            .ok_or_else(|| AdapterError::UnsupportedValue("write without a value".to_string()))?;
        let variant = value.to_variant()?;
        writes.push(WriteValue::value_attr(request.node.to_node_id(), variant));
    }

    tracing::debug!("Writing {} nodes to {}", writes.len(), msg.endpoint);

    let results = {
        let _guard = serial.lock().await;
        session.services.write(writes).await
    };

    let results = match results {
        Ok(results) => results,
        Err(status) => {
            queue.enqueue(ResponseMessage::error(
                msg.message_id,
                &msg.endpoint,
                format!("write failed: {}", status_code_name(status)),
                None,
            ));
            return Ok(());
        }
    };

    let single = msg.requests.len() == 1;
    let mut responses = Vec::new();

    for (i, request) in msg.requests.iter().enumerate() {
        let status = results.get(i).copied().unwrap_or(StatusCode::BadNoDataAvailable);
        if status.is_good() {
            // Echo the written value so the aggregate aligns with the request.
            responses.push(NodeResponse {
                node: request.node.clone(),
                value: request.value.clone(),
                timestamp: None,
            });
        } else {
            let err = AdapterError::Position { index: i, status };
            tracing::warn!("Write of {} failed: {}", request.node, err);
            queue.enqueue(ResponseMessage::error(
                msg.message_id,
                &msg.endpoint,
                err.to_string(),
                Some(request.node.clone()),
            ));
            if single {
                return Ok(());
            }
        }
    }

    if responses.is_empty() {
        queue.enqueue(ResponseMessage::error(
            msg.message_id,
            &msg.endpoint,
            AdapterError::NoValidResponses.to_string(),
            None,
        ));
    } else {
        queue.enqueue(ResponseMessage::general(
            msg.message_id,
            &msg.endpoint,
            responses,
        ));
    }

    Ok(())
}
