//! Method invocation
//!
//! One request targets one method on one object, with ordered typed input
//! arguments. Outputs come back through the receive queue with the same
//! decoding as read results.

use opcua::types::{CallMethodRequest, StatusCode, Variant};

use crate::error::{status_code_name, AdapterError};
use crate::message::{NodeResponse, RequestMessage, ResponseMessage};
use crate::queue::ReceiveQueue;
use crate::session::SessionEntry;
use crate::value::EdgeValue;

pub(crate) async fn execute_call(
    session: &SessionEntry,
    queue: &ReceiveQueue,
    serial: &tokio::sync::Mutex<()>,
    msg: &RequestMessage,
) -> Result<(), AdapterError> {
    let request = msg.requests.first().ok_or(AdapterError::EmptyRequest)?;
    let method = request
        .method
        .as_ref()
        .ok_or_else(|| AdapterError::UnsupportedValue("method call without parameters".to_string()))?;

    let inputs: Result<Vec<Variant>, AdapterError> =
        method.inputs.iter().map(EdgeValue::to_variant).collect();
    let inputs = inputs?;

    let call = CallMethodRequest {
        object_id: method.object.to_node_id(),
        method_id: request.node.to_node_id(),
        input_arguments: if inputs.is_empty() { None } else { Some(inputs) },
    };

    tracing::debug!(
        "Calling method {} on object {} with {} inputs",
        request.node,
        method.object,
        method.inputs.len()
    );

    let result = {
        let _guard = serial.lock().await;
        session.services.call_method(call).await
    };

    let result = match result {
        Ok(result) => result,
        Err(status) => {
            queue.enqueue(ResponseMessage::error(
                msg.message_id,
                &msg.endpoint,
                format!("method call failed: {}", status_code_name(status)),
                Some(request.node.clone()),
            ));
            return Ok(());
        }
    };

    if !result.status_code.is_good() {
        queue.enqueue(ResponseMessage::error(
            msg.message_id,
            &msg.endpoint,
            format!(
                "method call failed: {}",
                status_code_name(result.status_code)
            ),
            Some(request.node.clone()),
        ));
        return Ok(());
    }

    let outputs = result.output_arguments.unwrap_or_default();
    let mut responses = Vec::with_capacity(outputs.len().max(1));
    for variant in &outputs {
        match EdgeValue::from_variant(variant) {
            Some(value) => responses.push(NodeResponse {
                node: request.node.clone(),
                value: Some(value),
                timestamp: None,
            }),
            None => {
                queue.enqueue(ResponseMessage::error(
                    msg.message_id,
                    &msg.endpoint,
                    format!(
                        "method output could not be decoded: {}",
                        status_code_name(StatusCode::BadDataEncodingUnsupported)
                    ),
                    Some(request.node.clone()),
                ));
                return Ok(());
            }
        }
    }

    // A method with no outputs still confirms completion with an empty
    // aligned response.
    queue.enqueue(ResponseMessage::general(
        msg.message_id,
        &msg.endpoint,
        responses,
    ));

    Ok(())
}
