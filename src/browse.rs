//! Recursive browse engine
//!
//! Browses depth-first from a set of start nodes, validating every returned
//! reference, cutting cycles by browse name, synthesizing value aliases and
//! `/`-joined browse paths, and forwarding continuation points so the
//! application can resume truncated results with browse-next.

use async_recursion::async_recursion;

use opcua::types::{
    AttributeId, BrowseDescription, BrowseDirection, BrowseResult, BrowseResultMask, ByteString,
    NodeId, ObjectId, ReadValueId, ReferenceDescription, ReferenceTypeId, StatusCode, Variant,
};

use crate::error::{status_code_name, AdapterError};
use crate::message::{
    BrowseRecord, ContinuationPoint, EdgeBrowseDirection, EdgeIdentifier, EdgeNodeClass,
    EdgeNodeId, RequestMessage, ResponseMessage,
};
use crate::queue::ReceiveQueue;
use crate::session::SessionEntry;

/// Maximum start nodes accepted in one multi-node browse request.
pub const MAX_BROWSE_REQUEST_NODES: usize = 10;

/// Continuation points longer than this are a protocol violation.
pub const MAX_CONTINUATION_POINT_LENGTH: usize = 1000;

/// Browse and display names longer than this are a protocol violation.
pub const MAX_NAME_LENGTH: usize = 1000;

// Object | Variable | Method | View
const BROWSE_NODE_CLASS_MASK: u32 = 0x87;
// Object | View
const VIEW_NODE_CLASS_MASK: u32 = 0x81;

struct BrowseTarget {
    node_id: NodeId,
    browse_name: String,
}

pub(crate) struct BrowseEngine<'a> {
    session: &'a SessionEntry,
    queue: &'a ReceiveQueue,
    serial: &'a tokio::sync::Mutex<()>,
    message_id: u32,
    endpoint: &'a str,
    direction: EdgeBrowseDirection,
    max_references: u32,
    node_class_mask: u32,
    collect_views: bool,
    /// Frames of the current descent: (node id, browse name)
    path: Vec<(NodeId, String)>,
    views: Vec<BrowseRecord>,
}

/// Execute a browse request over its start nodes.
pub(crate) async fn execute_browse(
    session: &SessionEntry,
    queue: &ReceiveQueue,
    serial: &tokio::sync::Mutex<()>,
    msg: &RequestMessage,
) -> Result<(), AdapterError> {
    let mut targets = start_targets(msg)?;
    resolve_start_names(session, serial, &mut targets).await;
    let mut engine = BrowseEngine::new(session, queue, serial, msg, BROWSE_NODE_CLASS_MASK, false);
    engine.browse_level(targets).await
}

/// Execute a views browse: only Object and View node classes are followed
/// and encountered views are delivered as one accumulated response.
pub(crate) async fn execute_browse_views(
    session: &SessionEntry,
    queue: &ReceiveQueue,
    serial: &tokio::sync::Mutex<()>,
    msg: &RequestMessage,
) -> Result<(), AdapterError> {
    let mut targets = start_targets(msg)?;
    resolve_start_names(session, serial, &mut targets).await;
    let mut engine = BrowseEngine::new(session, queue, serial, msg, VIEW_NODE_CLASS_MASK, true);
    engine.browse_level(targets).await?;

    let views = std::mem::take(&mut engine.views);
    tracing::debug!("Views browse found {} view nodes", views.len());
    queue.enqueue(ResponseMessage::browse(msg.message_id, &msg.endpoint, views));
    Ok(())
}

/// Resume truncated browses from their continuation points.
pub(crate) async fn execute_browse_next(
    session: &SessionEntry,
    queue: &ReceiveQueue,
    serial: &tokio::sync::Mutex<()>,
    msg: &RequestMessage,
) -> Result<(), AdapterError> {
    let points: Vec<ContinuationPoint> = msg
        .browse
        .as_ref()
        .map(|b| b.continuation_points.clone())
        .unwrap_or_default();
    if points.is_empty() {
        return Err(AdapterError::EmptyRequest);
    }

    let byte_points: Vec<ByteString> = points
        .iter()
        .map(|p| ByteString::from(p.continuation_point.clone()))
        .collect();

    let mut engine = BrowseEngine::new(session, queue, serial, msg, BROWSE_NODE_CLASS_MASK, false);

    let results = {
        let _guard = serial.lock().await;
        session.services.browse_next(byte_points).await
    };
    let results = match results {
        Ok(results) => results,
        Err(status) => {
            queue.enqueue(ResponseMessage::error(
                msg.message_id,
                &msg.endpoint,
                format!("browse next failed: {}", status_code_name(status)),
                None,
            ));
            return Ok(());
        }
    };

    for (point, result) in points.iter().zip(results.iter()) {
        // Rebuild the descent frames captured when the result was truncated.
        engine.path = point
            .browse_prefix
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|name| (NodeId::null(), name.to_string()))
            .collect();
        if let Some(last) = engine.path.last_mut() {
            last.0 = point.node.to_node_id();
        }
        let target = BrowseTarget {
            node_id: point.node.to_node_id(),
            browse_name: engine
                .path
                .last()
                .map(|(_, name)| name.clone())
                .unwrap_or_else(|| point.node.default_alias()),
        };
        engine.process_result(&target, result).await?;
    }

    Ok(())
}

fn start_targets(msg: &RequestMessage) -> Result<Vec<BrowseTarget>, AdapterError> {
    if msg.requests.len() > MAX_BROWSE_REQUEST_NODES {
        return Err(AdapterError::TooManyBrowseTargets(msg.requests.len()));
    }
    if msg.requests.is_empty() {
        // Default start is the root folder.
        return Ok(vec![BrowseTarget {
            node_id: ObjectId::RootFolder.into(),
            browse_name: "Root".to_string(),
        }]);
    }
    // The alias is a placeholder name until the server-side browse name is
    // resolved; the cycle cut compares browse names only.
    Ok(msg
        .requests
        .iter()
        .map(|r| BrowseTarget {
            node_id: r.node.to_node_id(),
            browse_name: r.effective_alias(),
        })
        .collect())
}

/// Replace placeholder start-node names with the BrowseName attribute the
/// server reports, so root frames compare like recursive frames. Nodes the
/// server cannot name keep their placeholder.
async fn resolve_start_names(
    session: &SessionEntry,
    serial: &tokio::sync::Mutex<()>,
    targets: &mut [BrowseTarget],
) {
    let read_ids: Vec<ReadValueId> = targets
        .iter()
        .map(|t| ReadValueId::new(t.node_id.clone(), AttributeId::BrowseName))
        .collect();

    let results = {
        let _guard = serial.lock().await;
        session.services.read(read_ids).await
    };
    let results = match results {
        Ok(results) => results,
        Err(status) => {
            tracing::debug!(
                "Browse name lookup failed: {}",
                status_code_name(status)
            );
            return;
        }
    };

    for (target, result) in targets.iter_mut().zip(results.iter()) {
        if !result.status.map(|s| s.is_good()).unwrap_or(true) {
            continue;
        }
        if let Some(Variant::QualifiedName(name)) = result.value.as_ref() {
            let name = name.name.as_ref();
            if !name.is_empty() {
                target.browse_name = name.to_string();
            }
        }
    }
}

impl<'a> BrowseEngine<'a> {
    fn new(
        session: &'a SessionEntry,
        queue: &'a ReceiveQueue,
        serial: &'a tokio::sync::Mutex<()>,
        msg: &'a RequestMessage,
        node_class_mask: u32,
        collect_views: bool,
    ) -> Self {
        let (direction, max_references) = msg
            .browse
            .as_ref()
            .map(|b| (b.direction, b.max_references_per_node))
            .unwrap_or_default();
        Self {
            session,
            queue,
            serial,
            message_id: msg.message_id,
            endpoint: msg.endpoint.as_str(),
            direction,
            max_references,
            node_class_mask,
            collect_views,
            path: Vec::new(),
            views: Vec::new(),
        }
    }

    #[async_recursion]
    async fn browse_level(&mut self, targets: Vec<BrowseTarget>) -> Result<(), AdapterError> {
        if targets.is_empty() {
            return Ok(());
        }

        // Stay under the multi-node request cap on every level.
        for chunk in targets.chunks(MAX_BROWSE_REQUEST_NODES) {
            let descriptions: Vec<BrowseDescription> = chunk
                .iter()
                .map(|t| BrowseDescription {
                    node_id: t.node_id.clone(),
                    browse_direction: stack_direction(self.direction),
                    reference_type_id: ReferenceTypeId::HierarchicalReferences.into(),
                    include_subtypes: true,
                    node_class_mask: self.node_class_mask,
                    result_mask: BrowseResultMask::All as u32,
                })
                .collect();

            let results = {
                let _guard = self.serial.lock().await;
                self.session
                    .services
                    .browse(descriptions, self.max_references)
                    .await
            };
            let results = match results {
                Ok(results) => results,
                Err(status) => {
                    self.queue.enqueue(ResponseMessage::error(
                        self.message_id,
                        self.endpoint,
                        format!("browse failed: {}", status_code_name(status)),
                        None,
                    ));
                    return Ok(());
                }
            };

            if !results.is_empty()
                && results
                    .iter()
                    .all(|r| r.status_code == StatusCode::BadNodeIdUnknown)
            {
                self.queue.enqueue(ResponseMessage::error(
                    self.message_id,
                    self.endpoint,
                    "node id unknown for all browse results",
                    None,
                ));
                continue;
            }

            for (target, result) in chunk.iter().zip(results.iter()) {
                self.process_result(target, result).await?;
            }
        }

        Ok(())
    }

    #[async_recursion]
    async fn process_result(
        &mut self,
        target: &BrowseTarget,
        result: &BrowseResult,
    ) -> Result<(), AdapterError> {
        let pushed = self
            .path
            .last()
            .map(|(id, _)| id != &target.node_id)
            .unwrap_or(true);
        if pushed {
            self.path
                .push((target.node_id.clone(), target.browse_name.clone()));
        }
        let outcome = self.process_result_inner(target, result).await;
        if pushed {
            self.path.pop();
        }
        outcome
    }

    async fn process_result_inner(
        &mut self,
        target: &BrowseTarget,
        result: &BrowseResult,
    ) -> Result<(), AdapterError> {
        if !result.status_code.is_good() {
            self.queue.enqueue(ResponseMessage::error(
                self.message_id,
                self.endpoint,
                format!(
                    "browse of {} failed: {}",
                    target.browse_name,
                    status_code_name(result.status_code)
                ),
                Some(EdgeNodeId::from_node_id(&target.node_id)),
            ));
            return Ok(());
        }

        let cp_bytes: &[u8] = result.continuation_point.as_ref();
        if cp_bytes.len() >= MAX_CONTINUATION_POINT_LENGTH {
            self.queue.enqueue(ResponseMessage::error(
                self.message_id,
                self.endpoint,
                "continuation point exceeds the length cap",
                Some(EdgeNodeId::from_node_id(&target.node_id)),
            ));
            return Ok(());
        }

        let references: &[ReferenceDescription] = result.references.as_deref().unwrap_or(&[]);
        if !cp_bytes.is_empty() && references.is_empty() {
            self.queue.enqueue(ResponseMessage::error(
                self.message_id,
                self.endpoint,
                "continuation point present but no references returned",
                Some(EdgeNodeId::from_node_id(&target.node_id)),
            ));
            return Ok(());
        }

        let mut recurse = Vec::new();
        for reference in references {
            if let Err(reason) = self.validate_reference(reference) {
                self.queue.enqueue(ResponseMessage::error(
                    self.message_id,
                    self.endpoint,
                    reason,
                    Some(EdgeNodeId::from_node_id(&reference.node_id.node_id)),
                ));
                continue;
            }

            let browse_name = reference.browse_name.name.as_ref().to_string();
            if self.path.iter().any(|(_, name)| name == &browse_name) {
                tracing::debug!("Cycle cut: {} already on the browse path", browse_name);
                continue;
            }

            let node = EdgeNodeId::from_node_id(&reference.node_id.node_id);
            let node_class = EdgeNodeClass::from_stack(reference.node_class);
            let display_name = reference.display_name.text.as_ref().to_string();
            let record = BrowseRecord {
                value_alias: value_alias(&node, &browse_name, &display_name),
                browse_path: self.path_for(&browse_name),
                node,
                browse_name: browse_name.clone(),
                display_name,
                node_class,
            };

            if self.collect_views {
                if node_class == EdgeNodeClass::View {
                    self.views.push(record);
                }
            } else {
                self.queue.enqueue(ResponseMessage::browse(
                    self.message_id,
                    self.endpoint,
                    vec![record],
                ));
            }

            if node_class != EdgeNodeClass::Variable {
                recurse.push(BrowseTarget {
                    node_id: reference.node_id.node_id.clone(),
                    browse_name,
                });
            }
        }

        if !cp_bytes.is_empty() {
            let point = ContinuationPoint {
                node: EdgeNodeId::from_node_id(&target.node_id),
                continuation_point: cp_bytes.to_vec(),
                browse_prefix: self.current_prefix(),
            };
            self.queue.enqueue(ResponseMessage::continuation(
                self.message_id,
                self.endpoint,
                point,
            ));
        }

        self.browse_level(recurse).await
    }

    /// Validate one received reference against the wire contract.
    fn validate_reference(&self, reference: &ReferenceDescription) -> Result<(), String> {
        match self.direction {
            EdgeBrowseDirection::Forward if !reference.is_forward => {
                return Err("inverse reference returned for a forward browse".to_string());
            }
            EdgeBrowseDirection::Inverse if reference.is_forward => {
                return Err("forward reference returned for an inverse browse".to_string());
            }
            _ => {}
        }

        let browse_name = reference.browse_name.name.as_ref();
        if browse_name.is_empty() || browse_name.len() >= MAX_NAME_LENGTH {
            return Err("reference browse name is empty or too long".to_string());
        }

        let class_bit = reference.node_class as u32;
        if class_bit & self.node_class_mask == 0 {
            return Err(format!(
                "node class {:?} outside the requested mask",
                reference.node_class
            ));
        }

        let display_name = reference.display_name.text.as_ref();
        if display_name.is_empty() || display_name.len() >= MAX_NAME_LENGTH {
            return Err("reference display name is empty or too long".to_string());
        }

        if reference.node_id.node_id.is_null() {
            return Err("reference target node id is null".to_string());
        }
        if reference.node_id.server_index != 0 {
            return Err("reference target lives on a remote server".to_string());
        }
        if reference.reference_type_id.is_null() {
            return Err("reference type id is null".to_string());
        }

        let needs_type_definition = matches!(
            reference.node_class,
            opcua::types::NodeClass::Object | opcua::types::NodeClass::Variable
        );
        if needs_type_definition && reference.type_definition.node_id.is_null() {
            return Err("object or variable reference without a type definition".to_string());
        }

        Ok(())
    }

    /// Browse path for a reference found under the current frames.
    fn path_for(&self, browse_name: &str) -> String {
        let mut path = String::new();
        for (_, name) in &self.path {
            path.push('/');
            path.push_str(name);
        }
        path.push('/');
        path.push_str(browse_name);
        path
    }

    /// Current frames joined without a leading slash, as captured alongside
    /// a continuation point.
    fn current_prefix(&self) -> String {
        self.path
            .iter()
            .map(|(_, name)| name.as_str())
            .collect::<Vec<_>>()
            .join("/")
    }
}

fn stack_direction(direction: EdgeBrowseDirection) -> BrowseDirection {
    match direction {
        EdgeBrowseDirection::Forward => BrowseDirection::Forward,
        EdgeBrowseDirection::Inverse => BrowseDirection::Inverse,
        EdgeBrowseDirection::Both => BrowseDirection::Both,
    }
}

/// Application-visible alias for a browsed node.
///
/// String identifiers carry a version tag taken from a `v=<n>` display name
/// prefix; every other identifier kind is tagged with its type character.
pub(crate) fn value_alias(node: &EdgeNodeId, browse_name: &str, display_name: &str) -> String {
    match &node.identifier {
        EdgeIdentifier::String(_) => {
            let version = display_name
                .strip_prefix("v=")
                .map(|rest| {
                    let digits: String =
                        rest.chars().take_while(|c| c.is_ascii_digit()).collect();
                    digits.parse::<u32>().unwrap_or(0)
                })
                .unwrap_or(0);
            format!("{{{};S;v={}}}{}", node.namespace, version, browse_name)
        }
        _ => format!(
            "{{{};{}}}{}",
            node.namespace,
            node.type_char(),
            browse_name
        ),
    }
}
