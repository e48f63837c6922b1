//! Request and response messages exchanged with the application
//!
//! Inbound messages name one or more nodes and a command; outbound messages
//! carry aligned per-node responses, browse records, or an error, and are
//! delivered through the receive queue.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use opcua::types::{Guid, Identifier, NodeId};

use crate::value::EdgeValue;

/// Node identifier in one of the four OPC-UA identifier encodings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EdgeIdentifier {
    Numeric(u32),
    String(String),
    ByteString(Vec<u8>),
    /// Canonical 36-character GUID text
    Guid(String),
}

/// A node address: namespace index plus identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EdgeNodeId {
    pub namespace: u16,
    pub identifier: EdgeIdentifier,
}

impl EdgeNodeId {
    pub fn numeric(namespace: u16, id: u32) -> Self {
        Self {
            namespace,
            identifier: EdgeIdentifier::Numeric(id),
        }
    }

    pub fn string(namespace: u16, id: impl Into<String>) -> Self {
        Self {
            namespace,
            identifier: EdgeIdentifier::String(id.into()),
        }
    }

    pub fn byte_string(namespace: u16, id: Vec<u8>) -> Self {
        Self {
            namespace,
            identifier: EdgeIdentifier::ByteString(id),
        }
    }

    pub fn guid(namespace: u16, id: impl Into<String>) -> Self {
        Self {
            namespace,
            identifier: EdgeIdentifier::Guid(id.into()),
        }
    }

    /// Convert to the stack's node id type.
    pub fn to_node_id(&self) -> NodeId {
        match &self.identifier {
            EdgeIdentifier::Numeric(v) => NodeId::new(self.namespace, *v),
            EdgeIdentifier::String(s) => NodeId::new(self.namespace, s.clone()),
            EdgeIdentifier::ByteString(b) => {
                NodeId::new(self.namespace, opcua::types::ByteString::from(b.clone()))
            }
            EdgeIdentifier::Guid(g) => match Guid::from_str(g) {
                Ok(guid) => NodeId::new(self.namespace, guid),
                Err(_) => NodeId::new(self.namespace, g.clone()),
            },
        }
    }

    /// Convert from the stack's node id type.
    pub fn from_node_id(node_id: &NodeId) -> Self {
        let identifier = match &node_id.identifier {
            Identifier::Numeric(v) => EdgeIdentifier::Numeric(*v),
            Identifier::String(s) => EdgeIdentifier::String(s.as_ref().to_string()),
            Identifier::Guid(g) => EdgeIdentifier::Guid(g.to_string()),
            Identifier::ByteString(b) => {
                EdgeIdentifier::ByteString(b.value.clone().unwrap_or_default())
            }
        };
        Self {
            namespace: node_id.namespace,
            identifier,
        }
    }

    /// The single-character identifier type tag used in value aliases.
    pub fn type_char(&self) -> char {
        match self.identifier {
            EdgeIdentifier::Numeric(_) => 'I',
            EdgeIdentifier::String(_) => 'S',
            EdgeIdentifier::ByteString(_) => 'B',
            EdgeIdentifier::Guid(_) => 'G',
        }
    }

    /// Default value alias when the application does not supply one.
    pub fn default_alias(&self) -> String {
        let body = match &self.identifier {
            EdgeIdentifier::Numeric(v) => v.to_string(),
            EdgeIdentifier::String(s) => s.clone(),
            EdgeIdentifier::ByteString(b) => format!("{} bytes", b.len()),
            EdgeIdentifier::Guid(g) => g.clone(),
        };
        format!("{{{};{}}}{}", self.namespace, self.type_char(), body)
    }
}

impl fmt::Display for EdgeNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.default_alias())
    }
}

/// Commands the facade understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    Read,
    ReadSamplingInterval,
    Write,
    Browse,
    BrowseNext,
    BrowseView,
    MethodCall,
    Subscription,
}

/// Browse direction requested by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EdgeBrowseDirection {
    #[default]
    Forward,
    Inverse,
    Both,
}

/// Parameters for browse and browse-next commands.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrowseParameter {
    pub direction: EdgeBrowseDirection,
    /// Per-node maximum reference hint; 0 lets the server decide.
    pub max_references_per_node: u32,
    /// Continuation points to resume from, for the browse-next command.
    pub continuation_points: Vec<ContinuationPoint>,
}

/// Subscription lifecycle operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionOperation {
    Create,
    Modify,
    Delete,
    Republish,
}

/// Parameters for subscription create/modify requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionParameter {
    pub operation: SubscriptionOperation,
    pub sampling_interval_ms: f64,
    pub publishing_interval_ms: f64,
    pub lifetime_count: u32,
    pub max_keep_alive_count: u32,
    pub max_notifications_per_publish: u32,
    pub priority: u8,
    pub publishing_enabled: bool,
    pub queue_size: u32,
    /// Sequence number for republish; the wire default is used when absent.
    pub retransmit_sequence_number: Option<u32>,
}

impl Default for SubscriptionParameter {
    fn default() -> Self {
        Self {
            operation: SubscriptionOperation::Create,
            sampling_interval_ms: 500.0,
            publishing_interval_ms: 1000.0,
            lifetime_count: 10,
            max_keep_alive_count: 30,
            max_notifications_per_publish: 0,
            priority: 0,
            publishing_enabled: true,
            queue_size: 1,
            retransmit_sequence_number: None,
        }
    }
}

/// Input parameters for a method call: the owning object and the ordered,
/// typed input arguments. The request node names the method itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodParameter {
    pub object: EdgeNodeId,
    pub inputs: Vec<EdgeValue>,
}

/// One node-scoped request inside a request message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRequest {
    pub node: EdgeNodeId,
    /// Application-facing value alias; defaults to the stringified node id.
    pub alias: Option<String>,
    /// Value to write, for the write command.
    pub value: Option<EdgeValue>,
    pub method: Option<MethodParameter>,
    pub subscription: Option<SubscriptionParameter>,
}

impl NodeRequest {
    pub fn read(node: EdgeNodeId) -> Self {
        Self {
            node,
            alias: None,
            value: None,
            method: None,
            subscription: None,
        }
    }

    pub fn write(node: EdgeNodeId, value: EdgeValue) -> Self {
        Self {
            value: Some(value),
            ..Self::read(node)
        }
    }

    pub fn method(node: EdgeNodeId, object: EdgeNodeId, inputs: Vec<EdgeValue>) -> Self {
        Self {
            method: Some(MethodParameter { object, inputs }),
            ..Self::read(node)
        }
    }

    pub fn subscription(node: EdgeNodeId, parameter: SubscriptionParameter) -> Self {
        Self {
            subscription: Some(parameter),
            ..Self::read(node)
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Alias used for subscription keying and report dispatch.
    pub fn effective_alias(&self) -> String {
        self.alias
            .clone()
            .unwrap_or_else(|| self.node.default_alias())
    }
}

/// Inbound message: one command addressing one or more nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMessage {
    /// Monotonically assigned when 0.
    pub message_id: u32,
    pub endpoint: String,
    pub command: Command,
    pub requests: Vec<NodeRequest>,
    pub browse: Option<BrowseParameter>,
}

impl RequestMessage {
    pub fn new(endpoint: impl Into<String>, command: Command, requests: Vec<NodeRequest>) -> Self {
        Self {
            message_id: 0,
            endpoint: endpoint.into(),
            command,
            requests,
            browse: None,
        }
    }

    pub fn with_browse(mut self, browse: BrowseParameter) -> Self {
        self.browse = Some(browse);
        self
    }
}

/// Outbound message classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseKind {
    GeneralResponse,
    BrowseResponse,
    Report,
    Error,
}

/// Server timestamp normalized to the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeTimestamp {
    pub seconds: i64,
    pub microseconds: u32,
}

/// One node-scoped response inside a response message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeResponse {
    pub node: EdgeNodeId,
    pub value: Option<EdgeValue>,
    pub timestamp: Option<EdgeTimestamp>,
}

impl NodeResponse {
    /// Whether the payload is an array rather than a scalar.
    pub fn is_array(&self) -> bool {
        matches!(self.value, Some(EdgeValue::Array(_)))
    }
}

/// One reference discovered by the browse engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowseRecord {
    pub node: EdgeNodeId,
    pub browse_name: String,
    pub display_name: String,
    pub node_class: EdgeNodeClass,
    pub value_alias: String,
    /// `/`-joined browse names from the start node down to this reference.
    pub browse_path: String,
}

/// Node classes surfaced to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EdgeNodeClass {
    Object,
    Variable,
    Method,
    ObjectType,
    VariableType,
    ReferenceType,
    DataType,
    View,
    Unknown,
}

impl EdgeNodeClass {
    /// Convert from the stack's node class enum.
    pub fn from_stack(node_class: opcua::types::NodeClass) -> Self {
        match node_class {
            opcua::types::NodeClass::Object => EdgeNodeClass::Object,
            opcua::types::NodeClass::Variable => EdgeNodeClass::Variable,
            opcua::types::NodeClass::Method => EdgeNodeClass::Method,
            opcua::types::NodeClass::ObjectType => EdgeNodeClass::ObjectType,
            opcua::types::NodeClass::VariableType => EdgeNodeClass::VariableType,
            opcua::types::NodeClass::ReferenceType => EdgeNodeClass::ReferenceType,
            opcua::types::NodeClass::DataType => EdgeNodeClass::DataType,
            opcua::types::NodeClass::View => EdgeNodeClass::View,
            _ => EdgeNodeClass::Unknown,
        }
    }
}

impl fmt::Display for EdgeNodeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EdgeNodeClass::Object => "Object",
            EdgeNodeClass::Variable => "Variable",
            EdgeNodeClass::Method => "Method",
            EdgeNodeClass::ObjectType => "ObjectType",
            EdgeNodeClass::VariableType => "VariableType",
            EdgeNodeClass::ReferenceType => "ReferenceType",
            EdgeNodeClass::DataType => "DataType",
            EdgeNodeClass::View => "View",
            EdgeNodeClass::Unknown => "Unknown",
        };
        write!(f, "{}", name)
    }
}

/// Opaque browse continuation token plus the path prefix captured when the
/// server truncated the result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuationPoint {
    pub node: EdgeNodeId,
    pub continuation_point: Vec<u8>,
    /// Browse path at the truncation point, without a leading `/`.
    pub browse_prefix: String,
}

/// Details attached to an error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub reason: String,
    pub node: Option<EdgeNodeId>,
}

/// Outbound message delivered through the receive queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMessage {
    /// Id of the request message that produced this response.
    pub message_id: u32,
    pub endpoint: String,
    pub kind: ResponseKind,
    pub responses: Vec<NodeResponse>,
    pub browse_records: Vec<BrowseRecord>,
    pub continuation_points: Vec<ContinuationPoint>,
    pub error: Option<ErrorDetail>,
}

impl ResponseMessage {
    pub fn general(message_id: u32, endpoint: impl Into<String>, responses: Vec<NodeResponse>) -> Self {
        Self {
            message_id,
            endpoint: endpoint.into(),
            kind: ResponseKind::GeneralResponse,
            responses,
            browse_records: Vec::new(),
            continuation_points: Vec::new(),
            error: None,
        }
    }

    pub fn browse(message_id: u32, endpoint: impl Into<String>, records: Vec<BrowseRecord>) -> Self {
        Self {
            message_id,
            endpoint: endpoint.into(),
            kind: ResponseKind::BrowseResponse,
            responses: Vec::new(),
            browse_records: records,
            continuation_points: Vec::new(),
            error: None,
        }
    }

    pub fn continuation(
        message_id: u32,
        endpoint: impl Into<String>,
        point: ContinuationPoint,
    ) -> Self {
        Self {
            message_id,
            endpoint: endpoint.into(),
            kind: ResponseKind::BrowseResponse,
            responses: Vec::new(),
            browse_records: Vec::new(),
            continuation_points: vec![point],
            error: None,
        }
    }

    pub fn report(message_id: u32, endpoint: impl Into<String>, response: NodeResponse) -> Self {
        Self {
            message_id,
            endpoint: endpoint.into(),
            kind: ResponseKind::Report,
            responses: vec![response],
            browse_records: Vec::new(),
            continuation_points: Vec::new(),
            error: None,
        }
    }

    pub fn error(
        message_id: u32,
        endpoint: impl Into<String>,
        reason: impl Into<String>,
        node: Option<EdgeNodeId>,
    ) -> Self {
        Self {
            message_id,
            endpoint: endpoint.into(),
            kind: ResponseKind::Error,
            responses: Vec::new(),
            browse_records: Vec::new(),
            continuation_points: Vec::new(),
            error: Some(ErrorDetail {
                reason: reason.into(),
                node,
            }),
        }
    }

    /// Number of populated per-node responses.
    pub fn response_len(&self) -> usize {
        self.responses.iter().filter(|r| r.value.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_round_trip() {
        let node = EdgeNodeId::string(2, "Counter");
        let stack = node.to_node_id();
        assert_eq!(EdgeNodeId::from_node_id(&stack), node);

        let node = EdgeNodeId::numeric(0, 85);
        let stack = node.to_node_id();
        assert_eq!(EdgeNodeId::from_node_id(&stack), node);
    }

    #[test]
    fn test_default_alias_shapes() {
        assert_eq!(EdgeNodeId::numeric(1, 42).default_alias(), "{1;I}42");
        assert_eq!(EdgeNodeId::string(2, "Temp").default_alias(), "{2;S}Temp");
    }

    #[test]
    fn test_effective_alias_prefers_explicit() {
        let request = NodeRequest::read(EdgeNodeId::string(2, "Temp")).with_alias("Boiler/Temp");
        assert_eq!(request.effective_alias(), "Boiler/Temp");
    }

    #[test]
    fn test_message_round_trips_through_json() {
        let msg = RequestMessage::new(
            "opc.tcp://localhost:4840",
            Command::Read,
            vec![NodeRequest::read(EdgeNodeId::string(2, "Temp"))],
        );
        let text = serde_json::to_string(&msg).expect("serialize");
        let back: RequestMessage = serde_json::from_str(&text).expect("deserialize");
        assert_eq!(back.endpoint, msg.endpoint);
        assert_eq!(back.requests.len(), 1);
    }
}
