//! Adapter error type and OPC-UA status code translation
//!
//! Local precondition failures surface synchronously from the facade verbs;
//! everything else is queued as an error response so the application sees it
//! in delivery order.

use opcua::types::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("already connected to {0}")]
    AlreadyConnected(String),

    #[error("connect failed for {0}")]
    ConnectFailed(String),

    #[error("no session exists for endpoint {0}")]
    UnknownSession(String),

    #[error("endpoint url {0:?} could not be parsed")]
    InvalidEndpoint(String),

    #[error("request message carries no node requests")]
    EmptyRequest,

    #[error("browse request names {0} start nodes, more than the supported maximum")]
    TooManyBrowseTargets(usize),

    #[error("request cancelled by client: duplicate value alias {0:?}")]
    DuplicateAlias(String),

    #[error("value alias {0:?} is already subscribed on this session")]
    AlreadySubscribed(String),

    #[error("unknown value alias {0:?}")]
    UnknownAlias(String),

    #[error("subscription id {0} collides with an existing subscription")]
    SubscriptionIdCollision(u32),

    #[error("no valid responses in batch")]
    NoValidResponses,

    #[error("value {0} cannot be converted to a wire variant")]
    UnsupportedValue(String),

    #[error("a server is already running for this adapter")]
    ServerAlreadyRunning,

    #[error("no server is running for this adapter")]
    ServerNotRunning,

    #[error("invalid response at position({index}): {}", status_code_name(*.status))]
    Position { index: usize, status: StatusCode },

    #[error("service call failed: {}", status_code_name(*.0))]
    Service(StatusCode),
}

impl AdapterError {
    /// Map the error onto the closest OPC-UA status code, for applications
    /// that key their handling off the wire-level taxonomy.
    pub fn status_code(&self) -> StatusCode {
        match self {
            AdapterError::AlreadyConnected(_) => StatusCode::BadTcpEndpointUrlInvalid,
            AdapterError::ConnectFailed(_) => StatusCode::BadConnectionRejected,
            AdapterError::UnknownSession(_) => StatusCode::BadSessionIdInvalid,
            AdapterError::InvalidEndpoint(_) => StatusCode::BadTcpEndpointUrlInvalid,
            AdapterError::EmptyRequest => StatusCode::BadNothingToDo,
            AdapterError::TooManyBrowseTargets(_) => StatusCode::BadTooManyOperations,
            AdapterError::DuplicateAlias(_) => StatusCode::BadRequestCancelledByClient,
            AdapterError::AlreadySubscribed(_) => StatusCode::BadRequestCancelledByClient,
            AdapterError::UnknownAlias(_) => StatusCode::BadNoMatch,
            AdapterError::SubscriptionIdCollision(_) => StatusCode::BadSubscriptionIdInvalid,
            AdapterError::NoValidResponses => StatusCode::BadNoDataAvailable,
            AdapterError::UnsupportedValue(_) => StatusCode::BadTypeMismatch,
            AdapterError::ServerAlreadyRunning => StatusCode::BadInvalidState,
            AdapterError::ServerNotRunning => StatusCode::BadInvalidState,
            AdapterError::Position { status, .. } => *status,
            AdapterError::Service(status) => *status,
        }
    }
}

/// Human-readable name for an OPC-UA status code.
///
/// Covers the codes this adapter actually encounters; anything else falls
/// back to the severity derived from the two high bits.
pub fn status_code_name(code: StatusCode) -> String {
    let msg = match code.bits() {
        0x0000_0000 => Some("Good"),

        0x4000_0000 => Some("Uncertain"),
        0x4001_0000 => Some("Uncertain - Initial Value"),

        0x8000_0000 => Some("Bad - Unexpected Error"),
        0x8001_0000 => Some("Bad - Internal Error"),
        0x8002_0000 => Some("Bad - Out Of Memory"),
        0x8004_0000 => Some("Bad - Communication Error"),
        0x8008_0000 => Some("Bad - Request Too Large"),
        0x800B_0000 => Some("Bad - Timeout"),
        0x800C_0000 => Some("Bad - Service Unsupported"),
        0x800E_0000 => Some("Bad - Server Not Connected"),
        0x8010_0000 => Some("Bad - Nothing To Do"),
        0x8011_0000 => Some("Bad - Too Many Operations"),
        0x8012_0000 => Some("Bad - Too Many Monitored Items"),
        0x8025_0000 => Some("Bad - Secure Channel ID Invalid"),
        0x8028_0000 => Some("Bad - Session ID Invalid"),
        0x8029_0000 => Some("Bad - Session Closed"),
        0x802A_0000 => Some("Bad - Session Not Activated"),
        0x802B_0000 => Some("Bad - Subscription ID Invalid"),
        0x802D_0000 => Some("Bad - Message Not Available"),
        0x8089_0000 => Some("Bad - Node ID Invalid"),
        0x808A_0000 => Some("Bad - Node ID Unknown"),
        0x808B_0000 => Some("Bad - Attribute ID Invalid"),
        0x8090_0000 => Some("Bad - Not Readable"),
        0x8091_0000 => Some("Bad - Not Writable"),
        0x8092_0000 => Some("Bad - Out Of Range"),
        0x8093_0000 => Some("Bad - Not Supported"),
        0x8094_0000 => Some("Bad - Not Found"),
        0x8097_0000 => Some("Bad - Monitoring Mode Invalid"),
        0x8098_0000 => Some("Bad - Monitored Item ID Invalid"),
        0x80A8_0000 => Some("Bad - Continuation Point Invalid"),
        0x80A9_0000 => Some("Bad - No Continuation Points"),
        0x80AA_0000 => Some("Bad - Reference Type ID Invalid"),
        0x80AB_0000 => Some("Bad - Browse Direction Invalid"),
        0x80AC_0000 => Some("Bad - Node Not In View"),
        0x80AE_0000 => Some("Bad - Server URI Invalid"),
        0x80BD_0000 => Some("Bad - Request Cancelled By Client"),
        0x80C3_0000 => Some("Bad - Node Class Invalid"),
        0x80C4_0000 => Some("Bad - Browse Name Invalid"),
        _ => None,
    };

    if let Some(m) = msg {
        return m.to_string();
    }

    let severity = match code.bits() >> 30 {
        0 => "Good",
        1 => "Uncertain",
        2 | 3 => "Bad",
        _ => "Unknown",
    };

    format!("{} (0x{:08X})", severity, code.bits())
}
