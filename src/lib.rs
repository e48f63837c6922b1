//! OPC-UA Edge Adapter
//!
//! An in-process adapter over the `async-opcua` stack. Applications register
//! a callback set, connect client sessions by endpoint URL, and drive reads,
//! writes, method calls, recursive browses, and live data subscriptions
//! through a single facade. Results flow back asynchronously through a
//! receive queue that preserves per-producer ordering; discovery results
//! return directly.
//!
//! ```no_run
//! use std::sync::Arc;
//! use opcua_edge_adapter::{
//!     AdapterCallbacks, AdapterConfig, AdapterSettings, Command, EdgeNodeId, NodeRequest,
//!     OpcUaAdapter, RequestMessage,
//! };
//!
//! # async fn demo() -> Result<(), opcua_edge_adapter::AdapterError> {
//! let callbacks = AdapterCallbacks::noop()
//!     .with_response(|msg| println!("response: {:?}", msg))
//!     .with_report(|msg| println!("report: {:?}", msg));
//! let adapter = OpcUaAdapter::configure(AdapterConfig::new(
//!     AdapterSettings::default(),
//!     callbacks,
//! ));
//!
//! adapter.connect_client("opc.tcp://localhost:4840").await?;
//! adapter
//!     .read_node(RequestMessage::new(
//!         "opc.tcp://localhost:4840",
//!         Command::Read,
//!         vec![NodeRequest::read(EdgeNodeId::string(2, "Counter"))],
//!     ))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub use opcua;

mod adapter;
mod attributes;
mod browse;
mod config;
mod discovery;
mod error;
mod message;
mod method;
mod queue;
mod server;
mod session;
mod stack;
mod subscription;
mod value;

pub use adapter::OpcUaAdapter;
pub use browse::{MAX_BROWSE_REQUEST_NODES, MAX_CONTINUATION_POINT_LENGTH, MAX_NAME_LENGTH};
pub use config::{
    AdapterCallbacks, AdapterConfig, AdapterSettings, ApplicationTypes, EdgeStatus,
    EndpointFoundCallback, ResponseCallback, StatusCallback,
};
pub use discovery::{EdgeApplication, EdgeEndpoint, EdgeSecurityMode, EdgeTokenKind};
pub use error::{status_code_name, AdapterError};
pub use message::{
    BrowseParameter, BrowseRecord, Command, ContinuationPoint, EdgeBrowseDirection,
    EdgeIdentifier, EdgeNodeClass, EdgeNodeId, EdgeTimestamp, ErrorDetail, MethodParameter,
    NodeRequest, NodeResponse, RequestMessage, ResponseKind, ResponseMessage,
    SubscriptionOperation, SubscriptionParameter,
};
pub use server::ServerRuntime;
pub use stack::{DataChangeHandler, StackConnector, StackServices};
pub use subscription::{PUBLISH_TICK, REPUBLISH_RETRANSMIT_SEQUENCE};
pub use value::{EdgeValue, GUID_TEXT_LENGTH};
