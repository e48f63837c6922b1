//! Adapter configuration and application callbacks

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::discovery::EdgeApplication;
use crate::message::ResponseMessage;

bitflags! {
    /// Application types the discovery filter accepts.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ApplicationTypes: u8 {
        const SERVER = 0x01;
        const CLIENT = 0x02;
        const CLIENT_AND_SERVER = 0x04;
        const DISCOVERY_SERVER = 0x08;
    }
}

impl Default for ApplicationTypes {
    fn default() -> Self {
        ApplicationTypes::all()
    }
}

/// Session and server lifecycle events surfaced to the status callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EdgeStatus {
    ClientStarted,
    StopClient,
    ServerStarted,
    StopServer,
    Connected,
    Disconnected,
}

impl fmt::Display for EdgeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EdgeStatus::ClientStarted => "client started",
            EdgeStatus::StopClient => "client stopped",
            EdgeStatus::ServerStarted => "server started",
            EdgeStatus::StopServer => "server stopped",
            EdgeStatus::Connected => "connected",
            EdgeStatus::Disconnected => "disconnected",
        };
        write!(f, "{}", name)
    }
}

/// Serializable part of the adapter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterSettings {
    /// Application name announced to servers
    pub application_name: String,
    /// Application URI announced to servers
    pub application_uri: String,
    /// Product URI announced to servers
    pub product_uri: String,
    /// Application types accepted by the discovery filter (bit mask)
    #[serde(skip, default)]
    pub supported_types: ApplicationTypes,
    /// Session timeout handed to the stack, milliseconds
    pub session_timeout_ms: u32,
    /// Session retry limit handed to the stack
    pub session_retry_limit: i32,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            application_name: "OPC-UA Edge Adapter".to_string(),
            application_uri: "urn:opcua-edge-adapter:instance".to_string(),
            product_uri: "urn:opcua-edge-adapter:product".to_string(),
            supported_types: ApplicationTypes::all(),
            session_timeout_ms: 30_000,
            session_retry_limit: 3,
        }
    }
}

pub type ResponseCallback = Arc<dyn Fn(ResponseMessage) + Send + Sync>;
pub type StatusCallback = Arc<dyn Fn(&str, EdgeStatus) + Send + Sync>;
pub type EndpointFoundCallback = Arc<dyn Fn(&EdgeApplication) + Send + Sync>;

/// The callback set registered at configure time.
///
/// The dispatcher owns each delivered message; a callback that wants to keep
/// data beyond its own body clones what it needs.
#[derive(Clone)]
pub struct AdapterCallbacks {
    /// General responses (read, write, method results)
    pub on_response: ResponseCallback,
    /// Browse responses and continuation points
    pub on_browse: ResponseCallback,
    /// Data-change reports
    pub on_report: ResponseCallback,
    /// Error responses
    pub on_error: ResponseCallback,
    /// Session and server lifecycle events
    pub on_status: StatusCallback,
    /// Validated application descriptions found during discovery
    pub on_endpoint_found: EndpointFoundCallback,
}

impl AdapterCallbacks {
    /// A callback set that drops everything. Useful as a starting point when
    /// an application only cares about a subset of the message kinds.
    pub fn noop() -> Self {
        Self {
            on_response: Arc::new(|_| {}),
            on_browse: Arc::new(|_| {}),
            on_report: Arc::new(|_| {}),
            on_error: Arc::new(|_| {}),
            on_status: Arc::new(|_, _| {}),
            on_endpoint_found: Arc::new(|_| {}),
        }
    }

    pub fn with_response(mut self, cb: impl Fn(ResponseMessage) + Send + Sync + 'static) -> Self {
        self.on_response = Arc::new(cb);
        self
    }

    pub fn with_browse(mut self, cb: impl Fn(ResponseMessage) + Send + Sync + 'static) -> Self {
        self.on_browse = Arc::new(cb);
        self
    }

    pub fn with_report(mut self, cb: impl Fn(ResponseMessage) + Send + Sync + 'static) -> Self {
        self.on_report = Arc::new(cb);
        self
    }

    pub fn with_error(mut self, cb: impl Fn(ResponseMessage) + Send + Sync + 'static) -> Self {
        self.on_error = Arc::new(cb);
        self
    }

    pub fn with_status(mut self, cb: impl Fn(&str, EdgeStatus) + Send + Sync + 'static) -> Self {
        self.on_status = Arc::new(cb);
        self
    }

    pub fn with_endpoint_found(
        mut self,
        cb: impl Fn(&EdgeApplication) + Send + Sync + 'static,
    ) -> Self {
        self.on_endpoint_found = Arc::new(cb);
        self
    }
}

/// Full adapter configuration: settings plus the callback set.
#[derive(Clone)]
pub struct AdapterConfig {
    pub settings: AdapterSettings,
    pub callbacks: AdapterCallbacks,
}

impl AdapterConfig {
    pub fn new(settings: AdapterSettings, callbacks: AdapterCallbacks) -> Self {
        Self { settings, callbacks }
    }
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            settings: AdapterSettings::default(),
            callbacks: AdapterCallbacks::noop(),
        }
    }
}
