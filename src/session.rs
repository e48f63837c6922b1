//! Session registry
//!
//! One live stack session per canonical `host:port` key. The registry owns
//! the sessions; the subscription engine shares them by reference and the
//! publish pump never outlives its session.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use url::Url;

use crate::error::AdapterError;
use crate::stack::StackServices;
use crate::subscription::SubscriptionState;

/// Canonical session key for an endpoint URL.
///
/// Two URLs with the same host and port address the same session. No default
/// port is ever appended; a URL without a port keys on the host alone.
pub(crate) fn session_key(endpoint_url: &str) -> Result<String, AdapterError> {
    let parsed = Url::parse(endpoint_url)
        .map_err(|_| AdapterError::InvalidEndpoint(endpoint_url.to_string()))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| AdapterError::InvalidEndpoint(endpoint_url.to_string()))?;
    Ok(match parsed.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

/// One live session and its subscription bookkeeping.
pub(crate) struct SessionEntry {
    /// Endpoint URL the session was connected with
    pub endpoint: String,
    /// Canonical host:port key
    pub key: String,
    /// Stack services for this session
    pub services: Arc<dyn StackServices>,
    /// Subscription records and pump state
    pub subscriptions: tokio::sync::Mutex<SubscriptionState>,
}

impl SessionEntry {
    pub fn new(endpoint: String, key: String, services: Arc<dyn StackServices>) -> Self {
        Self {
            endpoint,
            key,
            services,
            subscriptions: tokio::sync::Mutex::new(SubscriptionState::default()),
        }
    }
}

/// Map of session key to live session.
#[derive(Default)]
pub(crate) struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<SessionEntry>>>,
}

impl SessionRegistry {
    /// Insert a new session; fails when the key is taken.
    pub fn insert(&self, entry: Arc<SessionEntry>) -> Result<(), AdapterError> {
        let mut sessions = self.sessions.lock().expect("session registry lock");
        if sessions.contains_key(&entry.key) {
            return Err(AdapterError::AlreadyConnected(entry.endpoint.clone()));
        }
        sessions.insert(entry.key.clone(), entry);
        Ok(())
    }

    /// Whether a session already exists for the key.
    pub fn contains(&self, key: &str) -> bool {
        self.sessions
            .lock()
            .expect("session registry lock")
            .contains_key(key)
    }

    /// Resolve an endpoint URL to its live session.
    pub fn get(&self, endpoint_url: &str) -> Result<Arc<SessionEntry>, AdapterError> {
        let key = session_key(endpoint_url)?;
        self.sessions
            .lock()
            .expect("session registry lock")
            .get(&key)
            .cloned()
            .ok_or_else(|| AdapterError::UnknownSession(endpoint_url.to_string()))
    }

    /// Remove and return the session for an endpoint URL.
    pub fn remove(&self, endpoint_url: &str) -> Result<Arc<SessionEntry>, AdapterError> {
        let key = session_key(endpoint_url)?;
        self.sessions
            .lock()
            .expect("session registry lock")
            .remove(&key)
            .ok_or_else(|| AdapterError::UnknownSession(endpoint_url.to_string()))
    }

    /// Number of live sessions.
    pub fn count(&self) -> usize {
        self.sessions.lock().expect("session registry lock").len()
    }
}
