//! Server discovery and endpoint information
//!
//! `find_servers` validates every application description the discovery
//! server returns; descriptions that fail validation are filtered out
//! silently. `get_endpoints` reduces each offered endpoint to the typed
//! facts the caller picks a connection by.

use serde::{Deserialize, Serialize};
use url::Url;

use opcua::types::{
    ApplicationDescription, ApplicationType, EndpointDescription, UserTokenType,
};
use opcua::types::MessageSecurityMode as StackSecurityMode;

use crate::config::{AdapterConfig, ApplicationTypes};
use crate::error::AdapterError;
use crate::stack::StackConnector;

/// Minimum length of a plausible application URI.
const MIN_APPLICATION_URI_LENGTH: usize = 5;

/// A validated server application found during discovery.
#[derive(Debug, Clone)]
pub struct EdgeApplication {
    pub application_uri: String,
    pub product_uri: String,
    pub application_name: String,
    pub locale: String,
    pub application_type: ApplicationTypes,
    pub discovery_urls: Vec<String>,
}

/// Authentication token kinds an endpoint accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EdgeTokenKind {
    Anonymous,
    UserName,
    Certificate,
    IssuedToken,
}

/// Message security advertised by an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EdgeSecurityMode {
    None,
    Sign,
    SignAndEncrypt,
    Unknown,
}

/// One endpoint offered by a server, reduced to what a caller decides on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeEndpoint {
    pub endpoint_url: String,
    /// Trailing segment of the security policy URI, e.g. "Basic256Sha256"
    pub security_policy: String,
    pub security_mode: EdgeSecurityMode,
    /// Server certificate bytes, when the endpoint sent one
    pub certificate: Option<Vec<u8>>,
    pub token_kinds: Vec<EdgeTokenKind>,
}

impl EdgeEndpoint {
    pub fn accepts_anonymous(&self) -> bool {
        self.token_kinds.contains(&EdgeTokenKind::Anonymous)
    }

    pub fn is_secured(&self) -> bool {
        matches!(
            self.security_mode,
            EdgeSecurityMode::Sign | EdgeSecurityMode::SignAndEncrypt
        )
    }
}

pub(crate) async fn find_servers(
    connector: &dyn StackConnector,
    config: &AdapterConfig,
    discovery_url: &str,
    server_uris: &[String],
    locale_ids: &[String],
) -> Result<Vec<EdgeApplication>, AdapterError> {
    let descriptions = connector
        .find_servers(discovery_url)
        .await
        .map_err(AdapterError::Service)?;

    tracing::info!(
        "FindServers at {} returned {} descriptions",
        discovery_url,
        descriptions.len()
    );

    let mut found = Vec::new();
    for description in &descriptions {
        if !validate_application_description(
            description,
            config.settings.supported_types,
            server_uris,
            locale_ids,
        ) {
            continue;
        }
        let application = to_edge_application(description);
        (config.callbacks.on_endpoint_found)(&application);
        found.push(application);
    }

    Ok(found)
}

pub(crate) async fn get_endpoints(
    connector: &dyn StackConnector,
    server_url: &str,
) -> Result<Vec<EdgeEndpoint>, AdapterError> {
    let endpoints = connector
        .get_endpoints(server_url)
        .await
        .map_err(AdapterError::Service)?;

    tracing::info!("Discovered {} endpoints at {}", endpoints.len(), server_url);

    Ok(endpoints.iter().map(summarize_endpoint).collect())
}

/// Apply the discovery filter rules to one received description.
pub(crate) fn validate_application_description(
    description: &ApplicationDescription,
    supported: ApplicationTypes,
    server_uris: &[String],
    locale_ids: &[String],
) -> bool {
    let app_type = map_application_type(description.application_type);
    if !supported.intersects(app_type) {
        tracing::debug!(
            "Rejecting {:?}: application type {:?} not in supported mask",
            description.application_uri,
            description.application_type
        );
        return false;
    }

    let uri = description.application_uri.as_ref();
    if !validate_application_uri(uri) {
        tracing::debug!("Rejecting {:?}: invalid application uri", uri);
        return false;
    }

    if !server_uris.is_empty() && !server_uris.iter().any(|u| u == uri) {
        tracing::debug!("Rejecting {:?}: not in requested server uris", uri);
        return false;
    }

    if !locale_ids.is_empty() {
        let locale = description.application_name.locale.as_ref();
        if !locale_ids.iter().any(|l| l == locale) {
            tracing::debug!("Rejecting {:?}: locale {:?} not requested", uri, locale);
            return false;
        }
    }

    true
}

/// An application URI is either a `urn:` or a parseable endpoint URL with a
/// non-empty host; hosts that start with a digit must be dotted-quad IPv4.
fn validate_application_uri(uri: &str) -> bool {
    if uri.len() < MIN_APPLICATION_URI_LENGTH {
        return false;
    }
    if uri.starts_with("urn:") {
        return true;
    }
    let Ok(parsed) = Url::parse(uri) else {
        return false;
    };
    let Some(host) = parsed.host_str() else {
        return false;
    };
    if host.is_empty() {
        return false;
    }
    if host.starts_with(|c: char| c.is_ascii_digit()) {
        return is_dotted_quad(host);
    }
    true
}

/// Four decimal segments of 1 to 3 digits, each at most 255.
fn is_dotted_quad(host: &str) -> bool {
    let segments: Vec<&str> = host.split('.').collect();
    if segments.len() != 4 {
        return false;
    }
    segments.iter().all(|segment| {
        !segment.is_empty()
            && segment.len() <= 3
            && segment.chars().all(|c| c.is_ascii_digit())
            && segment.parse::<u16>().map(|v| v <= 255).unwrap_or(false)
    })
}

fn map_application_type(value: ApplicationType) -> ApplicationTypes {
    match value {
        ApplicationType::Server => ApplicationTypes::SERVER,
        ApplicationType::Client => ApplicationTypes::CLIENT,
        ApplicationType::ClientAndServer => ApplicationTypes::CLIENT_AND_SERVER,
        ApplicationType::DiscoveryServer => ApplicationTypes::DISCOVERY_SERVER,
    }
}

fn to_edge_application(description: &ApplicationDescription) -> EdgeApplication {
    EdgeApplication {
        application_uri: description.application_uri.as_ref().to_string(),
        product_uri: description.product_uri.as_ref().to_string(),
        application_name: description.application_name.text.as_ref().to_string(),
        locale: description.application_name.locale.as_ref().to_string(),
        application_type: map_application_type(description.application_type),
        discovery_urls: description
            .discovery_urls
            .as_ref()
            .map(|urls| urls.iter().map(|u| u.as_ref().to_string()).collect())
            .unwrap_or_default(),
    }
}

fn summarize_endpoint(endpoint: &EndpointDescription) -> EdgeEndpoint {
    let token_kinds = endpoint
        .user_identity_tokens
        .iter()
        .flatten()
        .map(|policy| match policy.token_type {
            UserTokenType::Anonymous => EdgeTokenKind::Anonymous,
            UserTokenType::UserName => EdgeTokenKind::UserName,
            UserTokenType::Certificate => EdgeTokenKind::Certificate,
            UserTokenType::IssuedToken => EdgeTokenKind::IssuedToken,
        })
        .collect();

    EdgeEndpoint {
        endpoint_url: endpoint.endpoint_url.as_ref().to_string(),
        security_policy: short_policy_name(endpoint.security_policy_uri.as_ref()),
        security_mode: match endpoint.security_mode {
            StackSecurityMode::None => EdgeSecurityMode::None,
            StackSecurityMode::Sign => EdgeSecurityMode::Sign,
            StackSecurityMode::SignAndEncrypt => EdgeSecurityMode::SignAndEncrypt,
            _ => EdgeSecurityMode::Unknown,
        },
        certificate: endpoint
            .server_certificate
            .value
            .clone()
            .filter(|bytes| !bytes.is_empty()),
        token_kinds,
    }
}

/// Trailing segment of a security policy URI. Policy URIs end in either
/// `#Name` or `/Name`; an empty URI means no security.
fn short_policy_name(uri: &str) -> String {
    let tail = uri.rsplit(['#', '/']).next().unwrap_or(uri);
    if tail.is_empty() {
        "None".to_string()
    } else {
        tail.to_string()
    }
}
