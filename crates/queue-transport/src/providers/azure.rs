//! Azure Service Bus broker over the REST API.
//!
//! This module talks to Service Bus (cloud or the on-premises server) with
//! plain HTTPS:
//! - Queue provisioning with Atom `QueueDescription` entries
//! - Peek-lock receive (`POST {queue}/messages/head`) and completion by
//!   deleting the lock location
//! - Shared Access Signature authentication signed per request
//! - Status classification into [`BrokerError`] for the transport's retry logic
//!
//! ## Endpoints
//!
//! A cloud connection string (`Endpoint=sb://{ns}.servicebus.windows.net/;
//! SharedAccessKeyName=…;SharedAccessKey=…`) maps to
//! `https://{ns}.servicebus.windows.net`. The on-premises server is addressed
//! path-based: `https://{fqdn}:{https_port}/{namespace}`.
//!
//! ## Example
//!
//! ```no_run
//! use queue_transport::providers::{AzureServiceBusBroker, AzureServiceBusConfig};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AzureServiceBusConfig {
//!     connection_string: Some(
//!         "Endpoint=sb://contoso.servicebus.windows.net/;SharedAccessKeyName=RootManageSharedAccessKey;SharedAccessKey=c2VjcmV0"
//!             .to_string(),
//!     ),
//!     ..Default::default()
//! };
//!
//! let broker = AzureServiceBusBroker::new(config)?;
//! # Ok(())
//! # }
//! ```

use crate::broker::{
    Acknowledgement, BrokerClient, LeasedMessage, ProviderType, QueueCreation, QueueDescription,
    QueueReceiver, QueueSender,
};
use crate::error::{BrokerError, ConfigurationError};
use crate::message::QueueName;
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use bytes::Bytes;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Client as HttpClient, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

#[cfg(test)]
#[path = "azure_tests.rs"]
mod tests;

const PROVIDER: &str = "AzureServiceBus";
const API_VERSION: &str = "2017-04";
const ATOM_CONTENT_TYPE: &str = "application/atom+xml;type=entry;charset=utf-8";
const BROKER_PROPERTIES_HEADER: &str = "BrokerProperties";

/// Default HTTPS port of the on-premises Service Bus server
pub const DEFAULT_ON_PREMISES_HTTPS_PORT: u16 = 4446;

// ============================================================================
// Configuration
// ============================================================================

/// Azure Service Bus configuration
///
/// Either `connection_string` or `on_premises` (with the shared access key
/// fields) must be set.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AzureServiceBusConfig {
    pub connection_string: Option<String>,
    pub on_premises: Option<OnPremisesEndpoint>,
    pub shared_access_key_name: Option<String>,
    pub shared_access_key: Option<String>,
    /// Lifetime of each signed token
    pub token_ttl_secs: u64,
    /// Timeout for management and send requests; receives add their wait
    pub request_timeout_secs: u64,
}

impl Default for AzureServiceBusConfig {
    fn default() -> Self {
        Self {
            connection_string: None,
            on_premises: None,
            shared_access_key_name: None,
            shared_access_key: None,
            token_ttl_secs: 3600,
            request_timeout_secs: 60,
        }
    }
}

impl fmt::Debug for AzureServiceBusConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AzureServiceBusConfig")
            .field(
                "connection_string",
                &self.connection_string.as_ref().map(|_| "<redacted>"),
            )
            .field("on_premises", &self.on_premises)
            .field("shared_access_key_name", &self.shared_access_key_name)
            .field(
                "shared_access_key",
                &self.shared_access_key.as_ref().map(|_| "<redacted>"),
            )
            .field("token_ttl_secs", &self.token_ttl_secs)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

/// Path-based address of an on-premises Service Bus namespace
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OnPremisesEndpoint {
    pub server_fqdn: String,
    pub service_namespace: String,
    #[serde(default = "default_https_port")]
    pub https_port: u16,
}

fn default_https_port() -> u16 {
    DEFAULT_ON_PREMISES_HTTPS_PORT
}

impl OnPremisesEndpoint {
    pub fn base_url(&self) -> String {
        format!(
            "https://{}:{}/{}",
            self.server_fqdn, self.https_port, self.service_namespace
        )
    }
}

/// Resolved endpoint and credentials
#[derive(Clone, PartialEq, Eq)]
pub struct AzureConnection {
    /// Base URL without trailing slash
    pub endpoint: String,
    pub key_name: String,
    pub key: String,
}

impl fmt::Debug for AzureConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AzureConnection")
            .field("endpoint", &self.endpoint)
            .field("key_name", &self.key_name)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl AzureServiceBusConfig {
    /// Resolve the endpoint and credentials
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` if neither addressing mode is configured,
    /// the connection string is malformed, or a key is missing.
    pub fn resolve(&self) -> Result<AzureConnection, ConfigurationError> {
        if let Some(connection_string) = &self.connection_string {
            return parse_connection_string(connection_string);
        }

        let on_premises = self
            .on_premises
            .as_ref()
            .ok_or_else(|| ConfigurationError::Missing {
                key: "broker.connection_string".to_string(),
            })?;
        if on_premises.server_fqdn.is_empty() || on_premises.service_namespace.is_empty() {
            return Err(ConfigurationError::Invalid {
                message: "on-premises endpoint requires server_fqdn and service_namespace"
                    .to_string(),
            });
        }

        Ok(AzureConnection {
            endpoint: on_premises.base_url(),
            key_name: required(&self.shared_access_key_name, "broker.shared_access_key_name")?,
            key: required(&self.shared_access_key, "broker.shared_access_key")?,
        })
    }
}

fn required(value: &Option<String>, key: &str) -> Result<String, ConfigurationError> {
    value
        .as_ref()
        .filter(|v| !v.is_empty())
        .cloned()
        .ok_or_else(|| ConfigurationError::Missing {
            key: key.to_string(),
        })
}

/// Parse a `Key=Value;…` Service Bus connection string
///
/// `sb://` endpoints are rewritten to `https://`; `http(s)://` endpoints are
/// used as given.
pub fn parse_connection_string(value: &str) -> Result<AzureConnection, ConfigurationError> {
    let mut endpoint = None;
    let mut key_name = None;
    let mut key = None;

    for part in value.split(';').map(str::trim).filter(|p| !p.is_empty()) {
        let (name, setting) = part.split_once('=').ok_or_else(|| ConfigurationError::Parsing {
            message: format!("connection string segment '{}' is not Key=Value", part),
        })?;
        match name.trim().to_ascii_lowercase().as_str() {
            "endpoint" => endpoint = Some(setting.trim().to_string()),
            "sharedaccesskeyname" => key_name = Some(setting.trim().to_string()),
            "sharedaccesskey" => key = Some(setting.trim().to_string()),
            _ => {}
        }
    }

    let endpoint = endpoint.ok_or_else(|| ConfigurationError::Missing {
        key: "Endpoint".to_string(),
    })?;
    let normalized = match endpoint.split_once("://") {
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case("sb") => format!("https://{}", rest),
        _ => endpoint.clone(),
    };
    let url = Url::parse(&normalized).map_err(|e| ConfigurationError::Parsing {
        message: format!("invalid endpoint '{}': {}", endpoint, e),
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigurationError::Invalid {
            message: format!("unsupported endpoint scheme '{}'", url.scheme()),
        });
    }

    Ok(AzureConnection {
        endpoint: url.as_str().trim_end_matches('/').to_string(),
        key_name: key_name.ok_or_else(|| ConfigurationError::Missing {
            key: "SharedAccessKeyName".to_string(),
        })?,
        key: key.ok_or_else(|| ConfigurationError::Missing {
            key: "SharedAccessKey".to_string(),
        })?,
    })
}

// ============================================================================
// Shared Access Signature
// ============================================================================

type HmacSha256 = Hmac<Sha256>;

/// Signs Shared Access Signature tokens for a namespace
///
/// Token format:
/// `SharedAccessSignature sr={uri}&sig={signature}&se={expiry}&skn={key_name}`
/// where the signature is the base64 HMAC-SHA256 of `"{uri}\n{expiry}"`,
/// keyed with the shared access key.
#[derive(Clone)]
struct SasTokenProvider {
    key_name: String,
    key: String,
    ttl: Duration,
}

impl SasTokenProvider {
    fn new(key_name: String, key: String, ttl: Duration) -> Self {
        Self { key_name, key, ttl }
    }

    fn token(&self, resource_uri: &str) -> Result<String, BrokerError> {
        let expiry = Utc::now().timestamp() + self.ttl.as_secs() as i64;
        self.token_with_expiry(resource_uri, expiry)
    }

    fn token_with_expiry(&self, resource_uri: &str, expiry: i64) -> Result<String, BrokerError> {
        let encoded_uri = urlencoding::encode(&resource_uri.to_lowercase()).into_owned();
        let string_to_sign = format!("{}\n{}", encoded_uri, expiry);

        let mut mac = HmacSha256::new_from_slice(self.key.as_bytes()).map_err(|e| {
            BrokerError::AuthenticationFailed {
                message: format!("invalid shared access key: {}", e),
            }
        })?;
        mac.update(string_to_sign.as_bytes());
        let signature = general_purpose::STANDARD.encode(mac.finalize().into_bytes());

        Ok(format!(
            "SharedAccessSignature sr={}&sig={}&se={}&skn={}",
            encoded_uri,
            urlencoding::encode(&signature),
            expiry,
            self.key_name
        ))
    }
}

// ============================================================================
// HTTP plumbing
// ============================================================================

/// Connection shared by the broker and all its handles
struct AzureClient {
    http: HttpClient,
    endpoint: String,
    tokens: SasTokenProvider,
    request_timeout: Duration,
}

impl AzureClient {
    fn queue_url(&self, queue: &QueueName) -> String {
        format!("{}/{}", self.endpoint, queue)
    }

    /// Sign and send a request
    async fn execute(
        &self,
        request: RequestBuilder,
        timeout: Duration,
    ) -> Result<Response, BrokerError> {
        let token = self.tokens.token(&self.endpoint)?;

        request
            .header("Authorization", token)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    BrokerError::Timeout { duration: timeout }
                } else if e.is_connect() {
                    BrokerError::ConnectionFailed {
                        message: format!("Connection failed: {}", e),
                    }
                } else {
                    BrokerError::ConnectionFailed {
                        message: format!("HTTP request failed: {}", e),
                    }
                }
            })
    }

    async fn queue_exists(&self, queue: &QueueName) -> Result<bool, BrokerError> {
        let request = self
            .http
            .get(self.queue_url(queue))
            .query(&[("api-version", API_VERSION)]);
        let response = self.execute(request, self.request_timeout).await?;

        match response.status() {
            StatusCode::OK => {
                let body = response.text().await.map_err(read_failed)?;
                parse_queue_feed(&body)
            }
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(classify_failure(queue, response).await),
        }
    }

    async fn require_queue(&self, queue: &QueueName) -> Result<(), BrokerError> {
        if self.queue_exists(queue).await? {
            Ok(())
        } else {
            Err(BrokerError::QueueNotFound {
                queue: queue.to_string(),
            })
        }
    }
}

fn read_failed(e: reqwest::Error) -> BrokerError {
    BrokerError::ConnectionFailed {
        message: format!("Failed to read response body: {}", e),
    }
}

/// Map an unsuccessful response to a broker error
async fn classify_failure(queue: &QueueName, response: Response) -> BrokerError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();

    match status {
        StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => BrokerError::Busy {
            message: format!("{}: {}", status, body),
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => BrokerError::AuthenticationFailed {
            message: format!("{}: {}", status, body),
        },
        StatusCode::NOT_FOUND => BrokerError::QueueNotFound {
            queue: queue.to_string(),
        },
        _ => BrokerError::Provider {
            provider: PROVIDER.to_string(),
            code: status.as_u16().to_string(),
            message: body,
        },
    }
}

/// Check whether a queue GET returned a description rather than an empty feed
fn parse_queue_feed(xml: &str) -> Result<bool, BrokerError> {
    use quick_xml::events::Event;
    use quick_xml::Reader;

    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e))
                if e.local_name().as_ref() == b"QueueDescription" =>
            {
                return Ok(true);
            }
            Ok(Event::Eof) => return Ok(false),
            Err(e) => {
                return Err(BrokerError::Provider {
                    provider: PROVIDER.to_string(),
                    code: "InvalidResponse".to_string(),
                    message: format!("XML parsing error: {}", e),
                })
            }
            _ => {}
        }
        buf.clear();
    }
}

/// ISO 8601 duration as used by Atom queue descriptions
fn xml_duration(duration: Duration) -> String {
    match duration.subsec_millis() {
        0 => format!("PT{}S", duration.as_secs()),
        millis => format!("PT{}.{:03}S", duration.as_secs(), millis),
    }
}

/// Atom entry creating a queue with the given description
fn queue_description_entry(description: &QueueDescription) -> String {
    format!(
        concat!(
            r#"<entry xmlns="http://www.w3.org/2005/Atom"><content type="application/xml">"#,
            r#"<QueueDescription xmlns="http://schemas.microsoft.com/netservices/2010/10/servicebus/connect" xmlns:i="http://www.w3.org/2001/XMLSchema-instance">"#,
            "<LockDuration>{}</LockDuration>",
            "<MaxSizeInMegabytes>{}</MaxSizeInMegabytes>",
            "<RequiresDuplicateDetection>{}</RequiresDuplicateDetection>",
            "<RequiresSession>{}</RequiresSession>",
            "<DefaultMessageTimeToLive>{}</DefaultMessageTimeToLive>",
            "<DeadLetteringOnMessageExpiration>{}</DeadLetteringOnMessageExpiration>",
            "<DuplicateDetectionHistoryTimeWindow>{}</DuplicateDetectionHistoryTimeWindow>",
            "<MaxDeliveryCount>{}</MaxDeliveryCount>",
            "<EnableBatchedOperations>{}</EnableBatchedOperations>",
            "</QueueDescription></content></entry>"
        ),
        xml_duration(description.lock_duration),
        description.max_size_mb,
        description.requires_duplicate_detection,
        description.requires_session,
        xml_duration(description.default_message_ttl),
        description.dead_lettering_on_message_expiration,
        xml_duration(description.duplicate_detection_window),
        description.max_delivery_count,
        description.enable_batched_operations,
    )
}

// ============================================================================
// Azure Service Bus Broker
// ============================================================================

/// Service Bus broker speaking the REST protocol
pub struct AzureServiceBusBroker {
    client: Arc<AzureClient>,
}

impl AzureServiceBusBroker {
    /// Create new broker from configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` if the endpoint or credentials cannot be
    /// resolved, or the HTTP client cannot be built.
    pub fn new(config: AzureServiceBusConfig) -> Result<Self, ConfigurationError> {
        let connection = config.resolve()?;

        let http = HttpClient::builder()
            .user_agent(concat!("queue-transport/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ConfigurationError::Invalid {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        debug!(endpoint = %connection.endpoint, "Azure Service Bus broker configured");

        Ok(Self {
            client: Arc::new(AzureClient {
                http,
                endpoint: connection.endpoint,
                tokens: SasTokenProvider::new(
                    connection.key_name,
                    connection.key,
                    Duration::from_secs(config.token_ttl_secs),
                ),
                request_timeout: Duration::from_secs(config.request_timeout_secs),
            }),
        })
    }

    /// Base URL requests are sent to
    pub fn endpoint(&self) -> &str {
        &self.client.endpoint
    }
}

impl fmt::Debug for AzureServiceBusBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AzureServiceBusBroker")
            .field("endpoint", &self.client.endpoint)
            .finish()
    }
}

#[async_trait]
impl BrokerClient for AzureServiceBusBroker {
    async fn create_queue(
        &self,
        description: &QueueDescription,
    ) -> Result<QueueCreation, BrokerError> {
        let client = &self.client;
        let request = client
            .http
            .put(client.queue_url(&description.name))
            .query(&[("api-version", API_VERSION)])
            .header("Content-Type", ATOM_CONTENT_TYPE)
            .body(queue_description_entry(description));
        let response = client.execute(request, client.request_timeout).await?;

        match response.status() {
            StatusCode::CREATED | StatusCode::OK => Ok(QueueCreation::Created),
            StatusCode::CONFLICT => Ok(QueueCreation::AlreadyExists),
            _ => Err(classify_failure(&description.name, response).await),
        }
    }

    async fn create_sender(&self, queue: &QueueName) -> Result<Arc<dyn QueueSender>, BrokerError> {
        self.client.require_queue(queue).await?;
        Ok(Arc::new(AzureSender {
            client: Arc::clone(&self.client),
            queue: queue.clone(),
        }))
    }

    async fn create_receiver(
        &self,
        queue: &QueueName,
    ) -> Result<Arc<dyn QueueReceiver>, BrokerError> {
        self.client.require_queue(queue).await?;
        Ok(Arc::new(AzureReceiver {
            client: Arc::clone(&self.client),
            queue: queue.clone(),
        }))
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::AzureServiceBus
    }
}

// ============================================================================
// Handles
// ============================================================================

struct AzureSender {
    client: Arc<AzureClient>,
    queue: QueueName,
}

#[async_trait]
impl QueueSender for AzureSender {
    async fn send(&self, payload: Bytes) -> Result<(), BrokerError> {
        let max_size = ProviderType::AzureServiceBus.max_message_size();
        if payload.len() > max_size {
            return Err(BrokerError::Provider {
                provider: PROVIDER.to_string(),
                code: "MessageSizeExceeded".to_string(),
                message: format!("{} bytes exceeds limit of {}", payload.len(), max_size),
            });
        }

        let client = &self.client;
        let request = client
            .http
            .post(format!("{}/messages", client.queue_url(&self.queue)))
            .header("Content-Type", "application/json")
            .body(payload);
        let response = client.execute(request, client.request_timeout).await?;

        match response.status() {
            StatusCode::CREATED | StatusCode::OK => Ok(()),
            _ => Err(classify_failure(&self.queue, response).await),
        }
    }

    fn queue_name(&self) -> &QueueName {
        &self.queue
    }
}

struct AzureReceiver {
    client: Arc<AzureClient>,
    queue: QueueName,
}

/// Lease metadata carried in the `BrokerProperties` response header
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BrokerProperties {
    lock_token: String,
    #[serde(default)]
    message_id: Option<String>,
    #[serde(default)]
    delivery_count: u32,
    #[serde(default)]
    sequence_number: Option<u64>,
}

#[async_trait]
impl QueueReceiver for AzureReceiver {
    async fn receive(&self, wait: Duration) -> Result<Option<Box<dyn LeasedMessage>>, BrokerError> {
        let client = &self.client;
        let queue_url = client.queue_url(&self.queue);
        let request = client
            .http
            .post(format!("{}/messages/head", queue_url))
            .query(&[("timeout", wait.as_secs())]);
        let response = client
            .execute(request, client.request_timeout.saturating_add(wait))
            .await?;

        match response.status() {
            StatusCode::NO_CONTENT => return Ok(None),
            StatusCode::CREATED | StatusCode::OK => {}
            _ => return Err(classify_failure(&self.queue, response).await),
        }

        let properties: BrokerProperties = response
            .headers()
            .get(BROKER_PROPERTIES_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| invalid_response(format!("malformed BrokerProperties: {}", e)))?
            .ok_or_else(|| invalid_response("missing BrokerProperties header".to_string()))?;

        let location = match response
            .headers()
            .get("Location")
            .and_then(|value| value.to_str().ok())
        {
            Some(location) => location.to_string(),
            None => format!(
                "{}/messages/{}/{}",
                queue_url,
                properties.message_id.as_deref().unwrap_or_default(),
                properties.lock_token
            ),
        };

        let body = response.bytes().await.map_err(read_failed)?;
        debug!(
            queue = %self.queue,
            lock_token = %properties.lock_token,
            delivery_count = properties.delivery_count,
            sequence_number = properties.sequence_number,
            "Message leased"
        );

        Ok(Some(Box::new(AzureLease {
            client: Arc::clone(&self.client),
            queue: self.queue.clone(),
            location,
            lock_token: properties.lock_token,
            delivery_count: properties.delivery_count,
            body,
        })))
    }

    fn queue_name(&self) -> &QueueName {
        &self.queue
    }
}

fn invalid_response(message: String) -> BrokerError {
    BrokerError::Provider {
        provider: PROVIDER.to_string(),
        code: "InvalidResponse".to_string(),
        message,
    }
}

struct AzureLease {
    client: Arc<AzureClient>,
    queue: QueueName,
    location: String,
    lock_token: String,
    delivery_count: u32,
    body: Bytes,
}

#[async_trait]
impl LeasedMessage for AzureLease {
    fn body(&self) -> &Bytes {
        &self.body
    }

    fn lock_token(&self) -> &str {
        &self.lock_token
    }

    fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    async fn acknowledge(&self) -> Result<Acknowledgement, BrokerError> {
        let client = &self.client;
        let request = client.http.delete(&self.location);
        let response = client.execute(request, client.request_timeout).await?;

        match response.status() {
            StatusCode::OK | StatusCode::NO_CONTENT => Ok(Acknowledgement::Completed),
            StatusCode::NOT_FOUND | StatusCode::GONE => {
                debug!(
                    queue = %self.queue,
                    lock_token = %self.lock_token,
                    status = response.status().as_u16(),
                    "Lock no longer held at completion"
                );
                Ok(Acknowledgement::LeaseLost)
            }
            _ => Err(classify_failure(&self.queue, response).await),
        }
    }
}
