//! Client for the workshop API.
//!
//! `/local/...` paths are served by the guest itself through the forwarded
//! service port. Everything else goes to the remote API and is signed when
//! session credentials are present.

pub mod sign;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, Url};
use serde_json::Value;
use workshop_shared::constants::network;
use workshop_shared::errors::{WorkshopError, WorkshopResult};

pub use sign::Credentials;

/// Guest endpoint asking the guest to shut itself down.
pub const STOP_PATH: &str = "/local/workshop/stop";

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Calls the controller makes into the running guest.
#[async_trait]
pub trait GuestApi: Send + Sync {
    /// Ask the guest to stop gracefully. Returns once the request is accepted.
    async fn request_stop(&self) -> WorkshopResult<()>;
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Base of the remote API, if the user has one configured.
    pub api_base: Option<String>,
    pub local_base: String,
    pub credentials: Option<Credentials>,
    pub timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            api_base: None,
            local_base: network::LOCAL_API_BASE.to_string(),
            credentials: None,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// HTTP client implementing the signing scheme.
pub struct ApiClient {
    http: reqwest::Client,
    config: ApiConfig,
}

impl ApiClient {
    pub fn new(config: ApiConfig) -> WorkshopResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(format!("workshop/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| WorkshopError::Config(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self { http, config })
    }

    fn resolve(&self, path: &str) -> WorkshopResult<(Url, bool)> {
        let local = sign::is_local(path);
        let base = if local {
            self.config.local_base.as_str()
        } else {
            self.config
                .api_base
                .as_deref()
                .ok_or_else(|| WorkshopError::Config(format!("no API base configured for {}", path)))?
        };
        let url = Url::parse(base)
            .and_then(|base| base.join(path))
            .map_err(|e| WorkshopError::Config(format!("invalid API url {}{}: {}", base, path, e)))?;
        Ok((url, local))
    }

    /// Build a request, encoding `body` as JSON and signing where required.
    pub fn prepare(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> WorkshopResult<reqwest::RequestBuilder> {
        let (url, local) = self.resolve(path)?;

        // Non-GET requests always carry a JSON object.
        let body = match body {
            Some(body) => Some(serde_json::to_string(&body)?),
            None if method != Method::GET => Some("{}".to_string()),
            None => None,
        };

        let mut request = self.http.request(method.clone(), url.clone());
        if let Some(body) = &body {
            request = request
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body.clone());
        }

        if !local
            && sign::requires_signature(method.as_str(), url.path())
            && let Some(credentials) = &self.config.credentials
        {
            let host = match (url.host_str(), url.port()) {
                (Some(host), Some(port)) => format!("{}:{}", host, port),
                (Some(host), None) => host.to_string(),
                (None, _) => String::new(),
            };
            let signature = sign::sign(
                method.as_str(),
                &host,
                url.path(),
                body.as_deref(),
                credentials,
                chrono::Utc::now().timestamp_millis(),
            )?;
            request = request
                .header(sign::DATE_HEADER, signature.date)
                .header(sign::TOKEN_HEADER, signature.token)
                .header(sign::SIGNATURE_HEADER, signature.signature);
        }

        Ok(request)
    }

    /// Send a request and decode a JSON (or text) response.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> WorkshopResult<Value> {
        let response = self
            .prepare(method.clone(), path, body)?
            .send()
            .await
            .map_err(|e| WorkshopError::Api(format!("{} {} failed: {}", method, path, e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| WorkshopError::Api(format!("{} {}: unreadable body: {}", method, path, e)))?;
        if !status.is_success() {
            return Err(WorkshopError::Api(format!(
                "{} {} returned {}: {}",
                method, path, status, text
            )));
        }
        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }
}

#[async_trait]
impl GuestApi for ApiClient {
    async fn request_stop(&self) -> WorkshopResult<()> {
        tracing::info!("Requesting graceful guest stop");
        self.request(Method::POST, STOP_PATH, None).await.map(|_| ())
    }
}
