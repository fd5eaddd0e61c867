use crate::core::errors::ExchangeError;
use crate::core::kernel::signer::Signer;
use crate::core::types::SecurityType;
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Method, Response};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, trace};

/// One outbound HTTP call.
///
/// Parameters go to the query string for GET/DELETE and to a
/// form-encoded body for POST/PUT.
#[derive(Debug, Clone)]
pub struct RestRequest {
    pub method: Method,
    pub endpoint: String,
    pub params: Vec<(String, String)>,
    pub security: SecurityType,
    pub cancel: Option<CancellationToken>,
}

impl RestRequest {
    pub fn new(method: Method, endpoint: impl Into<String>) -> Self {
        Self {
            method,
            endpoint: endpoint.into(),
            params: Vec::new(),
            security: SecurityType::None,
            cancel: None,
        }
    }

    pub fn get(endpoint: impl Into<String>) -> Self {
        Self::new(Method::GET, endpoint)
    }

    pub fn post(endpoint: impl Into<String>) -> Self {
        Self::new(Method::POST, endpoint)
    }

    pub fn put(endpoint: impl Into<String>) -> Self {
        Self::new(Method::PUT, endpoint)
    }

    pub fn delete(endpoint: impl Into<String>) -> Self {
        Self::new(Method::DELETE, endpoint)
    }

    pub fn param(mut self, key: &str, value: impl ToString) -> Self {
        self.params.push((key.to_string(), value.to_string()));
        self
    }

    pub fn optional_param<V: ToString>(self, key: &str, value: Option<V>) -> Self {
        match value {
            Some(value) => self.param(key, value),
            None => self,
        }
    }

    pub fn params<K: AsRef<str>, V: AsRef<str>>(mut self, params: &[(K, V)]) -> Self {
        self.params.extend(
            params
                .iter()
                .map(|(k, v)| (k.as_ref().to_string(), v.as_ref().to_string())),
        );
        self
    }

    pub const fn security(mut self, security: SecurityType) -> Self {
        self.security = security;
        self
    }

    pub const fn signed(self) -> Self {
        self.security(SecurityType::Signed)
    }

    pub const fn with_api_key(self) -> Self {
        self.security(SecurityType::ApiKey)
    }

    /// Abort the in-flight request when `token` is cancelled.
    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    fn params_in_body(&self) -> bool {
        self.method == Method::POST || self.method == Method::PUT
    }
}

/// REST client trait for making HTTP requests
///
/// `execute` returns the raw body of a 2xx response. Non-2xx responses
/// become `ApiError` when the body decodes as `{code, msg}` and
/// `TransportError` otherwise. No retry happens at this layer.
#[async_trait]
pub trait RestClient: Send + Sync {
    async fn execute(&self, request: RestRequest) -> Result<String, ExchangeError>;
}

/// Configuration for the REST client
#[derive(Clone, Debug)]
pub struct RestClientConfig {
    /// Base URL for the API
    pub base_url: String,
    /// Exchange name for logging and tracing
    pub exchange_name: String,
    /// Request timeout in seconds
    pub timeout_seconds: u64,
    /// Injected into every signed request when set
    pub recv_window: Option<u64>,
    /// User agent string to include in requests
    pub user_agent: String,
}

impl RestClientConfig {
    /// Create a new configuration
    ///
    /// # Arguments
    /// * `base_url` - Base URL for the API
    /// * `exchange_name` - Name of the exchange
    pub fn new(base_url: String, exchange_name: String) -> Self {
        Self {
            base_url,
            exchange_name,
            timeout_seconds: 30,
            recv_window: None,
            user_agent: concat!("binance-connect/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }

    /// Set the request timeout
    pub fn with_timeout(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    pub fn with_recv_window(mut self, recv_window: Option<u64>) -> Self {
        self.recv_window = recv_window;
        self
    }

    /// Set the user agent string
    pub fn with_user_agent(mut self, user_agent: String) -> Self {
        self.user_agent = user_agent;
        self
    }
}

/// Builder for creating REST client instances
pub struct RestClientBuilder {
    config: RestClientConfig,
    signer: Option<Arc<dyn Signer>>,
}

impl RestClientBuilder {
    pub fn new(config: RestClientConfig) -> Self {
        Self {
            config,
            signer: None,
        }
    }

    /// Set the signer for authenticated requests
    pub fn with_signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn build(self) -> Result<ReqwestRest, ExchangeError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(self.config.timeout_seconds))
            .user_agent(&self.config.user_agent)
            .build()
            .map_err(|e| {
                ExchangeError::InvalidParameters(format!("Failed to build HTTP client: {}", e))
            })?;

        Ok(ReqwestRest {
            client,
            config: self.config,
            signer: self.signer,
        })
    }
}

/// Implementation of `RestClient` using reqwest
///
/// Serves both as the signed requester (`SecurityType::Signed` and
/// `SecurityType::ApiKey`) and as the public requester (`SecurityType::None`).
#[derive(Clone)]
pub struct ReqwestRest {
    client: Client,
    config: RestClientConfig,
    signer: Option<Arc<dyn Signer>>,
}

impl std::fmt::Debug for ReqwestRest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqwestRest")
            .field("config", &self.config)
            .field("has_signer", &self.signer.is_some())
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct ApiErrorBody {
    code: i32,
    msg: String,
}

/// Map a non-2xx response onto the error taxonomy.
pub fn translate_error_response(status: u16, body: String) -> ExchangeError {
    match serde_json::from_str::<ApiErrorBody>(&body) {
        Ok(err) => ExchangeError::ApiError {
            code: err.code,
            message: err.msg,
        },
        Err(_) => ExchangeError::TransportError {
            status: Some(status),
            body,
        },
    }
}

/// Current wall-clock time in milliseconds since the epoch.
pub fn timestamp_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Join pairs in the given order, URL-encoding keys and values.
fn encode_pairs(params: &[(String, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

impl ReqwestRest {
    pub fn config(&self) -> &RestClientConfig {
        &self.config
    }

    pub fn has_signer(&self) -> bool {
        self.signer.is_some()
    }

    fn build_url(&self, endpoint: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), endpoint)
    }

    fn require_signer(&self) -> Result<&Arc<dyn Signer>, ExchangeError> {
        self.signer.as_ref().ok_or_else(|| {
            ExchangeError::CredentialError(
                "API key and secret are required for this request".to_string(),
            )
        })
    }

    /// Produce headers and the final parameter list for the request's security level.
    fn authenticate(
        &self,
        request: &RestRequest,
    ) -> Result<(HashMap<String, String>, Vec<(String, String)>), ExchangeError> {
        match request.security {
            SecurityType::None => Ok((HashMap::new(), request.params.clone())),
            SecurityType::ApiKey => {
                let signer = self.require_signer()?;
                Ok((signer.key_headers(), request.params.clone()))
            }
            SecurityType::Signed => {
                let signer = self.require_signer()?;
                let mut params: Vec<(String, String)> = request
                    .params
                    .iter()
                    .filter(|(k, _)| k != "timestamp" && k != "recvWindow")
                    .cloned()
                    .collect();
                params.push(("timestamp".to_string(), timestamp_millis().to_string()));
                if let Some(recv_window) = self.config.recv_window {
                    params.push(("recvWindow".to_string(), recv_window.to_string()));
                }
                signer.sign_request(request.method.as_str(), &request.endpoint, &params)
            }
        }
    }

    /// Handle the response and extract the body
    #[instrument(skip(self, response), fields(exchange = %self.config.exchange_name, status = %response.status()))]
    async fn handle_response(&self, response: Response) -> Result<String, ExchangeError> {
        let status = response.status();
        let body = response.text().await.map_err(|e| ExchangeError::TransportError {
            status: Some(status.as_u16()),
            body: format!("Failed to read response body: {}", e),
        })?;

        trace!("Response body: {}", body);

        if status.is_success() {
            Ok(body)
        } else {
            Err(translate_error_response(status.as_u16(), body))
        }
    }

    #[instrument(skip(self, request), fields(exchange = %self.config.exchange_name, method = %request.method, endpoint = %request.endpoint))]
    async fn make_request(&self, request: RestRequest) -> Result<String, ExchangeError> {
        let (headers, params) = self.authenticate(&request)?;
        let encoded = encode_pairs(&params);
        let url = self.build_url(&request.endpoint);

        let mut builder = if request.params_in_body() {
            self.client
                .request(request.method.clone(), &url)
                .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(encoded)
        } else if encoded.is_empty() {
            self.client.request(request.method.clone(), &url)
        } else {
            self.client
                .request(request.method.clone(), format!("{}?{}", url, encoded))
        };

        for (key, value) in headers {
            builder = builder.header(key, value);
        }

        let send = async {
            let response = builder.send().await?;
            self.handle_response(response).await
        };

        match request.cancel {
            Some(token) => tokio::select! {
                () = token.cancelled() => Err(ExchangeError::Cancelled),
                result = send => result,
            },
            None => send.await,
        }
    }
}

#[async_trait]
impl RestClient for ReqwestRest {
    async fn execute(&self, request: RestRequest) -> Result<String, ExchangeError> {
        self.make_request(request).await
    }
}
