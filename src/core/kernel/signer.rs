use crate::core::errors::ExchangeError;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, Secret};
use sha2::Sha256;
use std::borrow::Cow;
use std::collections::HashMap;

type HmacSha256 = Hmac<Sha256>;

pub const API_KEY_HEADER: &str = "X-MBX-APIKEY";
pub const SIGNATURE_PARAM: &str = "signature";

/// Result type for signing operations: (headers, `signed_params`)
pub type SignatureResult = Result<(HashMap<String, String>, Vec<(String, String)>), ExchangeError>;

/// Signer trait for request authentication
///
/// Implementations receive the full parameter set (timestamp and
/// recvWindow already injected) and return the headers to attach plus the
/// parameters to send, in wire order.
pub trait Signer: Send + Sync {
    /// Sign a request and return headers and parameters
    ///
    /// # Arguments
    /// * `method` - HTTP method (GET, POST, etc.)
    /// * `endpoint` - API endpoint path
    /// * `params` - Request parameters, excluding `signature`
    fn sign_request(
        &self,
        method: &str,
        endpoint: &str,
        params: &[(String, String)],
    ) -> SignatureResult;

    /// Headers for endpoints that only need the API key.
    fn key_headers(&self) -> HashMap<String, String>;
}

/// Sort parameters lexically by key (then value) and URL-encode each pair.
pub fn canonicalize<K, V>(params: &[(K, V)]) -> String
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut pairs: Vec<(&str, &str)> = params
        .iter()
        .map(|(k, v)| (k.as_ref(), v.as_ref()))
        .collect();
    pairs.sort_unstable();

    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Parse a `k=v&k2=v2` string back into decoded pairs.
pub fn parse_query(query: &str) -> Result<Vec<(String, String)>, ExchangeError> {
    query
        .split('&')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let (k, v) = part.split_once('=').unwrap_or((part, ""));
            Ok((decode_component(k)?.into_owned(), decode_component(v)?.into_owned()))
        })
        .collect()
}

fn decode_component(raw: &str) -> Result<Cow<'_, str>, ExchangeError> {
    urlencoding::decode(raw).map_err(|e| {
        ExchangeError::InvalidParameters(format!("invalid percent-encoding in '{}': {}", raw, e))
    })
}

/// HMAC-SHA256 signer producing lowercase hex digests
pub struct HmacSigner {
    api_key: String,
    secret_key: Secret<String>,
}

impl std::fmt::Debug for HmacSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacSigner")
            .field("api_key", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

impl HmacSigner {
    /// Create a new HMAC signer
    ///
    /// Both credentials must be non-empty.
    pub fn new(api_key: String, secret_key: String) -> Result<Self, ExchangeError> {
        if api_key.is_empty() || secret_key.is_empty() {
            return Err(ExchangeError::CredentialError(
                "API key and secret must both be non-empty".to_string(),
            ));
        }

        Ok(Self {
            api_key,
            secret_key: Secret::new(secret_key),
        })
    }

    /// Hex digest of `payload` under the configured secret.
    pub fn sign(&self, payload: &str) -> Result<String, ExchangeError> {
        sign_payload(self.secret_key.expose_secret(), payload)
    }
}

/// Lowercase hex HMAC-SHA256 of `payload` keyed with `secret`.
pub fn sign_payload(secret: &str, payload: &str) -> Result<String, ExchangeError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ExchangeError::CredentialError(format!("Invalid secret key: {}", e)))?;

    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

impl Signer for HmacSigner {
    fn sign_request(
        &self,
        _method: &str,
        _endpoint: &str,
        params: &[(String, String)],
    ) -> SignatureResult {
        let mut signed_params: Vec<(String, String)> = params
            .iter()
            .filter(|(k, _)| k != SIGNATURE_PARAM)
            .cloned()
            .collect();
        signed_params.sort_unstable();

        let signature = self.sign(&canonicalize(&signed_params))?;
        signed_params.push((SIGNATURE_PARAM.to_string(), signature));

        Ok((self.key_headers(), signed_params))
    }

    fn key_headers(&self) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        headers.insert(API_KEY_HEADER.to_string(), self.api_key.clone());
        headers
    }
}
