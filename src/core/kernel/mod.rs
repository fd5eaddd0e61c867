/// Transport kernel shared by every Binance surface
///
/// The kernel holds transport logic only: it knows how to sign, send and
/// stream, but nothing about individual endpoints or event payloads.
///
/// ## Transport Layer
/// - `RestClient` / `ReqwestRest`: signed, key-only and public HTTP calls
/// - `StreamConnection`: one persistent socket with keepalive and bounded reconnect
///
/// ## Authentication
/// - `Signer`: pluggable request authentication
/// - `HmacSigner`: HMAC-SHA256 over the sorted, URL-encoded query
///
/// ## Message Handling
/// - `WsCodec`: frame encoding and decoding for a concrete stream protocol
///
/// # Usage
///
/// ## Signed REST call
/// ```rust,no_run
/// use binance_connect::core::kernel::*;
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), binance_connect::core::errors::ExchangeError> {
/// let signer = Arc::new(HmacSigner::new("api_key".to_string(), "secret".to_string())?);
/// let rest = RestClientBuilder::new(RestClientConfig::new(
///     "https://testnet.binance.vision".to_string(),
///     "binance".to_string(),
/// ))
/// .with_signer(signer)
/// .build()?;
///
/// let body = rest
///     .execute(RestRequest::get("/api/v3/account").signed())
///     .await?;
/// println!("{}", body);
/// # Ok(())
/// # }
/// ```
///
/// ## Raw stream
/// ```rust,no_run
/// use binance_connect::core::kernel::*;
///
/// # async fn example() -> Result<(), binance_connect::core::errors::ExchangeError> {
/// let conn = StreamConnection::new(
///     "btcusdt@trade",
///     "wss://stream.binance.com:9443/ws/btcusdt@trade",
///     WsConfig::default(),
/// );
/// conn.set_message_handler(|text| println!("{}", text));
/// conn.set_error_handler(|err| eprintln!("{}", err));
/// conn.connect().await?;
/// conn.disconnect().await?;
/// # Ok(())
/// # }
/// ```
pub mod codec;
pub mod rest;
pub mod signer;
pub mod ws;

// Re-export key types for convenience
pub use codec::WsCodec;
pub use rest::{ReqwestRest, RestClient, RestClientBuilder, RestClientConfig, RestRequest};
pub use signer::{canonicalize, parse_query, HmacSigner, SignatureResult, Signer};
pub use ws::{StreamConnection, WsConfig};
