use crate::core::config::ExchangeConfig;
use crate::core::errors::ExchangeError;
use crate::core::kernel::ws::WsConfig;
use crate::core::kernel::{HmacSigner, ReqwestRest, RestClientBuilder, RestClientConfig};
use crate::exchanges::binance::rest::BinanceRestClient;
use crate::exchanges::binance::subscription::SubscriptionManager;
use std::sync::Arc;

/// Build the signing HTTP transport for `config`.
///
/// A signer is attached only when both credentials are present; without one,
/// public endpoints work and key-protected ones fail with `CredentialError`.
pub fn build_rest_client(config: &ExchangeConfig) -> Result<ReqwestRest, ExchangeError> {
    let rest_config = RestClientConfig::new(config.rest_base_url(), "binance".to_string())
        .with_timeout(config.timeout_seconds)
        .with_recv_window(config.recv_window);

    let mut builder = RestClientBuilder::new(rest_config);
    if config.has_credentials() {
        let signer = HmacSigner::new(
            config.api_key().to_string(),
            config.secret_key().to_string(),
        )?;
        builder = builder.with_signer(Arc::new(signer));
    }

    builder.build()
}

/// Typed REST client
pub fn create_binance_rest_client(
    config: &ExchangeConfig,
) -> Result<BinanceRestClient, ExchangeError> {
    Ok(BinanceRestClient::new(build_rest_client(config)?))
}

/// Subscription manager with default stream timings.
///
/// User data subscriptions are available only when `config` carries credentials.
pub fn create_subscription_manager(
    config: &ExchangeConfig,
) -> Result<SubscriptionManager, ExchangeError> {
    create_subscription_manager_with(config, WsConfig::default())
}

pub fn create_subscription_manager_with(
    config: &ExchangeConfig,
    ws_config: WsConfig,
) -> Result<SubscriptionManager, ExchangeError> {
    let ws_base_url = config.stream_base_url();
    if !config.has_credentials() {
        return Ok(SubscriptionManager::new(ws_base_url, ws_config));
    }

    let rest = Arc::new(create_binance_rest_client(config)?);
    Ok(SubscriptionManager::with_rest(rest, ws_base_url, ws_config))
}
