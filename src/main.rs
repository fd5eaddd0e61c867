use binance_connect::core::config::ExchangeConfig;
use binance_connect::exchanges::binance::{
    create_binance_rest_client, create_subscription_manager, StreamHandlers,
};
use binance_connect::KlineInterval;
use std::time::Duration;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    // Credentials are optional: market data works without them
    let config = ExchangeConfig::from_env("BINANCE")
        .unwrap_or_else(|_| ExchangeConfig::read_only())
        .testnet(true);

    let rest = create_binance_rest_client(&config)?;
    let server_time = rest.server_time().await?;
    info!(server_time = server_time.server_time, "connected to REST API");

    let manager = create_subscription_manager(&config)?;
    let handlers = StreamHandlers::new()
        .on_kline(|event| {
            info!(
                symbol = %event.symbol,
                close = %event.kline.close,
                closed = event.kline.is_closed,
                "kline"
            );
        })
        .on_reconnect(|attempt| warn!(attempt, "stream reconnected"))
        .on_error(|err| warn!("stream error: {}", err));

    let subscription = manager
        .subscribe_kline("BTCUSDT", KlineInterval::Minutes1, handlers)
        .await?;
    info!(id = subscription.id(), "subscribed");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
        () = tokio::time::sleep(Duration::from_secs(30)) => {}
    }

    manager.close().await?;
    Ok(())
}
