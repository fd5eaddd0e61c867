use binance_connect::core::config::{AppConfig, ConfigError, ExchangeConfig};
use binance_connect::exchanges::binance::{build_rest_client, create_subscription_manager};
use std::io::Write;
use tempfile::NamedTempFile;

const CONFIG: &str = r#"
accounts:
  binance:
    - name: main
      api_key: "main_key"
      api_secret: "main_secret"
      sandbox: true
      timeout: 10
    - name: watcher
      sandbox: false
      base_url: "http://127.0.0.1:9100"
      ws_base_url: "ws://127.0.0.1:9101/"
market:
  binance: [BTCUSDT, ETHUSDT]
"#;

fn config_file() -> NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    file.write_all(CONFIG.as_bytes()).unwrap();
    file
}

#[test]
fn test_first_account_is_the_default() {
    let file = config_file();
    let config = ExchangeConfig::from_yaml_file(file.path(), None).unwrap();

    assert!(config.has_credentials());
    assert!(config.testnet);
    assert_eq!(config.timeout_seconds, 10);
    assert_eq!(config.rest_base_url(), "https://testnet.binance.vision");

    let rest = build_rest_client(&config).unwrap();
    assert!(rest.has_signer());
    assert_eq!(rest.config().timeout_seconds, 10);
}

#[test]
fn test_named_read_only_account() {
    let file = config_file();
    let config = ExchangeConfig::from_yaml_file(file.path(), Some("watcher")).unwrap();

    assert!(!config.has_credentials());
    assert_eq!(config.rest_base_url(), "http://127.0.0.1:9100");
    assert_eq!(config.stream_base_url(), "ws://127.0.0.1:9101");

    let manager = create_subscription_manager(&config).unwrap();
    assert!(manager.rest().is_none());
    println!("✅ read-only account builds a market data manager");
}

#[test]
fn test_symbols_and_missing_account() {
    let file = config_file();
    let app = AppConfig::from_yaml_file(file.path()).unwrap();
    assert_eq!(app.binance_symbols(), ["BTCUSDT", "ETHUSDT"]);

    match app.binance_account_by_name("nobody") {
        Err(ConfigError::AccountNotFound(name)) => assert_eq!(name, "binance/nobody"),
        other => panic!("expected AccountNotFound, got {:?}", other),
    }
}

#[test]
fn test_missing_file_is_reported() {
    let result = AppConfig::from_yaml_file("/nonexistent/binance-connect.yaml");
    assert!(matches!(result, Err(ConfigError::InvalidConfiguration(_))));
}
