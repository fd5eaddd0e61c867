mod common;

use axum::http::StatusCode;
use binance_connect::core::errors::ExchangeError;
use binance_connect::core::kernel::{HmacSigner, RestClientBuilder, RestClientConfig, WsConfig};
use binance_connect::exchanges::binance::{
    BinanceRestClient, StreamHandlers, SubscriptionManager, UserDataConfig, UserDataState,
    UserDataStream, USER_DATA_SUBSCRIPTION_ID,
};
use common::{wait_until, Frame, MockRestServer, MockStreamServer};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const BALANCE_UPDATE: &str = r#"{"e":"balanceUpdate","E":1,"a":"BTC","d":"0.1","T":1}"#;

fn rest_client(base_url: String) -> Arc<BinanceRestClient> {
    let signer = HmacSigner::new("test_api_key".to_string(), "test_secret".to_string()).unwrap();
    let rest = RestClientBuilder::new(RestClientConfig::new(base_url, "binance".to_string()))
        .with_signer(Arc::new(signer))
        .build()
        .unwrap();
    Arc::new(BinanceRestClient::new(rest))
}

/// Issues `key-1`, `key-2`, ... on every POST; PUT answers with `put_status`.
async fn listen_key_server(put_status: StatusCode) -> MockRestServer {
    let issued = Arc::new(AtomicUsize::new(0));
    MockRestServer::start(move |request| match request.method.as_str() {
        "POST" => {
            let n = issued.fetch_add(1, Ordering::SeqCst) + 1;
            (StatusCode::OK, format!(r#"{{"listenKey":"key-{}"}}"#, n))
        }
        "PUT" => (put_status, "{}".to_string()),
        _ => (StatusCode::OK, "{}".to_string()),
    })
    .await
}

fn ws_config() -> WsConfig {
    WsConfig::default()
        .with_connect_timeout(Duration::from_secs(2))
        .with_reconnect(Duration::from_millis(100), Duration::from_secs(1), 3)
}

fn manager(rest: &MockRestServer, stream: &MockStreamServer) -> SubscriptionManager {
    SubscriptionManager::with_rest(rest_client(rest.base_url()), stream.base_url(), ws_config())
        .with_user_data_config(
            UserDataConfig::default().with_keepalive_interval(Duration::from_millis(200)),
        )
}

#[tokio::test]
async fn test_expired_listen_key_rotates_to_new_socket() {
    let rest = listen_key_server(StatusCode::OK).await;
    let stream = MockStreamServer::start(|index, _| match index {
        0 => vec![
            Frame::Text(BALANCE_UPDATE.to_string()),
            Frame::Text(r#"{"e":"listenKeyExpired","listenKey":"key-1"}"#.to_string()),
        ],
        _ => vec![Frame::Text(BALANCE_UPDATE.to_string())],
    })
    .await;
    let manager = manager(&rest, &stream);

    let balances = Arc::new(AtomicUsize::new(0));
    let expired = Arc::new(Mutex::new(Vec::new()));
    let reconnects = Arc::new(Mutex::new(Vec::new()));
    let disconnects = Arc::new(AtomicUsize::new(0));
    let (b, e, r, d) = (
        balances.clone(),
        expired.clone(),
        reconnects.clone(),
        disconnects.clone(),
    );
    let handlers = StreamHandlers::new()
        .on_balance_update(move |_| {
            b.fetch_add(1, Ordering::SeqCst);
        })
        .on_listen_key_expired(move |event| e.lock().unwrap().push(event.listen_key))
        .on_reconnect(move |attempt| r.lock().unwrap().push(attempt))
        .on_disconnect(move || {
            d.fetch_add(1, Ordering::SeqCst);
        });

    let subscription = manager.subscribe_user_data(handlers).await.unwrap();
    assert_eq!(subscription.id(), USER_DATA_SUBSCRIPTION_ID);

    // One balance update from each socket
    assert!(wait_until(Duration::from_secs(5), || balances.load(Ordering::SeqCst) == 2).await);
    println!("✅ handlers kept firing across rotation");

    assert_eq!(*expired.lock().unwrap(), vec!["key-1".to_string()]);
    assert!(wait_until(Duration::from_secs(2), || !reconnects.lock().unwrap().is_empty()).await);
    assert_eq!(*reconnects.lock().unwrap(), vec![1]);
    assert_eq!(rest.requests_to("POST", "/api/v3/userDataStream").len(), 2);

    let paths = stream.paths.lock().unwrap().clone();
    assert_eq!(paths, vec!["/ws/key-1".to_string(), "/ws/key-2".to_string()]);

    subscription.unsubscribe().await.unwrap();
    assert!(!manager.is_active(USER_DATA_SUBSCRIPTION_ID));
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);

    let deletes = rest.requests_to("DELETE", "/api/v3/userDataStream");
    assert_eq!(deletes.len(), 1);
    assert_eq!(deletes[0].query.get("listenKey").map(String::as_str), Some("key-2"));
}

#[tokio::test]
async fn test_keepalive_failures_do_not_stop_the_stream() {
    let rest = listen_key_server(StatusCode::INTERNAL_SERVER_ERROR).await;
    let stream = MockStreamServer::start(|_, _| Vec::new()).await;
    let manager = manager(&rest, &stream);

    let errors = Arc::new(AtomicUsize::new(0));
    let sink = errors.clone();
    let subscription = manager
        .subscribe_user_data(StreamHandlers::new().on_error(move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
        }))
        .await
        .unwrap();

    assert!(
        wait_until(Duration::from_secs(3), || {
            rest.requests_to("PUT", "/api/v3/userDataStream").len() >= 2
        })
        .await
    );

    let puts = rest.requests_to("PUT", "/api/v3/userDataStream");
    assert!(puts[0].body.contains("listenKey=key-1"));
    assert_eq!(puts[0].api_key.as_deref(), Some("test_api_key"));
    assert!(manager.is_active(USER_DATA_SUBSCRIPTION_ID));
    assert_eq!(errors.load(Ordering::SeqCst), 0);
    assert_eq!(stream.connection_count(), 1);

    subscription.unsubscribe().await.unwrap();

    // Keepalive stops with the subscription
    let count = rest.requests_to("PUT", "/api/v3/userDataStream").len();
    tokio::time::sleep(Duration::from_millis(500)).await;
    // A request already on the wire at cancellation may still land
    assert!(rest.requests_to("PUT", "/api/v3/userDataStream").len() <= count + 1);
}

#[tokio::test]
async fn test_duplicate_user_data_subscription_is_rejected() {
    let rest = listen_key_server(StatusCode::OK).await;
    let stream = MockStreamServer::start(|_, _| Vec::new()).await;
    let manager = manager(&rest, &stream);

    let _first = manager
        .subscribe_user_data(StreamHandlers::new())
        .await
        .unwrap();
    let second = manager.subscribe_user_data(StreamHandlers::new()).await;
    assert!(matches!(second, Err(ref e) if e.is_duplicate_subscription()));

    // Rejected before any listen key was requested
    assert_eq!(rest.requests_to("POST", "/api/v3/userDataStream").len(), 1);

    manager.close().await.unwrap();
    assert_eq!(rest.requests_to("DELETE", "/api/v3/userDataStream").len(), 1);
}

#[tokio::test]
async fn test_empty_listen_key_fails_subscribe() {
    let rest = MockRestServer::start(|_| (StatusCode::OK, r#"{"listenKey":""}"#.to_string())).await;
    let stream = MockStreamServer::start(|_, _| Vec::new()).await;
    let manager = manager(&rest, &stream);

    let result = manager.subscribe_user_data(StreamHandlers::new()).await;
    assert!(matches!(result, Err(ExchangeError::ProtocolError(_))));
    assert!(manager.active_subscription_ids().is_empty());
    assert_eq!(stream.connection_count(), 0);
}

#[tokio::test]
async fn test_concurrent_duplicate_does_not_release_shared_key() {
    // The exchange hands out one key per account
    let rest = MockRestServer::start(|_| (StatusCode::OK, r#"{"listenKey":"SAME"}"#.to_string())).await;
    let stream = MockStreamServer::start(|_, _| Vec::new()).await;
    let manager = manager(&rest, &stream);

    let (a, b) = tokio::join!(
        manager.subscribe_user_data(StreamHandlers::new()),
        manager.subscribe_user_data(StreamHandlers::new())
    );
    let rejected = match (&a, &b) {
        (Ok(_), Err(e)) | (Err(e), Ok(_)) => e,
        _ => panic!("exactly one subscribe must win: {:?} / {:?}", a, b),
    };
    assert!(rejected.is_duplicate_subscription(), "unexpected error: {}", rejected);

    assert_eq!(manager.active_subscription_ids(), vec![USER_DATA_SUBSCRIPTION_ID.to_string()]);
    assert_eq!(rest.requests_to("POST", "/api/v3/userDataStream").len(), 1);
    assert!(rest.requests_to("DELETE", "/api/v3/userDataStream").is_empty());
    println!("✅ losing subscribe left the live key alone");

    manager.close().await.unwrap();
    assert_eq!(rest.requests_to("DELETE", "/api/v3/userDataStream").len(), 1);
}

#[tokio::test]
async fn test_rotation_gives_up_at_reconnect_cap() {
    // First key is issued, every rotation POST fails
    let issued = Arc::new(AtomicUsize::new(0));
    let rest = MockRestServer::start(move |request| match request.method.as_str() {
        "POST" if issued.fetch_add(1, Ordering::SeqCst) == 0 => {
            (StatusCode::OK, r#"{"listenKey":"key-1"}"#.to_string())
        }
        "POST" => (
            StatusCode::INTERNAL_SERVER_ERROR,
            r#"{"code":-1001,"msg":"Internal error"}"#.to_string(),
        ),
        _ => (StatusCode::OK, "{}".to_string()),
    })
    .await;
    let stream = MockStreamServer::start(|_, _| {
        vec![Frame::Text(r#"{"e":"listenKeyExpired","listenKey":"key-1"}"#.to_string())]
    })
    .await;
    let manager = manager(&rest, &stream);

    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    let _subscription = manager
        .subscribe_user_data(StreamHandlers::new().on_error(move |err| sink.lock().unwrap().push(err)))
        .await
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || !errors.lock().unwrap().is_empty()).await);
    tokio::time::sleep(Duration::from_millis(500)).await;

    // One acquire plus exactly three rotation attempts
    assert_eq!(rest.requests_to("POST", "/api/v3/userDataStream").len(), 4);
    let errors = errors.lock().unwrap();
    assert_eq!(errors.len(), 1, "errors: {:?}", errors);
    assert!(matches!(
        errors[0],
        ExchangeError::ReconnectLimitReached { attempts: 3 }
    ));
    println!("✅ rotation stopped after 3 attempts");
}

#[tokio::test]
async fn test_failed_switch_reuses_and_then_releases_new_key() {
    let rest = listen_key_server(StatusCode::OK).await;
    let stream = MockStreamServer::start(|index, _| match index {
        0 => vec![Frame::Text(r#"{"e":"listenKeyExpired","listenKey":"key-1"}"#.to_string())],
        _ => Vec::new(),
    })
    .await;
    stream.reject_path("/ws/key-2");

    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    let user_data = UserDataStream::start(
        rest_client(rest.base_url()),
        &stream.base_url(),
        ws_config(),
        UserDataConfig::default(),
        StreamHandlers::new().on_error(move |err| sink.lock().unwrap().push(err)),
    )
    .await
    .unwrap();

    assert!(wait_until(Duration::from_secs(5), || !errors.lock().unwrap().is_empty()).await);
    assert!(matches!(
        errors.lock().unwrap()[0],
        ExchangeError::ReconnectLimitReached { attempts: 3 }
    ));

    // Every dial retried the same new key instead of requesting more
    assert_eq!(rest.requests_to("POST", "/api/v3/userDataStream").len(), 2);
    assert_eq!(stream.rejections.load(Ordering::SeqCst), 3);

    // The held key never moved off the last socket that opened
    assert_eq!(user_data.listen_key(), "key-1");
    assert_eq!(user_data.state(), UserDataState::Failed);

    // The orphaned key was handed back
    assert!(
        wait_until(Duration::from_secs(2), || {
            rest.requests_to("DELETE", "/api/v3/userDataStream")
                .iter()
                .any(|r| r.query.get("listenKey").map(String::as_str) == Some("key-2"))
        })
        .await
    );

    user_data.unsubscribe().await.unwrap();
    let deleted: Vec<String> = rest
        .requests_to("DELETE", "/api/v3/userDataStream")
        .iter()
        .filter_map(|r| r.query.get("listenKey").cloned())
        .collect();
    assert_eq!(deleted, vec!["key-2".to_string(), "key-1".to_string()]);
}
