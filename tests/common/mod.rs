#![allow(dead_code)]

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode as WsStatusCode;
use tokio_tungstenite::tungstenite::Message;

/// What the mock stream server does with one accepted socket.
#[derive(Debug, Clone)]
pub enum Frame {
    Text(String),
    /// Send a close frame and drop the socket.
    Close,
}

/// Local websocket server scripted per connection.
///
/// The script receives the connection index (0-based) and the request path.
pub struct MockStreamServer {
    pub addr: SocketAddr,
    pub paths: Arc<Mutex<Vec<String>>>,
    pub received: Arc<Mutex<Vec<String>>>,
    pub pings: Arc<AtomicUsize>,
    pub closes: Arc<AtomicUsize>,
    /// Handshakes refused because their path was rejected
    pub rejections: Arc<AtomicUsize>,
    rejected_paths: Arc<Mutex<HashSet<String>>>,
    accept_loop: JoinHandle<()>,
}

impl MockStreamServer {
    pub async fn start<F>(script: F) -> Self
    where
        F: Fn(usize, &str) -> Vec<Frame> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let paths = Arc::new(Mutex::new(Vec::new()));
        let received = Arc::new(Mutex::new(Vec::new()));
        let pings = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        let rejections = Arc::new(AtomicUsize::new(0));
        let rejected_paths = Arc::new(Mutex::new(HashSet::new()));
        let script = Arc::new(script);

        let accept_loop = {
            let (paths, received, pings, closes) =
                (paths.clone(), received.clone(), pings.clone(), closes.clone());
            let (rejections, rejected_paths) = (rejections.clone(), rejected_paths.clone());
            tokio::spawn(async move {
                let mut index = 0;
                while let Ok((stream, _)) = listener.accept().await {
                    let seen_path = Arc::new(Mutex::new(String::new()));
                    let capture = seen_path.clone();
                    let (refused, refused_count) = (rejected_paths.clone(), rejections.clone());
                    let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                        let uri = req.uri().to_string();
                        if refused.lock().unwrap().contains(&uri) {
                            refused_count.fetch_add(1, Ordering::SeqCst);
                            let mut refusal = ErrorResponse::new(Some("rejected".to_string()));
                            *refusal.status_mut() = WsStatusCode::FORBIDDEN;
                            return Err(refusal);
                        }
                        *capture.lock().unwrap() = uri;
                        Ok(resp)
                    };
                    let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await
                    else {
                        continue;
                    };

                    let path = seen_path.lock().unwrap().clone();
                    paths.lock().unwrap().push(path.clone());
                    let frames = script(index, &path);
                    index += 1;

                    let (received, pings, closes) = (received.clone(), pings.clone(), closes.clone());
                    tokio::spawn(async move {
                        for frame in frames {
                            match frame {
                                Frame::Text(text) => {
                                    if ws.send(Message::Text(text)).await.is_err() {
                                        return;
                                    }
                                }
                                Frame::Close => {
                                    let _ = ws.send(Message::Close(None)).await;
                                    return;
                                }
                            }
                        }

                        while let Some(Ok(message)) = ws.next().await {
                            match message {
                                Message::Text(text) => received.lock().unwrap().push(text),
                                Message::Ping(_) => {
                                    pings.fetch_add(1, Ordering::SeqCst);
                                }
                                Message::Close(_) => {
                                    closes.fetch_add(1, Ordering::SeqCst);
                                    break;
                                }
                                _ => {}
                            }
                        }
                    });
                }
            })
        };

        Self {
            addr,
            paths,
            received,
            pings,
            closes,
            rejections,
            rejected_paths,
            accept_loop,
        }
    }

    /// Refuse every later handshake for `path`.
    pub fn reject_path(&self, path: &str) {
        self.rejected_paths.lock().unwrap().insert(path.to_string());
    }

    pub fn base_url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn connection_count(&self) -> usize {
        self.paths.lock().unwrap().len()
    }

    /// Stop accepting; later dials are refused.
    pub fn stop_accepting(&self) {
        self.accept_loop.abort();
    }
}

impl Drop for MockStreamServer {
    fn drop(&mut self) {
        self.accept_loop.abort();
    }
}

/// One HTTP request as seen by the mock REST server.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
    pub raw_query: String,
    pub body: String,
    pub api_key: Option<String>,
    pub content_type: Option<String>,
}

type Responder = dyn Fn(&RecordedRequest) -> (StatusCode, String) + Send + Sync;

#[derive(Clone)]
struct RestState {
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    responder: Arc<Responder>,
}

/// Local HTTP server that records every request and answers via a closure.
pub struct MockRestServer {
    pub addr: SocketAddr,
    pub requests: Arc<Mutex<Vec<RecordedRequest>>>,
    server: JoinHandle<()>,
}

impl MockRestServer {
    pub async fn start<F>(responder: F) -> Self
    where
        F: Fn(&RecordedRequest) -> (StatusCode, String) + Send + Sync + 'static,
    {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let state = RestState {
            requests: requests.clone(),
            responder: Arc::new(responder),
        };
        let app = axum::Router::new().fallback(record).with_state(state);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            requests,
            server,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_to(&self, method: &str, path: &str) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == method && r.path == path)
            .collect()
    }
}

impl Drop for MockRestServer {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn record(
    State(state): State<RestState>,
    method: Method,
    uri: Uri,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string)
    };
    let request = RecordedRequest {
        method: method.to_string(),
        path: uri.path().to_string(),
        query,
        raw_query: uri.query().unwrap_or_default().to_string(),
        body: String::from_utf8_lossy(&body).into_owned(),
        api_key: header("x-mbx-apikey"),
        content_type: header("content-type"),
    };

    let (status, body) = (state.responder)(&request);
    state.requests.lock().unwrap().push(request);
    (status, body)
}

/// Poll `condition` every 20ms until it holds or `within` elapses.
pub async fn wait_until(within: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

pub fn trade_frame(trade_id: i64) -> String {
    format!(
        r#"{{"e":"trade","E":1,"s":"BTCUSDT","t":{},"p":"1.0","q":"1.0","T":1,"m":true}}"#,
        trade_id
    )
}

pub fn kline_frame() -> String {
    r#"{"e":"kline","E":1,"s":"BTCUSDT","k":{"t":0,"T":59999,"s":"BTCUSDT","i":"1m","f":1,"L":2,"o":"1.0","c":"2.0","h":"2.5","l":"0.5","v":"10","n":2,"x":false,"q":"15","V":"5","Q":"7"}}"#
        .to_string()
}
