use crate::core::errors::ExchangeError;
use crate::core::kernel::{ReqwestRest, RestClient, RestRequest};
use crate::core::types::KlineInterval;
use crate::exchanges::binance::types::{
    BinanceAccountInfo, BinanceExchangeInfo, BinanceOrder, BinanceOrderRequest,
    BinanceOrderResponse, BinanceRestKline, ListenKeyResponse, MyTrade, OrderBookSnapshot,
    RecentTrade, ServerTime, Ticker24hr, TickerPrice,
};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

const USER_DATA_STREAM_ENDPOINT: &str = "/api/v3/userDataStream";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Thin typed wrapper around `RestClient` for Binance API
///
/// Every call runs under a child of the client's cancellation token;
/// `cancel_all_requests` aborts whatever is in flight and later calls
/// start from a fresh token.
pub struct BinanceRestClient<R: RestClient = ReqwestRest> {
    client: R,
    cancel: Mutex<CancellationToken>,
}

impl<R: RestClient> BinanceRestClient<R> {
    pub fn new(client: R) -> Self {
        Self {
            client,
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn with_cancellation_token(self, token: CancellationToken) -> Self {
        *lock(&self.cancel) = token;
        self
    }

    /// Token the next call will be tied to.
    pub fn cancellation_token(&self) -> CancellationToken {
        lock(&self.cancel).clone()
    }

    pub fn cancel_all_requests(&self) {
        let mut token = lock(&self.cancel);
        token.cancel();
        *token = CancellationToken::new();
    }

    pub fn inner(&self) -> &R {
        &self.client
    }

    /// Run any call on this client, aborting it with `Cancelled` as soon as
    /// `token` fires.
    pub async fn with_cancel<T, F>(
        &self,
        token: &CancellationToken,
        call: F,
    ) -> Result<T, ExchangeError>
    where
        F: Future<Output = Result<T, ExchangeError>>,
    {
        tokio::select! {
            () = token.cancelled() => Err(ExchangeError::Cancelled),
            result = call => result,
        }
    }

    /// Send a raw request. A token already set with `RestRequest::cancel_on`
    /// is honoured alongside the client's own.
    pub async fn execute(&self, request: RestRequest) -> Result<String, ExchangeError> {
        self.send(request).await
    }

    async fn send(&self, mut request: RestRequest) -> Result<String, ExchangeError> {
        let scope = lock(&self.cancel).child_token();
        match request.cancel.take() {
            Some(caller) => {
                self.with_cancel(&caller, self.client.execute(request.cancel_on(scope)))
                    .await
            }
            None => self.client.execute(request.cancel_on(scope)).await,
        }
    }

    async fn call<T: DeserializeOwned>(&self, request: RestRequest) -> Result<T, ExchangeError> {
        let body = self.send(request).await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// Test connectivity
    pub async fn ping(&self) -> Result<(), ExchangeError> {
        self.send(RestRequest::get("/api/v3/ping")).await.map(|_| ())
    }

    pub async fn server_time(&self) -> Result<ServerTime, ExchangeError> {
        self.call(RestRequest::get("/api/v3/time")).await
    }

    /// Get exchange information
    pub async fn exchange_info(
        &self,
        symbol: Option<&str>,
    ) -> Result<BinanceExchangeInfo, ExchangeError> {
        self.call(RestRequest::get("/api/v3/exchangeInfo").optional_param("symbol", symbol))
            .await
    }

    pub async fn ticker_24hr(&self, symbol: &str) -> Result<Ticker24hr, ExchangeError> {
        self.call(RestRequest::get("/api/v3/ticker/24hr").param("symbol", symbol))
            .await
    }

    pub async fn ticker_price(&self, symbol: &str) -> Result<TickerPrice, ExchangeError> {
        self.call(RestRequest::get("/api/v3/ticker/price").param("symbol", symbol))
            .await
    }

    pub async fn order_book(
        &self,
        symbol: &str,
        limit: Option<u32>,
    ) -> Result<OrderBookSnapshot, ExchangeError> {
        self.call(
            RestRequest::get("/api/v3/depth")
                .param("symbol", symbol)
                .optional_param("limit", limit),
        )
        .await
    }

    pub async fn recent_trades(
        &self,
        symbol: &str,
        limit: Option<u32>,
    ) -> Result<Vec<RecentTrade>, ExchangeError> {
        self.call(
            RestRequest::get("/api/v3/trades")
                .param("symbol", symbol)
                .optional_param("limit", limit),
        )
        .await
    }

    /// Get klines/candlestick data
    pub async fn klines(
        &self,
        symbol: &str,
        interval: KlineInterval,
        limit: Option<u32>,
        start_time: Option<i64>,
        end_time: Option<i64>,
    ) -> Result<Vec<BinanceRestKline>, ExchangeError> {
        self.call(
            RestRequest::get("/api/v3/klines")
                .param("symbol", symbol)
                .param("interval", interval.as_str())
                .optional_param("limit", limit)
                .optional_param("startTime", start_time)
                .optional_param("endTime", end_time),
        )
        .await
    }

    /// Get account information
    pub async fn account(&self) -> Result<BinanceAccountInfo, ExchangeError> {
        self.call(RestRequest::get("/api/v3/account").signed()).await
    }

    /// Place an order; parameters travel in the form body.
    #[instrument(skip(self, order), fields(symbol = %order.symbol, side = order.side.as_str()))]
    pub async fn new_order(
        &self,
        order: &BinanceOrderRequest,
    ) -> Result<BinanceOrderResponse, ExchangeError> {
        self.call(
            RestRequest::post("/api/v3/order")
                .params(&order.to_params())
                .signed(),
        )
        .await
    }

    pub async fn query_order(
        &self,
        symbol: &str,
        order_id: Option<i64>,
        orig_client_order_id: Option<&str>,
    ) -> Result<BinanceOrder, ExchangeError> {
        let request = order_lookup(
            RestRequest::get("/api/v3/order"),
            symbol,
            order_id,
            orig_client_order_id,
        )?;
        self.call(request.signed()).await
    }

    /// Cancel an order
    pub async fn cancel_order(
        &self,
        symbol: &str,
        order_id: Option<i64>,
        orig_client_order_id: Option<&str>,
    ) -> Result<BinanceOrderResponse, ExchangeError> {
        let request = order_lookup(
            RestRequest::delete("/api/v3/order"),
            symbol,
            order_id,
            orig_client_order_id,
        )?;
        self.call(request.signed()).await
    }

    pub async fn open_orders(&self, symbol: Option<&str>) -> Result<Vec<BinanceOrder>, ExchangeError> {
        self.call(
            RestRequest::get("/api/v3/openOrders")
                .optional_param("symbol", symbol)
                .signed(),
        )
        .await
    }

    pub async fn all_orders(
        &self,
        symbol: &str,
        limit: Option<u32>,
    ) -> Result<Vec<BinanceOrder>, ExchangeError> {
        self.call(
            RestRequest::get("/api/v3/allOrders")
                .param("symbol", symbol)
                .optional_param("limit", limit)
                .signed(),
        )
        .await
    }

    pub async fn my_trades(
        &self,
        symbol: &str,
        limit: Option<u32>,
    ) -> Result<Vec<MyTrade>, ExchangeError> {
        self.call(
            RestRequest::get("/api/v3/myTrades")
                .param("symbol", symbol)
                .optional_param("limit", limit)
                .signed(),
        )
        .await
    }

    /// Issue a fresh listen key for the user data stream.
    pub async fn start_user_data_stream(&self) -> Result<String, ExchangeError> {
        let response: ListenKeyResponse = self
            .call(RestRequest::post(USER_DATA_STREAM_ENDPOINT).with_api_key())
            .await?;
        if response.listen_key.is_empty() {
            return Err(ExchangeError::ProtocolError(
                "server returned an empty listenKey".to_string(),
            ));
        }
        Ok(response.listen_key)
    }

    pub async fn keepalive_user_data_stream(&self, listen_key: &str) -> Result<(), ExchangeError> {
        self.send(
            RestRequest::put(USER_DATA_STREAM_ENDPOINT)
                .param("listenKey", listen_key)
                .with_api_key(),
        )
        .await
        .map(|_| ())
    }

    pub async fn close_user_data_stream(&self, listen_key: &str) -> Result<(), ExchangeError> {
        self.send(
            RestRequest::delete(USER_DATA_STREAM_ENDPOINT)
                .param("listenKey", listen_key)
                .with_api_key(),
        )
        .await
        .map(|_| ())
    }
}

fn order_lookup(
    request: RestRequest,
    symbol: &str,
    order_id: Option<i64>,
    orig_client_order_id: Option<&str>,
) -> Result<RestRequest, ExchangeError> {
    if order_id.is_none() && orig_client_order_id.is_none() {
        return Err(ExchangeError::InvalidParameters(
            "either orderId or origClientOrderId is required".to_string(),
        ));
    }
    Ok(request
        .param("symbol", symbol)
        .optional_param("orderId", order_id)
        .optional_param("origClientOrderId", orig_client_order_id))
}
