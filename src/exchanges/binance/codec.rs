use crate::core::errors::ExchangeError;
use crate::core::kernel::WsCodec;
use crate::exchanges::binance::handlers::StreamHandlers;
use crate::exchanges::binance::types::{
    AccountPositionEvent, AggTradeEvent, BalanceUpdateEvent, BookTickerEvent, DepthUpdateEvent,
    ExecutionReportEvent, KlineEvent, ListStatusEvent, ListenKeyExpiredEvent, MiniTickerEvent,
    PartialDepthEvent, TickerEvent, TradeEvent,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// One decoded stream event, tagged by family.
#[derive(Debug, Clone)]
pub enum BinanceMessage {
    Kline(KlineEvent),
    AggTrade(AggTradeEvent),
    Trade(TradeEvent),
    DepthUpdate(DepthUpdateEvent),
    PartialDepth(PartialDepthEvent),
    Ticker(TickerEvent),
    MiniTicker(MiniTickerEvent),
    /// `!miniTicker@arr`, in array order
    MiniTickers(Vec<MiniTickerEvent>),
    BookTicker(BookTickerEvent),
    AccountPosition(AccountPositionEvent),
    BalanceUpdate(BalanceUpdateEvent),
    ExecutionReport(ExecutionReportEvent),
    ListStatus(ListStatusEvent),
    ListenKeyExpired(ListenKeyExpiredEvent),
}

#[derive(Deserialize)]
struct ErrorReply {
    code: i32,
    msg: String,
}

/// Stream router: decodes frames into `BinanceMessage` and dispatches them.
///
/// Discrimination runs in this order:
/// 1. `{"stream": .., "data": ..}` envelopes are unwrapped first.
/// 2. A string `e` field selects the event family; unknown values are dropped.
/// 3. A top-level `lastUpdateId` marks a partial depth snapshot.
/// 4. `u`, `s`, `b` and `a` without `e` mark a book ticker.
/// 5. Arrays are `!miniTicker@arr` batches.
///
/// Control replies (`{"result":..,"id":..}`) are consumed silently; error
/// replies become `ApiError`.
#[derive(Debug, Default)]
pub struct BinanceCodec {
    next_request_id: AtomicU64,
}

impl BinanceCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode `text` and hand the result to `handlers`.
    ///
    /// Decode failures go to the error handler; they never close the connection.
    pub fn route(&self, text: &str, handlers: &StreamHandlers) {
        match self.decode_message(text) {
            Ok(Some(message)) => handlers.dispatch(message),
            Ok(None) => {}
            Err(e) => handlers.emit_error(e),
        }
    }

    fn request(&self, method: &str, streams: &[impl AsRef<str> + Send + Sync]) -> String {
        let params: Vec<&str> = streams.iter().map(AsRef::as_ref).collect();
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed) + 1;
        json!({
            "method": method,
            "params": params,
            "id": id,
        })
        .to_string()
    }

    fn decode_value(&self, value: Value) -> Result<Option<BinanceMessage>, ExchangeError> {
        if let Value::Array(items) = value {
            return items
                .into_iter()
                .map(serde_json::from_value::<MiniTickerEvent>)
                .collect::<Result<Vec<_>, _>>()
                .map(|events| Some(BinanceMessage::MiniTickers(events)))
                .map_err(|e| decode_error("24hrMiniTicker", &e));
        }

        if let Some(event_type) = value.get("e").and_then(Value::as_str) {
            return self.decode_event(event_type.to_string(), value);
        }

        if value.get("lastUpdateId").is_some() {
            return decode::<PartialDepthEvent>("partialDepth", value)
                .map(|e| Some(BinanceMessage::PartialDepth(e)));
        }

        if ["u", "s", "b", "a"].iter().all(|key| value.get(key).is_some()) {
            return decode::<BookTickerEvent>("bookTicker", value)
                .map(|e| Some(BinanceMessage::BookTicker(e)));
        }

        if let Some(error) = value.get("error") {
            let reply: ErrorReply = serde_json::from_value(error.clone())
                .map_err(|e| decode_error("error reply", &e))?;
            return Err(ExchangeError::ApiError {
                code: reply.code,
                message: reply.msg,
            });
        }

        if value.get("result").is_some() && value.get("id").is_some() {
            debug!("control reply: {}", value);
            return Ok(None);
        }

        warn!("dropping frame without a recognised shape: {}", value);
        Ok(None)
    }

    fn decode_event(
        &self,
        event_type: String,
        value: Value,
    ) -> Result<Option<BinanceMessage>, ExchangeError> {
        let message = match event_type.as_str() {
            "kline" => BinanceMessage::Kline(decode("kline", value)?),
            "aggTrade" => BinanceMessage::AggTrade(decode("aggTrade", value)?),
            "trade" => BinanceMessage::Trade(decode("trade", value)?),
            "depthUpdate" => BinanceMessage::DepthUpdate(decode("depthUpdate", value)?),
            "24hrTicker" => BinanceMessage::Ticker(decode("24hrTicker", value)?),
            "24hrMiniTicker" => BinanceMessage::MiniTicker(decode("24hrMiniTicker", value)?),
            "outboundAccountPosition" => {
                BinanceMessage::AccountPosition(decode("outboundAccountPosition", value)?)
            }
            "balanceUpdate" => BinanceMessage::BalanceUpdate(decode("balanceUpdate", value)?),
            "executionReport" => {
                BinanceMessage::ExecutionReport(decode("executionReport", value)?)
            }
            "listStatus" => BinanceMessage::ListStatus(decode("listStatus", value)?),
            "listenKeyExpired" => {
                BinanceMessage::ListenKeyExpired(decode("listenKeyExpired", value)?)
            }
            other => {
                warn!(event = other, "dropping unknown event type");
                return Ok(None);
            }
        };
        Ok(Some(message))
    }
}

fn decode<T: DeserializeOwned>(family: &str, value: Value) -> Result<T, ExchangeError> {
    serde_json::from_value(value).map_err(|e| decode_error(family, &e))
}

fn decode_error(family: &str, err: &serde_json::Error) -> ExchangeError {
    ExchangeError::ProtocolError(format!("failed to decode {} event: {}", family, err))
}

impl WsCodec for BinanceCodec {
    type Message = BinanceMessage;

    fn encode_subscription(
        &self,
        streams: &[impl AsRef<str> + Send + Sync],
    ) -> Result<String, ExchangeError> {
        if streams.is_empty() {
            return Err(ExchangeError::InvalidParameters(
                "at least one stream is required".to_string(),
            ));
        }
        Ok(self.request("SUBSCRIBE", streams))
    }

    fn encode_unsubscription(
        &self,
        streams: &[impl AsRef<str> + Send + Sync],
    ) -> Result<String, ExchangeError> {
        if streams.is_empty() {
            return Err(ExchangeError::InvalidParameters(
                "at least one stream is required".to_string(),
            ));
        }
        Ok(self.request("UNSUBSCRIBE", streams))
    }

    fn decode_message(&self, text: &str) -> Result<Option<Self::Message>, ExchangeError> {
        let mut value: Value = serde_json::from_str(text)
            .map_err(|e| ExchangeError::ProtocolError(format!("malformed frame: {}", e)))?;

        // Combined stream envelope
        if value.get("stream").and_then(Value::as_str).is_some() {
            if let Some(data) = value.get_mut("data").map(Value::take) {
                value = data;
            } else {
                return Err(ExchangeError::ProtocolError(
                    "combined stream frame without data".to_string(),
                ));
            }
        }

        self.decode_value(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_ids_increase() {
        let codec = BinanceCodec::new();
        let first: Value =
            serde_json::from_str(&codec.encode_subscription(&["btcusdt@trade"]).unwrap()).unwrap();
        let second: Value =
            serde_json::from_str(&codec.encode_unsubscription(&["btcusdt@trade"]).unwrap()).unwrap();

        assert_eq!(first["method"], "SUBSCRIBE");
        assert_eq!(first["params"][0], "btcusdt@trade");
        assert_eq!(second["method"], "UNSUBSCRIBE");
        assert!(second["id"].as_u64().unwrap() > first["id"].as_u64().unwrap());
        assert!(codec.encode_subscription(&[] as &[&str]).is_err());
    }

    #[test]
    fn test_combined_envelope_is_unwrapped() {
        let codec = BinanceCodec::new();
        let frame = r#"{"stream":"bnbusdt@bookTicker","data":{"u":400900217,"s":"BNBUSDT","b":"25.35","B":"31.21","a":"25.36","A":"40.66"}}"#;
        match codec.decode_message(frame).unwrap() {
            Some(BinanceMessage::BookTicker(event)) => {
                assert_eq!(event.symbol, "BNBUSDT");
                assert_eq!(event.update_id, 400_900_217);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_control_and_error_replies() {
        let codec = BinanceCodec::new();
        assert!(codec
            .decode_message(r#"{"result":null,"id":1}"#)
            .unwrap()
            .is_none());

        let err = codec
            .decode_message(r#"{"error":{"code":2,"msg":"Invalid request"},"id":2}"#)
            .unwrap_err();
        assert!(matches!(err, ExchangeError::ApiError { code: 2, .. }));
    }

    #[test]
    fn test_mini_ticker_array() {
        let codec = BinanceCodec::new();
        let frame = r#"[
            {"e":"24hrMiniTicker","E":1,"s":"BTCUSDT","c":"1","o":"1","h":"1","l":"1","v":"1","q":"1"},
            {"e":"24hrMiniTicker","E":1,"s":"ETHUSDT","c":"2","o":"2","h":"2","l":"2","v":"2","q":"2"}
        ]"#;
        match codec.decode_message(frame).unwrap() {
            Some(BinanceMessage::MiniTickers(events)) => {
                let symbols: Vec<_> = events.iter().map(|e| e.symbol.as_str()).collect();
                assert_eq!(symbols, vec!["BTCUSDT", "ETHUSDT"]);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_known_event_with_bad_payload_is_protocol_error() {
        let codec = BinanceCodec::new();
        let err = codec
            .decode_message(r#"{"e":"trade","E":1,"s":"BTCUSDT"}"#)
            .unwrap_err();
        assert!(matches!(err, ExchangeError::ProtocolError(_)));
    }

    #[test]
    fn test_malformed_json() {
        let codec = BinanceCodec::new();
        assert!(matches!(
            codec.decode_message("not json"),
            Err(ExchangeError::ProtocolError(_))
        ));
    }
}
