use crate::core::errors::ExchangeError;
use crate::core::types::{DepthLevels, KlineInterval};
use std::fmt;

/// Subscription id of the single user data stream a manager may hold.
pub const USER_DATA_SUBSCRIPTION_ID: &str = "userData";

/// One market data stream family plus its parameters.
///
/// Symbols are lowercased both in the subscription id and in the stream
/// name; the server only accepts lowercase stream names.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Kline {
        symbol: String,
        interval: KlineInterval,
    },
    AggTrade {
        symbol: String,
    },
    Trade {
        symbol: String,
    },
    PartialDepth {
        symbol: String,
        levels: DepthLevels,
        fast: bool,
    },
    DiffDepth {
        symbol: String,
        fast: bool,
    },
    Ticker {
        symbol: String,
    },
    MiniTicker {
        symbol: String,
    },
    AllMiniTickers,
    BookTicker {
        symbol: String,
    },
    AllBookTickers,
}

impl StreamKind {
    pub fn kline(symbol: &str, interval: KlineInterval) -> Self {
        Self::Kline {
            symbol: symbol.to_lowercase(),
            interval,
        }
    }

    pub fn agg_trade(symbol: &str) -> Self {
        Self::AggTrade {
            symbol: symbol.to_lowercase(),
        }
    }

    pub fn trade(symbol: &str) -> Self {
        Self::Trade {
            symbol: symbol.to_lowercase(),
        }
    }

    /// Top-N book snapshot; `levels` must be 5, 10 or 20.
    pub fn partial_depth(symbol: &str, levels: u32, fast: bool) -> Result<Self, ExchangeError> {
        Ok(Self::PartialDepth {
            symbol: symbol.to_lowercase(),
            levels: DepthLevels::try_from(levels)?,
            fast,
        })
    }

    pub fn diff_depth(symbol: &str, fast: bool) -> Self {
        Self::DiffDepth {
            symbol: symbol.to_lowercase(),
            fast,
        }
    }

    pub fn ticker(symbol: &str) -> Self {
        Self::Ticker {
            symbol: symbol.to_lowercase(),
        }
    }

    pub fn mini_ticker(symbol: &str) -> Self {
        Self::MiniTicker {
            symbol: symbol.to_lowercase(),
        }
    }

    pub fn book_ticker(symbol: &str) -> Self {
        Self::BookTicker {
            symbol: symbol.to_lowercase(),
        }
    }

    /// Canonical subscription id, e.g. `kline_btcusdt_1m` or `depth_btcusdt_10_100ms`.
    pub fn id(&self) -> String {
        match self {
            Self::Kline { symbol, interval } => {
                format!("kline_{}_{}", symbol.to_lowercase(), interval)
            }
            Self::AggTrade { symbol } => format!("aggTrade_{}", symbol.to_lowercase()),
            Self::Trade { symbol } => format!("trade_{}", symbol.to_lowercase()),
            Self::PartialDepth {
                symbol,
                levels,
                fast,
            } => format!(
                "depth_{}_{}{}",
                symbol.to_lowercase(),
                levels.as_u32(),
                if *fast { "_100ms" } else { "" }
            ),
            Self::DiffDepth { symbol, fast } => format!(
                "depthUpdate_{}{}",
                symbol.to_lowercase(),
                if *fast { "_100ms" } else { "" }
            ),
            Self::Ticker { symbol } => format!("ticker_{}", symbol.to_lowercase()),
            Self::MiniTicker { symbol } => format!("miniTicker_{}", symbol.to_lowercase()),
            Self::AllMiniTickers => "allMiniTickers".to_string(),
            Self::BookTicker { symbol } => format!("bookTicker_{}", symbol.to_lowercase()),
            Self::AllBookTickers => "allBookTickers".to_string(),
        }
    }

    /// Stream name as used in URLs and SUBSCRIBE requests.
    pub fn stream_name(&self) -> String {
        match self {
            Self::Kline { symbol, interval } => {
                format!("{}@kline_{}", symbol.to_lowercase(), interval)
            }
            Self::AggTrade { symbol } => format!("{}@aggTrade", symbol.to_lowercase()),
            Self::Trade { symbol } => format!("{}@trade", symbol.to_lowercase()),
            Self::PartialDepth {
                symbol,
                levels,
                fast,
            } => format!(
                "{}@depth{}{}",
                symbol.to_lowercase(),
                levels.as_u32(),
                if *fast { "@100ms" } else { "" }
            ),
            Self::DiffDepth { symbol, fast } => format!(
                "{}@depth{}",
                symbol.to_lowercase(),
                if *fast { "@100ms" } else { "" }
            ),
            Self::Ticker { symbol } => format!("{}@ticker", symbol.to_lowercase()),
            Self::MiniTicker { symbol } => format!("{}@miniTicker", symbol.to_lowercase()),
            Self::AllMiniTickers => "!miniTicker@arr".to_string(),
            Self::BookTicker { symbol } => format!("{}@bookTicker", symbol.to_lowercase()),
            Self::AllBookTickers => "!bookTicker".to_string(),
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.stream_name())
    }
}

/// Stream names of a combined subscription, sorted.
pub fn combined_stream_names(streams: &[StreamKind]) -> Vec<String> {
    let mut names: Vec<String> = streams.iter().map(StreamKind::stream_name).collect();
    names.sort();
    names.dedup();
    names
}

/// Canonical id of a combined subscription: `combined_<a>/<b>/...` over sorted names.
pub fn combined_id(streams: &[StreamKind]) -> String {
    format!("combined_{}", combined_stream_names(streams).join("/"))
}

/// URL of a single raw stream: `<base>/ws/<stream>`
pub fn build_raw_stream_url(base_url: &str, stream: &str) -> String {
    format!("{}/ws/{}", base_url.trim_end_matches('/'), stream)
}

/// URL of a combined stream: `<base>/stream?streams=<a>/<b>`
pub fn build_combined_stream_url(base_url: &str, streams: &[String]) -> String {
    let base_url = base_url.trim_end_matches('/');
    if streams.is_empty() {
        return base_url.to_string();
    }

    format!("{}/stream?streams={}", base_url, streams.join("/"))
}

/// User data stream URL; always embeds the listen key it was built from.
pub fn build_user_data_url(base_url: &str, listen_key: &str) -> String {
    build_raw_stream_url(base_url, listen_key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kline_id_and_stream_are_lowercase() {
        let kind = StreamKind::kline("BTCUSDT", KlineInterval::Minutes1);
        assert_eq!(kind.id(), "kline_btcusdt_1m");
        assert_eq!(kind.stream_name(), "btcusdt@kline_1m");
    }

    #[test]
    fn test_depth_ids() {
        let partial = StreamKind::partial_depth("ETHBTC", 10, true).unwrap();
        assert_eq!(partial.id(), "depth_ethbtc_10_100ms");
        assert_eq!(partial.stream_name(), "ethbtc@depth10@100ms");

        let slow = StreamKind::partial_depth("ethbtc", 5, false).unwrap();
        assert_eq!(slow.id(), "depth_ethbtc_5");
        assert_eq!(slow.stream_name(), "ethbtc@depth5");

        let diff = StreamKind::diff_depth("BNBUSDT", true);
        assert_eq!(diff.id(), "depthUpdate_bnbusdt_100ms");
        assert_eq!(diff.stream_name(), "bnbusdt@depth@100ms");
    }

    #[test]
    fn test_invalid_depth_levels_rejected() {
        assert!(matches!(
            StreamKind::partial_depth("btcusdt", 15, false),
            Err(ExchangeError::InvalidParameters(_))
        ));
    }

    #[test]
    fn test_directly_built_variant_is_still_lowercased() {
        let kind = StreamKind::Trade {
            symbol: "BTCUSDT".to_string(),
        };
        assert_eq!(kind.id(), "trade_btcusdt");
        assert_eq!(kind.stream_name(), "btcusdt@trade");
    }

    #[test]
    fn test_all_market_streams() {
        assert_eq!(StreamKind::AllMiniTickers.stream_name(), "!miniTicker@arr");
        assert_eq!(StreamKind::AllMiniTickers.id(), "allMiniTickers");
        assert_eq!(StreamKind::AllBookTickers.stream_name(), "!bookTicker");
        assert_eq!(StreamKind::AllBookTickers.id(), "allBookTickers");
    }

    #[test]
    fn test_combined_id_is_order_independent() {
        let a = [StreamKind::trade("ETHUSDT"), StreamKind::ticker("btcusdt")];
        let b = [StreamKind::ticker("BTCUSDT"), StreamKind::trade("ethusdt")];
        assert_eq!(combined_id(&a), combined_id(&b));
        assert_eq!(combined_id(&a), "combined_btcusdt@ticker/ethusdt@trade");
    }

    #[test]
    fn test_build_urls() {
        let base = "wss://stream.binance.com:9443/";
        assert_eq!(
            build_raw_stream_url(base, "btcusdt@ticker"),
            "wss://stream.binance.com:9443/ws/btcusdt@ticker"
        );
        let streams = vec!["btcusdt@ticker".to_string(), "ethusdt@ticker".to_string()];
        assert_eq!(
            build_combined_stream_url(base, &streams),
            "wss://stream.binance.com:9443/stream?streams=btcusdt@ticker/ethusdt@ticker"
        );
        assert_eq!(build_combined_stream_url(base, &[]), "wss://stream.binance.com:9443");
        assert!(build_user_data_url(base, "abc123").ends_with("/ws/abc123"));
    }
}
