use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExchangeError {
    /// The server answered with a negative-code JSON error body.
    #[error("binance api error: code={code}, msg={message}")]
    ApiError { code: i32, message: String },

    /// Network, TLS, deadline or an unparseable non-2xx response.
    #[error("transport error (status {}): {body}", status_text(.status))]
    TransportError { status: Option<u16>, body: String },

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error(transparent)]
    StateError(#[from] StateError),

    #[error("credential error: {0}")]
    CredentialError(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] crate::core::config::ConfigError),

    #[error("reconnect cap reached after {attempts} attempts")]
    ReconnectLimitReached { attempts: u32 },

    #[error("request cancelled")]
    Cancelled,

    #[error("{}", join_errors(.0))]
    Multiple(Vec<ExchangeError>),
}

/// Misuse of a connection or subscription, reported synchronously.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("duplicate subscription: {0}")]
    DuplicateSubscription(String),

    #[error("connection is not connected")]
    NotConnected,

    #[error("connection is closed")]
    Closed,

    #[error("connection attempt already in progress")]
    AlreadyConnecting,
}

fn status_text(status: &Option<u16>) -> String {
    status.map_or_else(|| "none".to_string(), |s| s.to_string())
}

fn join_errors(errors: &[ExchangeError]) -> String {
    let parts = errors.iter().map(ToString::to_string).collect::<Vec<_>>();
    format!("{} errors: [{}]", errors.len(), parts.join("; "))
}

impl ExchangeError {
    /// Wrap a network level failure that never produced a status line.
    pub fn transport(body: impl Into<String>) -> Self {
        Self::TransportError {
            status: None,
            body: body.into(),
        }
    }

    /// True for the server codes a caller may retry with backoff.
    pub fn is_retryable(&self) -> bool {
        self.api_code().is_some_and(ApiErrorCode::is_retryable)
    }

    pub fn api_code(&self) -> Option<ApiErrorCode> {
        match self {
            Self::ApiError { code, .. } => ApiErrorCode::from_code(*code),
            _ => None,
        }
    }

    pub fn is_duplicate_subscription(&self) -> bool {
        matches!(self, Self::StateError(StateError::DuplicateSubscription(_)))
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return Self::ProtocolError(err.to_string());
        }
        Self::TransportError {
            status: err.status().map(|s| s.as_u16()),
            body: err.to_string(),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ExchangeError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::transport(format!("websocket: {}", err))
    }
}

/// Documented server error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiErrorCode {
    Unknown,
    Disconnected,
    Unauthorized,
    TooManyRequests,
    UnexpectedResponse,
    Timeout,
    UnknownOrderComposition,
    TooManyOrders,
    ServiceShuttingDown,
    UnsupportedOperation,
    InvalidTimestamp,
    InvalidSignature,
    IllegalChars,
    TooManyParameters,
    MandatoryParamEmptyOrMalformed,
    UnknownParam,
    UnreadParameters,
    ParamEmpty,
    ParamNotRequired,
    BadPrecision,
    BadSymbol,
    InvalidListenKey,
    MoreThanXxHours,
    OptionalParamsBadCombo,
    InvalidParameter,
    NewOrderRejected,
    CancelRejected,
    NoSuchOrder,
    BadApiKeyFormat,
    RejectedMbxKey,
    NoTradingWindow,
}

impl ApiErrorCode {
    const ALL: [Self; 31] = [
        Self::Unknown,
        Self::Disconnected,
        Self::Unauthorized,
        Self::TooManyRequests,
        Self::UnexpectedResponse,
        Self::Timeout,
        Self::UnknownOrderComposition,
        Self::TooManyOrders,
        Self::ServiceShuttingDown,
        Self::UnsupportedOperation,
        Self::InvalidTimestamp,
        Self::InvalidSignature,
        Self::IllegalChars,
        Self::TooManyParameters,
        Self::MandatoryParamEmptyOrMalformed,
        Self::UnknownParam,
        Self::UnreadParameters,
        Self::ParamEmpty,
        Self::ParamNotRequired,
        Self::BadPrecision,
        Self::BadSymbol,
        Self::InvalidListenKey,
        Self::MoreThanXxHours,
        Self::OptionalParamsBadCombo,
        Self::InvalidParameter,
        Self::NewOrderRejected,
        Self::CancelRejected,
        Self::NoSuchOrder,
        Self::BadApiKeyFormat,
        Self::RejectedMbxKey,
        Self::NoTradingWindow,
    ];

    pub const fn code(self) -> i32 {
        match self {
            Self::Unknown => -1000,
            Self::Disconnected => -1001,
            Self::Unauthorized => -1002,
            Self::TooManyRequests => -1003,
            Self::UnexpectedResponse => -1006,
            Self::Timeout => -1007,
            Self::UnknownOrderComposition => -1014,
            Self::TooManyOrders => -1015,
            Self::ServiceShuttingDown => -1016,
            Self::UnsupportedOperation => -1020,
            Self::InvalidTimestamp => -1021,
            Self::InvalidSignature => -1022,
            Self::IllegalChars => -1100,
            Self::TooManyParameters => -1101,
            Self::MandatoryParamEmptyOrMalformed => -1102,
            Self::UnknownParam => -1103,
            Self::UnreadParameters => -1104,
            Self::ParamEmpty => -1105,
            Self::ParamNotRequired => -1106,
            Self::BadPrecision => -1111,
            Self::BadSymbol => -1121,
            Self::InvalidListenKey => -1125,
            Self::MoreThanXxHours => -1127,
            Self::OptionalParamsBadCombo => -1128,
            Self::InvalidParameter => -1130,
            Self::NewOrderRejected => -2010,
            Self::CancelRejected => -2011,
            Self::NoSuchOrder => -2013,
            Self::BadApiKeyFormat => -2014,
            Self::RejectedMbxKey => -2015,
            Self::NoTradingWindow => -2016,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.code() == code)
    }

    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::TooManyRequests | Self::Timeout | Self::Disconnected
        )
    }

    pub const fn description(self) -> &'static str {
        match self {
            Self::Unknown => "An unknown error occurred while processing the request",
            Self::Disconnected => "Internal error; unable to process your request. Please try again",
            Self::Unauthorized => "You are not authorized to execute this request",
            Self::TooManyRequests => "Too many requests queued",
            Self::UnexpectedResponse => "An unexpected response was received from the message bus",
            Self::Timeout => "Timeout waiting for response from backend server",
            Self::UnknownOrderComposition => "Unsupported order combination",
            Self::TooManyOrders => "Too many new orders",
            Self::ServiceShuttingDown => "This service is no longer available",
            Self::UnsupportedOperation => "This operation is not supported",
            Self::InvalidTimestamp => "Timestamp for this request is outside of the recvWindow",
            Self::InvalidSignature => "Signature for this request is not valid",
            Self::IllegalChars => "Illegal characters found in a parameter",
            Self::TooManyParameters => "Too many parameters sent for this endpoint",
            Self::MandatoryParamEmptyOrMalformed => {
                "A mandatory parameter was not sent, was empty/null, or malformed"
            }
            Self::UnknownParam => "An unknown parameter was sent",
            Self::UnreadParameters => "Not all sent parameters were read",
            Self::ParamEmpty => "A parameter was empty",
            Self::ParamNotRequired => "A parameter was sent when not required",
            Self::BadPrecision => "Precision is over the maximum defined for this asset",
            Self::BadSymbol => "Invalid symbol",
            Self::InvalidListenKey => "This listenKey does not exist",
            Self::MoreThanXxHours => "Lookup interval is too big",
            Self::OptionalParamsBadCombo => "Combination of optional parameters invalid",
            Self::InvalidParameter => "Invalid data sent for a parameter",
            Self::NewOrderRejected => "New order rejected",
            Self::CancelRejected => "Cancel order rejected",
            Self::NoSuchOrder => "Order does not exist",
            Self::BadApiKeyFormat => "API-key format invalid",
            Self::RejectedMbxKey => "Invalid API-key, IP, or permissions for action",
            Self::NoTradingWindow => "No trading window could be found for the symbol",
        }
    }
}

impl fmt::Display for ApiErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.description(), self.code())
    }
}

/// Human readable text for a raw server code.
pub fn error_message(code: i32) -> String {
    ApiErrorCode::from_code(code).map_or_else(
        || format!("Unknown error code: {}", code),
        |c| c.description().to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_codes() {
        for code in [-1003, -1007, -1001] {
            let err = ExchangeError::ApiError {
                code,
                message: "busy".to_string(),
            };
            assert!(err.is_retryable(), "code {} should be retryable", code);
        }

        for code in [-1000, -1021, -1022, -2010, -9999] {
            let err = ExchangeError::ApiError {
                code,
                message: "nope".to_string(),
            };
            assert!(!err.is_retryable(), "code {} should be terminal", code);
        }

        assert!(!ExchangeError::transport("reset").is_retryable());
    }

    #[test]
    fn test_api_error_display() {
        let err = ExchangeError::ApiError {
            code: -1121,
            message: "Invalid symbol.".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "binance api error: code=-1121, msg=Invalid symbol."
        );
        assert_eq!(err.api_code(), Some(ApiErrorCode::BadSymbol));
    }

    #[test]
    fn test_code_table_is_consistent() {
        for code in ApiErrorCode::ALL {
            assert_eq!(ApiErrorCode::from_code(code.code()), Some(code));
        }
        assert_eq!(ApiErrorCode::from_code(-4242), None);
        assert_eq!(error_message(-4242), "Unknown error code: -4242");
        assert_eq!(error_message(-1022), "Signature for this request is not valid");
    }

    #[test]
    fn test_multiple_display() {
        let err = ExchangeError::Multiple(vec![
            ExchangeError::ProtocolError("bad frame".to_string()),
            StateError::NotConnected.into(),
        ]);
        assert_eq!(
            err.to_string(),
            "2 errors: [protocol error: bad frame; connection is not connected]"
        );
    }

    #[test]
    fn test_duplicate_subscription_helper() {
        let err: ExchangeError = StateError::DuplicateSubscription("kline_btcusdt_1m".into()).into();
        assert!(err.is_duplicate_subscription());
        assert_eq!(err.to_string(), "duplicate subscription: kline_btcusdt_1m");
    }
}
