use crate::core::errors::ExchangeError;

/// Codec trait for exchange-specific stream frames
///
/// The transport hands every text frame to `decode_message`; control frames
/// never reach the codec.
pub trait WsCodec: Send + Sync + 'static {
    /// The type representing parsed messages from this exchange
    type Message: Send;

    /// Encode a live subscription request for an already open socket
    fn encode_subscription(
        &self,
        streams: &[impl AsRef<str> + Send + Sync],
    ) -> Result<String, ExchangeError>;

    /// Encode the matching unsubscription request
    fn encode_unsubscription(
        &self,
        streams: &[impl AsRef<str> + Send + Sync],
    ) -> Result<String, ExchangeError>;

    /// Decode one text frame
    ///
    /// # Returns
    /// - `Ok(Some(message))` - Successfully decoded message
    /// - `Ok(None)` - Frame was recognised as noise and dropped
    /// - `Err(error)` - Frame matched a known shape but failed to decode
    fn decode_message(&self, text: &str) -> Result<Option<Self::Message>, ExchangeError>;
}
