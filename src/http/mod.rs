//! HTTP/1.1 message handling for intercepted sessions

pub mod body;
pub mod codec;
pub mod exchange;

pub use codec::{Header, Part, RequestDecoder, RequestHead, ResponseDecoder, ResponseHead};
pub use exchange::{CapturedExchange, ExchangeQueue, ExchangeTracker};
