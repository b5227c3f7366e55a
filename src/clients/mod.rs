// External API clients

pub mod bitget_rest;
pub mod bitget_ws;

// Re-export client types
pub use bitget_rest::{BitgetRestClient, MAX_CANDLES_PER_CALL};
pub use bitget_ws::{BitgetWsClient, MessageDecoder, WsFeed};
