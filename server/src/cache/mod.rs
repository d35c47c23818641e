//! Process-local caches fed from the bus

mod request_messages;

pub use request_messages::{RequestCacheConfig, RequestMessageCache};
