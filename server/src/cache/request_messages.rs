//! Per-request message cache
//!
//! Workers need fast local access to the recent message batches of a
//! request (the original prompt plus follow-ups and steers). The cache
//! consumes `cmd.request` in fanout mode from "now" and accumulates
//! batches keyed by `request_id`.
//!
//! Policies:
//! - batches **append** to an entry, never replace it
//! - an entry keeps at most `max_messages_per_request` messages, dropping
//!   the oldest (the tail of the window wins)
//! - entries expire `ttl` after their last write and are invisible to
//!   readers once expired
//! - at most `max_entries` live entries; the least recently written entry
//!   is evicted first
//!
//! The subscription handler is the only writer; `get` takes the same lock
//! for reads and evicts on miss-by-expiry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::bus::{
    BusError, ChatMessage, Event, EventKind, HEADER_REQUEST_ID, Offset, SubscribeMode,
    SubscribeOptions, Subscription, TypeSubscribeOptions, TypedBus,
};
use crate::core::constants::{
    DEFAULT_REQUEST_CACHE_MAX_ENTRIES, DEFAULT_REQUEST_CACHE_MAX_MESSAGES,
    DEFAULT_REQUEST_CACHE_SUBSCRIPTION, DEFAULT_REQUEST_CACHE_TTL_SECS,
};
use crate::utils::time::now_ms;

#[derive(Debug, Clone)]
pub struct RequestCacheConfig {
    /// Fanout subscription id; distinct per process role
    pub subscription_id: String,
    /// Entry lifetime after the last write
    pub ttl: Duration,
    /// Live-entry cap
    pub max_entries: usize,
    /// Per-request message cap (tail wins)
    pub max_messages_per_request: usize,
}

impl Default for RequestCacheConfig {
    fn default() -> Self {
        Self {
            subscription_id: DEFAULT_REQUEST_CACHE_SUBSCRIPTION.to_string(),
            ttl: Duration::from_secs(DEFAULT_REQUEST_CACHE_TTL_SECS),
            max_entries: DEFAULT_REQUEST_CACHE_MAX_ENTRIES,
            max_messages_per_request: DEFAULT_REQUEST_CACHE_MAX_MESSAGES,
        }
    }
}

struct Entry {
    messages: Vec<ChatMessage>,
    expires_at_ms: i64,
    updated_at_ms: i64,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, Entry>,
}

impl CacheState {
    fn prune_expired(&mut self, now: i64) {
        self.entries.retain(|_, entry| entry.expires_at_ms > now);
    }

    fn insert_batch(
        &mut self,
        request_id: &str,
        batch: Vec<ChatMessage>,
        now: i64,
        config: &RequestCacheConfig,
    ) {
        self.prune_expired(now);

        let entry = self.entries.entry(request_id.to_string()).or_insert(Entry {
            messages: Vec::new(),
            expires_at_ms: 0,
            updated_at_ms: 0,
        });
        entry.messages.extend(batch);
        if entry.messages.len() > config.max_messages_per_request {
            let excess = entry.messages.len() - config.max_messages_per_request;
            entry.messages.drain(..excess);
        }
        entry.updated_at_ms = now;
        entry.expires_at_ms = now + config.ttl.as_millis() as i64;

        while self.entries.len() > config.max_entries {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.updated_at_ms)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => {
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
    }

    fn get(&mut self, request_id: &str, now: i64) -> Option<Vec<ChatMessage>> {
        match self.entries.get(request_id) {
            Some(entry) if entry.expires_at_ms > now => Some(entry.messages.clone()),
            Some(_) => {
                self.entries.remove(request_id);
                None
            }
            None => None,
        }
    }
}

/// Local view of recent per-request message batches
pub struct RequestMessageCache {
    state: Arc<Mutex<CacheState>>,
    subscription: tokio::sync::Mutex<Option<Subscription>>,
}

impl RequestMessageCache {
    /// Subscribe and start accumulating. The fanout group is created
    /// before this returns; only messages published after startup are
    /// observed.
    pub async fn start(
        bus: &TypedBus,
        config: RequestCacheConfig,
    ) -> Result<Arc<Self>, BusError> {
        let state = Arc::new(Mutex::new(CacheState::default()));

        let handler_state = Arc::clone(&state);
        let handler_config = config.clone();
        let subscription = bus
            .subscribe_type(
                EventKind::RequestMessage,
                TypeSubscribeOptions {
                    topic: None,
                    options: SubscribeOptions {
                        mode: SubscribeMode::Fanout {
                            subscription_id: config.subscription_id.clone(),
                            consumer: None,
                            offset: Offset::Now,
                        },
                        block: None,
                    },
                },
                move |delivery| {
                    let state = Arc::clone(&handler_state);
                    let config = handler_config.clone();
                    async move {
                        let Event::RequestMessage(payload) = delivery.event else {
                            return Ok(());
                        };
                        let request_id = delivery
                            .msg
                            .header(HEADER_REQUEST_ID)
                            .unwrap_or_default()
                            .to_string();
                        if request_id.is_empty() {
                            // A publisher bug; refuse the ack so the defect
                            // stays visible in the pending queue.
                            tracing::warn!(
                                id = %delivery.msg.id,
                                "Request message without request_id header; refusing ack"
                            );
                            anyhow::bail!("request message missing request_id header");
                        }

                        state
                            .lock()
                            .insert_batch(&request_id, payload.messages, now_ms(), &config);

                        delivery.ctx.commit().await?;
                        Ok(())
                    }
                },
            )
            .await?;

        Ok(Arc::new(Self {
            state,
            subscription: tokio::sync::Mutex::new(Some(subscription)),
        }))
    }

    /// Current ordered message sequence for a request, `None` when the
    /// entry is missing or expired
    pub fn get(&self, request_id: &str) -> Option<Vec<ChatMessage>> {
        self.state.lock().get(request_id, now_ms())
    }

    /// Tear down the subscription and clear local state
    pub async fn stop(&self) {
        if let Some(subscription) = self.subscription.lock().await.take() {
            subscription.stop().await;
        }
        self.state.lock().entries.clear();
    }
}
