//! Raw bus: publish, fetch, and subscribe over a stream backend
//!
//! Three read modes:
//! - **tail**: non-durable, from a chosen offset, no ack
//! - **work**: durable consumer group, competing consumers, explicit ack
//! - **fanout**: durable, every distinct subscription id gets the full
//!   stream (each id is its own consumer group)
//!
//! Ack discipline: a durable message stays pending until the handler calls
//! `ctx.commit()`. A handler error (or a handler that simply returns
//! without committing) leaves the message pending for group recovery; the
//! subscription keeps running.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::backend::{Offset, RangeStart, StreamBackend, StreamReader};
use super::envelope::{Envelope, decode_entry, encode_fields};
use super::error::BusError;
use crate::utils::time::now_ms;

/// Default blocking-read window
pub const DEFAULT_BLOCK: Duration = Duration::from_secs(1);
/// Upper bound on the blocking-read window
pub const MAX_BLOCK: Duration = Duration::from_secs(30);
/// Above this window, `stop()` force-closes the reader instead of waiting
/// out the block
const FORCE_CLOSE_THRESHOLD: Duration = Duration::from_secs(2);
/// Entries requested per blocking read
const READ_COUNT: usize = 256;
/// Default `fetch` limit
const DEFAULT_FETCH_LIMIT: usize = 100;

/// A publish call
#[derive(Debug, Clone, Default)]
pub struct PublishRequest {
    pub topic: String,
    /// Event type wire name
    pub ty: String,
    pub key: Option<String>,
    pub headers: HashMap<String, String>,
    /// Pre-encoded MessagePack payload
    pub data: Option<Vec<u8>>,
    /// Approximate per-topic retention hint
    pub max_len_approx: Option<u64>,
}

/// Result of a publish: the entry id, which doubles as a resume cursor
#[derive(Debug, Clone)]
pub struct Receipt {
    pub id: String,
    pub cursor: String,
}

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub offset: Offset,
    pub limit: Option<usize>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            offset: Offset::Begin,
            limit: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchResult {
    pub messages: Vec<Envelope>,
    /// Cursor of the last returned message; absent on an empty read
    pub next: Option<String>,
}

/// Subscription read mode
#[derive(Debug, Clone)]
pub enum SubscribeMode {
    /// Non-durable read from `offset`; no ack
    Tail { offset: Offset },
    /// Durable group with competing consumers; each entry goes to exactly
    /// one consumer in the group
    Work {
        subscription_id: String,
        consumer: Option<String>,
        offset: Offset,
    },
    /// Durable; every distinct subscription id receives every entry
    Fanout {
        subscription_id: String,
        consumer: Option<String>,
        offset: Offset,
    },
}

#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    pub mode: SubscribeMode,
    /// Blocking-read window; defaults to [`DEFAULT_BLOCK`], capped at
    /// [`MAX_BLOCK`]
    pub block: Option<Duration>,
}

/// A delivered message plus its ack context
pub struct Delivery {
    pub msg: Envelope,
    pub ctx: DeliveryCtx,
}

/// Ack handle for one delivered message
#[derive(Clone)]
pub struct DeliveryCtx {
    backend: Arc<dyn StreamBackend>,
    topic: String,
    group: Option<String>,
    id: String,
}

impl DeliveryCtx {
    /// Acknowledge the message. No-op for non-durable subscriptions. An
    /// ack failure is logged and returned; the message remains pending.
    pub async fn commit(&self) -> Result<(), BusError> {
        let Some(group) = &self.group else {
            return Ok(());
        };
        self.backend
            .ack(&self.topic, group, &self.id)
            .await
            .inspect_err(|e| {
                tracing::warn!(
                    topic = %self.topic,
                    group = %group,
                    id = %self.id,
                    error = %e,
                    "Ack failed; message remains pending"
                );
            })
    }

    /// Cursor resuming immediately after this message
    pub fn cursor(&self) -> String {
        self.id.clone()
    }
}

/// Handle to a running subscription
#[derive(Debug)]
pub struct Subscription {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
    block: Duration,
}

impl Subscription {
    /// Stop the subscription. When the blocking window is long, the read
    /// task is aborted outright so the dedicated connection is closed
    /// rather than waited out.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if self.block > FORCE_CLOSE_THRESHOLD {
            self.handle.abort();
        }
        match self.handle.await {
            Ok(()) => {}
            Err(e) if e.is_cancelled() => {}
            Err(e) => tracing::warn!(error = %e, "Subscription task panicked"),
        }
    }
}

/// Low-level bus over a stream backend
#[derive(Clone)]
pub struct RawBus {
    backend: Arc<dyn StreamBackend>,
}

impl RawBus {
    pub fn new(backend: Arc<dyn StreamBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn StreamBackend> {
        &self.backend
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.backend_name()
    }

    /// Append one entry. One network round-trip; no batching.
    pub async fn publish(&self, req: PublishRequest) -> Result<Receipt, BusError> {
        let ts = now_ms();
        let fields = encode_fields(
            &req.ty,
            ts,
            req.key.as_deref(),
            &req.headers,
            req.data.as_deref(),
        )?;
        let id = self
            .backend
            .append(&req.topic, &fields, req.max_len_approx)
            .await?;
        Ok(Receipt {
            cursor: id.clone(),
            id,
        })
    }

    /// One-shot read with no ack semantics
    pub async fn fetch(&self, topic: &str, opts: FetchOptions) -> Result<FetchResult, BusError> {
        let limit = opts.limit.unwrap_or(DEFAULT_FETCH_LIMIT);
        let start = match opts.offset {
            Offset::Begin => RangeStart::Begin,
            Offset::Cursor(c) => RangeStart::After(c),
            Offset::Now => match self.backend.last_id(topic).await? {
                Some(id) => RangeStart::After(id),
                None => RangeStart::Begin,
            },
        };
        let entries = self.backend.range(topic, start, limit).await?;
        let messages: Vec<Envelope> = entries
            .into_iter()
            .map(|entry| decode_entry(topic, entry))
            .collect();
        let next = messages.last().map(|m| m.id.clone());
        Ok(FetchResult { messages, next })
    }

    /// Start a subscription. For durable modes the consumer group exists
    /// before this returns; the group name is the subscription id and the
    /// consumer name defaults to a fresh UUID.
    pub async fn subscribe<F, Fut>(
        &self,
        topic: &str,
        opts: SubscribeOptions,
        handler: F,
    ) -> Result<Subscription, BusError>
    where
        F: Fn(Delivery) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let block = opts.block.unwrap_or(DEFAULT_BLOCK).min(MAX_BLOCK);
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = match opts.mode {
            SubscribeMode::Tail { offset } => {
                let after = match offset {
                    Offset::Begin => "0-0".to_string(),
                    Offset::Cursor(c) => c,
                    Offset::Now => self
                        .backend
                        .last_id(topic)
                        .await?
                        .unwrap_or_else(|| "0-0".to_string()),
                };
                let reader = self.backend.open_reader().await?;
                let backend = Arc::clone(&self.backend);
                let topic = topic.to_string();
                tokio::spawn(tail_loop(
                    backend, reader, topic, after, block, stop_rx, handler,
                ))
            }
            SubscribeMode::Work {
                subscription_id,
                consumer,
                offset,
            }
            | SubscribeMode::Fanout {
                subscription_id,
                consumer,
                offset,
            } => {
                self.backend
                    .ensure_group(topic, &subscription_id, &offset)
                    .await?;
                let consumer = consumer.unwrap_or_else(|| Uuid::new_v4().to_string());
                let reader = self.backend.open_reader().await?;
                let backend = Arc::clone(&self.backend);
                let topic = topic.to_string();
                tokio::spawn(group_loop(
                    backend,
                    reader,
                    topic,
                    subscription_id,
                    consumer,
                    block,
                    stop_rx,
                    handler,
                ))
            }
        };

        Ok(Subscription {
            stop_tx,
            handle,
            block,
        })
    }
}

#[allow(clippy::too_many_arguments)]
async fn group_loop<F, Fut>(
    backend: Arc<dyn StreamBackend>,
    mut reader: Box<dyn StreamReader>,
    topic: String,
    group: String,
    consumer: String,
    block: Duration,
    mut stop_rx: watch::Receiver<bool>,
    handler: F,
) where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let mut unhealthy = false;
    loop {
        if *stop_rx.borrow() {
            break;
        }
        tokio::select! {
            biased;
            _ = stop_rx.changed() => break,
            result = reader.read_group(&topic, &group, &consumer, block, READ_COUNT) => {
                match result {
                    Ok(entries) => {
                        for entry in entries {
                            let msg = decode_entry(&topic, entry);
                            let ctx = DeliveryCtx {
                                backend: Arc::clone(&backend),
                                topic: topic.clone(),
                                group: Some(group.clone()),
                                id: msg.id.clone(),
                            };
                            if let Err(e) = handler(Delivery { msg, ctx }).await {
                                tracing::warn!(
                                    topic = %topic,
                                    group = %group,
                                    error = %e,
                                    "Handler failed; message left pending"
                                );
                            }
                        }
                    }
                    Err(e) => {
                        tracing::error!(
                            topic = %topic,
                            group = %group,
                            error = %e,
                            "Read loop failed; stopping subscription"
                        );
                        unhealthy = true;
                        break;
                    }
                }
            }
        }
    }
    reader.close(unhealthy).await;
}

async fn tail_loop<F, Fut>(
    backend: Arc<dyn StreamBackend>,
    mut reader: Box<dyn StreamReader>,
    topic: String,
    mut after: String,
    block: Duration,
    mut stop_rx: watch::Receiver<bool>,
    handler: F,
) where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let mut unhealthy = false;
    loop {
        if *stop_rx.borrow() {
            break;
        }
        tokio::select! {
            biased;
            _ = stop_rx.changed() => break,
            result = reader.read_tail(&topic, &after, block, READ_COUNT) => {
                match result {
                    Ok(entries) => {
                        for entry in entries {
                            after = entry.id.clone();
                            let msg = decode_entry(&topic, entry);
                            let ctx = DeliveryCtx {
                                backend: Arc::clone(&backend),
                                topic: topic.clone(),
                                group: None,
                                id: msg.id.clone(),
                            };
                            if let Err(e) = handler(Delivery { msg, ctx }).await {
                                tracing::warn!(topic = %topic, error = %e, "Tail handler failed");
                            }
                        }
                    }
                    Err(e) => {
                        tracing::error!(topic = %topic, error = %e, "Read loop failed; stopping subscription");
                        unhealthy = true;
                        break;
                    }
                }
            }
        }
    }
    reader.close(unhealthy).await;
}
