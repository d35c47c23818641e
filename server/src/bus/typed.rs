//! Typed bus: event-schema dispatch over the raw bus
//!
//! Publishing derives topic and key from the event kind; subscribing
//! decodes payloads lazily and delivers the [`Event`] union. Durable
//! subscriptions commit-and-skip entries they will never deliver (foreign
//! kinds under `subscribe_type`, undecodable payloads) so the consumer
//! group does not wedge on them.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use super::envelope::{Envelope, HEADER_REQUEST_ID};
use super::error::BusError;
use super::events::{Event, EventKind, Topic};
use super::raw::{
    Delivery, DeliveryCtx, FetchOptions, PublishRequest, RawBus, Receipt, SubscribeOptions,
    Subscription,
};
use crate::core::constants::OUTPUT_STREAM_RETENTION;

/// Options for a typed publish
#[derive(Debug, Clone, Default)]
pub struct PublishOpts {
    pub headers: HashMap<String, String>,
    /// Override the kind's default topic
    pub topic: Option<Topic>,
    /// Override the kind's default correlation key
    pub key: Option<String>,
    /// Approximate retention hint for the topic
    pub retention: Option<u64>,
}

/// Options for `subscribe_type`
#[derive(Debug, Clone)]
pub struct TypeSubscribeOptions {
    /// Required for output-stream kinds, whose topic is request-scoped;
    /// defaults to the kind's static topic otherwise
    pub topic: Option<Topic>,
    pub options: SubscribeOptions,
}

/// A decoded event plus the envelope it arrived in
pub struct TypedDelivery {
    pub event: Event,
    pub msg: Envelope,
    pub ctx: DeliveryCtx,
}

/// Result of a typed fetch. Entries that do not decode are skipped with a
/// warning.
#[derive(Debug, Clone)]
pub struct TypedBatch {
    pub messages: Vec<(Event, Envelope)>,
    pub next: Option<String>,
}

/// Event-schema layer over [`RawBus`]
#[derive(Clone)]
pub struct TypedBus {
    raw: RawBus,
}

impl TypedBus {
    pub fn new(raw: RawBus) -> Self {
        Self { raw }
    }

    pub fn raw(&self) -> &RawBus {
        &self.raw
    }

    fn resolve_topic(
        kind: EventKind,
        topic: Option<Topic>,
        headers: &HashMap<String, String>,
    ) -> Result<Topic, BusError> {
        if let Some(topic) = topic {
            return Ok(topic);
        }
        if let Some(topic) = kind.static_topic() {
            return Ok(topic);
        }
        // Output-stream kinds derive their topic from the request header;
        // publishing one without it is a programmer error.
        headers
            .get(HEADER_REQUEST_ID)
            .filter(|rid| !rid.is_empty())
            .map(|rid| Topic::OutputRequest(rid.clone()))
            .ok_or_else(|| {
                BusError::Config(format!(
                    "publishing {} requires a {HEADER_REQUEST_ID} header",
                    kind.wire_type()
                ))
            })
    }

    pub async fn publish(&self, event: &Event, opts: PublishOpts) -> Result<Receipt, BusError> {
        let kind = event.kind();
        let topic = Self::resolve_topic(kind, opts.topic, &opts.headers)?;
        let key = opts.key.or_else(|| event.default_key(&opts.headers));
        // Per-request output streams are bounded by default; command and
        // event topics are left to operator-set retention.
        let retention = opts.retention.or_else(|| {
            matches!(topic, Topic::OutputRequest(_)).then_some(OUTPUT_STREAM_RETENTION)
        });
        self.raw
            .publish(PublishRequest {
                topic: topic.name(),
                ty: kind.wire_type().to_string(),
                key,
                headers: opts.headers,
                data: Some(event.encode()?),
                max_len_approx: retention,
            })
            .await
    }

    /// Subscribe to every event kind valid on a topic. The handler
    /// receives the discriminated [`Event`] union.
    pub async fn subscribe_topic<F, Fut>(
        &self,
        topic: &Topic,
        opts: SubscribeOptions,
        handler: F,
    ) -> Result<Subscription, BusError>
    where
        F: Fn(TypedDelivery) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.raw
            .subscribe(&topic.name(), opts, move |delivery| {
                let handler = Arc::clone(&handler);
                async move {
                    let Delivery { msg, ctx } = delivery;
                    match decode_event(&msg) {
                        Some(event) => handler(TypedDelivery { event, msg, ctx }).await,
                        None => {
                            // never deliverable; don't leave it pending
                            ctx.commit().await?;
                            Ok(())
                        }
                    }
                }
            })
            .await
    }

    /// Subscribe to a single event kind. Other kinds on the topic are
    /// silently dropped (and committed, in durable modes).
    pub async fn subscribe_type<F, Fut>(
        &self,
        kind: EventKind,
        opts: TypeSubscribeOptions,
        handler: F,
    ) -> Result<Subscription, BusError>
    where
        F: Fn(TypedDelivery) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let topic = match (opts.topic, kind.static_topic()) {
            (Some(topic), _) => topic,
            (None, Some(topic)) => topic,
            (None, None) => {
                return Err(BusError::Config(format!(
                    "subscribing to {} requires an explicit topic",
                    kind.wire_type()
                )));
            }
        };

        let handler = Arc::new(handler);
        self.raw
            .subscribe(&topic.name(), opts.options, move |delivery| {
                let handler = Arc::clone(&handler);
                async move {
                    let Delivery { msg, ctx } = delivery;
                    if msg.ty != kind.wire_type() {
                        ctx.commit().await?;
                        return Ok(());
                    }
                    match decode_event(&msg) {
                        Some(event) => handler(TypedDelivery { event, msg, ctx }).await,
                        None => {
                            ctx.commit().await?;
                            Ok(())
                        }
                    }
                }
            })
            .await
    }

    /// Typed wrapper over a raw fetch
    pub async fn fetch_topic(
        &self,
        topic: &Topic,
        opts: FetchOptions,
    ) -> Result<TypedBatch, BusError> {
        let result = self.raw.fetch(&topic.name(), opts).await?;
        let next = result.next;
        let messages = result
            .messages
            .into_iter()
            .filter_map(|msg| decode_event(&msg).map(|event| (event, msg)))
            .collect();
        Ok(TypedBatch { messages, next })
    }
}

/// Decode an envelope's payload by its wire type. Warns and returns `None`
/// for unknown kinds, missing data, or undecodable payloads.
fn decode_event(msg: &Envelope) -> Option<Event> {
    let Some(kind) = EventKind::parse(&msg.ty) else {
        tracing::warn!(topic = %msg.topic, id = %msg.id, ty = %msg.ty, "Unknown event type");
        return None;
    };
    let Some(data) = &msg.data else {
        tracing::warn!(topic = %msg.topic, id = %msg.id, ty = %msg.ty, "Event without payload");
        return None;
    };
    match kind.decode(data) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::warn!(
                topic = %msg.topic,
                id = %msg.id,
                ty = %msg.ty,
                error = %e,
                "Undecodable event payload"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::backend::{Offset, StreamBackend};
    use crate::bus::envelope::HEADER_SESSION_ID;
    use crate::bus::events::{
        AgentOutputPayload, ChatMessage, RequestMessagePayload, RequestQueue,
    };
    use crate::bus::memory::MemoryStreamBackend;
    use crate::bus::raw::SubscribeMode;
    use lilac_surface::OutputFragment;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn bus() -> (TypedBus, Arc<dyn StreamBackend>) {
        let backend: Arc<dyn StreamBackend> = Arc::new(MemoryStreamBackend::new());
        (
            TypedBus::new(RawBus::new(Arc::clone(&backend))),
            backend,
        )
    }

    fn request_event(text: &str) -> Event {
        Event::RequestMessage(RequestMessagePayload {
            queue: RequestQueue::Prompt,
            messages: vec![ChatMessage::user(text)],
            control: None,
        })
    }

    fn headers(request_id: &str) -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert(HEADER_REQUEST_ID.to_string(), request_id.to_string());
        map.insert(HEADER_SESSION_ID.to_string(), "acme/app#1".to_string());
        map
    }

    #[tokio::test]
    async fn publish_derives_topic_and_key() {
        let (bus, _) = bus();
        bus.publish(
            &request_event("hi"),
            PublishOpts {
                headers: headers("r1"),
                ..PublishOpts::default()
            },
        )
        .await
        .unwrap();

        let batch = bus
            .fetch_topic(&Topic::CmdRequest, FetchOptions::default())
            .await
            .unwrap();
        assert_eq!(batch.messages.len(), 1);
        let (event, msg) = &batch.messages[0];
        assert!(matches!(event, Event::RequestMessage(_)));
        assert_eq!(msg.key.as_deref(), Some("r1"));
        assert_eq!(msg.ty, "cmd.request.message");
    }

    #[tokio::test]
    async fn output_publish_derives_topic_from_request_header() {
        let (bus, backend) = bus();
        let event = Event::AgentOutput(AgentOutputPayload {
            fragment: OutputFragment::TextDelta {
                text: "x".to_string(),
            },
        });

        bus.publish(
            &event,
            PublishOpts {
                headers: headers("r9"),
                ..PublishOpts::default()
            },
        )
        .await
        .unwrap();

        let stats = backend.stats("out.req.r9", "none").await.unwrap();
        assert_eq!(stats.length, 1);
    }

    #[tokio::test]
    async fn output_publish_without_request_header_fails() {
        let (bus, _) = bus();
        let event = Event::AgentOutput(AgentOutputPayload {
            fragment: OutputFragment::FinalText {
                text: "done".to_string(),
            },
        });
        let err = bus.publish(&event, PublishOpts::default()).await.unwrap_err();
        assert!(matches!(err, BusError::Config(_)));
    }

    #[tokio::test]
    async fn subscribe_type_filters_foreign_kinds() {
        let (bus, backend) = bus();

        // a lifecycle event forced onto cmd.request should never reach a
        // RequestMessage subscriber
        bus.publish(
            &Event::RequestLifecycle(crate::bus::events::RequestLifecyclePayload {
                state: crate::bus::events::RequestState::Resolved,
                reason: None,
            }),
            PublishOpts {
                headers: headers("r1"),
                topic: Some(Topic::CmdRequest),
                ..PublishOpts::default()
            },
        )
        .await
        .unwrap();
        bus.publish(
            &request_event("real"),
            PublishOpts {
                headers: headers("r1"),
                ..PublishOpts::default()
            },
        )
        .await
        .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = bus
            .subscribe_type(
                EventKind::RequestMessage,
                TypeSubscribeOptions {
                    topic: None,
                    options: SubscribeOptions {
                        mode: SubscribeMode::Work {
                            subscription_id: "workers".to_string(),
                            consumer: None,
                            offset: Offset::Begin,
                        },
                        block: Some(Duration::from_millis(50)),
                    },
                },
                move |delivery| {
                    let tx = tx.clone();
                    async move {
                        delivery.ctx.commit().await?;
                        tx.send(delivery.msg.ty.clone()).unwrap();
                        Ok(())
                    }
                },
            )
            .await
            .unwrap();

        let ty = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ty, "cmd.request.message");

        // the foreign kind was committed, not left pending
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let stats = backend.stats("cmd.request", "workers").await.unwrap();
                if stats.pending == 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        sub.stop().await;
    }

    #[tokio::test]
    async fn subscribe_type_for_output_requires_topic() {
        let (bus, _) = bus();
        let err = bus
            .subscribe_type(
                EventKind::AgentOutput,
                TypeSubscribeOptions {
                    topic: None,
                    options: SubscribeOptions {
                        mode: SubscribeMode::Tail {
                            offset: Offset::Begin,
                        },
                        block: None,
                    },
                },
                |_delivery| async move { Ok(()) },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Config(_)));
    }

    #[tokio::test]
    async fn subscribe_topic_delivers_union() {
        let (bus, _) = bus();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = bus
            .subscribe_topic(
                &Topic::CmdRequest,
                SubscribeOptions {
                    mode: SubscribeMode::Tail {
                        offset: Offset::Begin,
                    },
                    block: Some(Duration::from_millis(50)),
                },
                move |delivery| {
                    let tx = tx.clone();
                    async move {
                        tx.send(delivery.event).unwrap();
                        Ok(())
                    }
                },
            )
            .await
            .unwrap();

        bus.publish(
            &request_event("hello"),
            PublishOpts {
                headers: headers("r2"),
                ..PublishOpts::default()
            },
        )
        .await
        .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            Event::RequestMessage(payload) => {
                assert_eq!(payload.messages[0].text, "hello");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        sub.stop().await;
    }
}
