//! Event bus
//!
//! Durable pub/sub over an append-only stream store with pluggable
//! backends:
//! - In-memory (default) - local-only, for development and single-process
//! - Redis Streams - distributed, for multi-machine deployments
//!
//! ## Layers
//!
//! - [`pool`]: dedicated-connection pool for blocking reads, with
//!   autoscaling and shared-connection fallback on exhaustion
//! - [`RawBus`]: publish / fetch / subscribe with tail, work, and fanout
//!   modes, cursors, and explicit acks
//! - [`TypedBus`]: event-schema dispatch, topic/key derivation, and
//!   discriminated-union delivery
//!
//! Ordering is guaranteed within a topic for a single consumer, and
//! within a correlation key; nothing is guaranteed across topics.
//! Delivery is at-least-once: consumers are expected to be idempotent.

mod backend;
mod envelope;
mod error;
mod events;
mod memory;
pub mod pool;
mod raw;
mod redis;
mod typed;

pub use backend::{Offset, RangeStart, StreamBackend, StreamReader, StreamStats};
pub use envelope::{
    Envelope, HEADER_REQUEST_CLIENT, HEADER_REQUEST_ID, HEADER_SESSION_ID, RawEntry,
};
pub use error::{BusError, PoolError};
pub use events::{
    AdapterSignalKind, AdapterSignalPayload, AgentInvokePayload, AgentOutputPayload, ChatMessage,
    ControlFlags, Event, EventKind, MessageRole, OUTPUT_TOPIC_PREFIX, RequestLifecyclePayload,
    RequestMessagePayload, RequestQueue, RequestState, Topic, WorkflowDispatchPayload,
    WorkflowLifecyclePayload, WorkflowState,
};
pub use memory::MemoryStreamBackend;
pub use raw::{
    DEFAULT_BLOCK, Delivery, DeliveryCtx, FetchOptions, FetchResult, MAX_BLOCK, PublishRequest,
    RawBus, Receipt, SubscribeMode, SubscribeOptions, Subscription,
};
pub use redis::{RedisConnectionFactory, RedisStreamBackend};
pub use typed::{PublishOpts, TypeSubscribeOptions, TypedBatch, TypedBus, TypedDelivery};
