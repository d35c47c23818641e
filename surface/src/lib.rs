//! Platform surface contract
//!
//! A *surface* is a chat platform or similar front end (Discord, a GitHub
//! thread, a terminal) that relays user requests into the orchestrator and
//! receives agent output back. This crate defines the operations the
//! orchestrator core consumes; per-platform adapters implement them and
//! nothing in the core depends on a concrete platform.
//!
//! ## Idempotency
//!
//! Adapters must make every operation idempotent under retry where the
//! underlying platform API allows it. `send_msg` is the known exception:
//! it creates a new message on every call, so callers guard it themselves
//! (typically by correlating on the returned [`MessageRef`]).

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Opaque reference to a conversation on a surface (channel, thread, issue).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionRef(pub String);

/// Opaque reference to a single message on a surface.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageRef(pub String);

impl fmt::Display for SessionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for MessageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error type for surface operations
#[derive(Debug, thiserror::Error)]
pub enum SurfaceError {
    /// Operation is not supported by this surface (see [`SurfaceCapabilities`])
    #[error("operation not supported by this surface: {0}")]
    Unsupported(&'static str),
    /// Referenced message or session does not exist
    #[error("not found: {0}")]
    NotFound(String),
    /// Platform API rejected or failed the call
    #[error("platform error: {0}")]
    Platform(String),
}

/// Message content sent to a surface
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageContent {
    pub text: String,
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// A message read back from a surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurfaceMessage {
    pub id: MessageRef,
    pub author: String,
    pub text: String,
    /// Creation time in epoch milliseconds
    pub created_at_ms: i64,
}

/// Options for `send_msg` and `start_output`
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Message to thread the reply under, where the platform supports it
    pub reply_to: Option<MessageRef>,
}

/// Options for `list_msg`
#[derive(Debug, Clone)]
pub struct ListOptions {
    pub limit: usize,
    pub before: Option<MessageRef>,
    pub after: Option<MessageRef>,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            limit: 50,
            before: None,
            after: None,
        }
    }
}

/// One typed fragment of agent output relayed to a surface.
///
/// A stream is a sequence of deltas and progress markers terminated by
/// either a `FinalText` fragment or the stream's `finish`/`abort` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutputFragment {
    /// Incremental text to append to the in-progress message
    TextDelta { text: String },
    /// Complete final text, replacing any accumulated deltas
    FinalText { text: String },
    /// Binary attachment (image, archive, patch file)
    Binary {
        name: String,
        content_type: String,
        data: Vec<u8>,
    },
    /// Progress marker for an in-flight tool call
    ToolProgress {
        tool: String,
        status: ToolStatus,
        detail: Option<String>,
    },
}

/// Lifecycle of a single tool call as rendered on a surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Started,
    Progress,
    Done,
}

/// Streaming output sink bound to one in-progress surface message.
///
/// `finish` finalizes atomically; `abort` finalizes whatever was already
/// flushed and marks the message as interrupted.
#[async_trait]
pub trait OutputStream: Send {
    async fn push(&mut self, fragment: OutputFragment) -> Result<(), SurfaceError>;

    async fn finish(self: Box<Self>) -> Result<MessageRef, SurfaceError>;

    async fn abort(self: Box<Self>, reason: &str) -> Result<(), SurfaceError>;
}

/// Feature flags a surface adapter advertises.
///
/// Callers must consult these before invoking optional operations;
/// unsupported calls return [`SurfaceError::Unsupported`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SurfaceCapabilities {
    pub reactions: bool,
    pub edits: bool,
    pub deletes: bool,
    pub threads: bool,
    /// Whether `edit_msg` reads the current content first and skips the
    /// write when it is unchanged. Adapters without cheap reads may edit
    /// unconditionally.
    pub edit_checks_equality: bool,
}

/// Inbound event pushed by a surface (not applicable to webhook-driven
/// platforms, whose events arrive out-of-band).
#[derive(Debug, Clone)]
pub enum SurfaceEvent {
    MessageCreated {
        session: SessionRef,
        message: SurfaceMessage,
    },
    MessageEdited {
        session: SessionRef,
        message: SurfaceMessage,
    },
    MessageDeleted {
        session: SessionRef,
        message: MessageRef,
    },
}

/// Handler invoked for each inbound surface event
pub type SurfaceEventHandler = Arc<dyn Fn(SurfaceEvent) -> BoxFuture<'static, ()> + Send + Sync>;

/// Handle to an inbound-event subscription
pub struct SurfaceSubscription {
    stop: Box<dyn FnOnce() + Send>,
}

impl SurfaceSubscription {
    pub fn new(stop: impl FnOnce() + Send + 'static) -> Self {
        Self {
            stop: Box::new(stop),
        }
    }

    /// Stop delivering events. Idempotent from the caller's perspective:
    /// the handle is consumed.
    pub fn stop(self) {
        (self.stop)();
    }
}

/// The operations the orchestrator core requires from a platform adapter.
#[async_trait]
pub trait Surface: Send + Sync {
    /// Open a streaming output message in the given session.
    async fn start_output(
        &self,
        session: &SessionRef,
        opts: SendOptions,
    ) -> Result<Box<dyn OutputStream>, SurfaceError>;

    /// Send a complete message. Not idempotent; callers guard retries.
    async fn send_msg(
        &self,
        session: &SessionRef,
        content: MessageContent,
        opts: SendOptions,
    ) -> Result<MessageRef, SurfaceError>;

    /// Read a single message, `None` if it no longer exists.
    async fn read_msg(&self, msg: &MessageRef) -> Result<Option<SurfaceMessage>, SurfaceError>;

    /// List messages in a session, newest last.
    async fn list_msg(
        &self,
        session: &SessionRef,
        opts: ListOptions,
    ) -> Result<Vec<SurfaceMessage>, SurfaceError>;

    /// Replace a message's content. When the adapter advertises
    /// `edit_checks_equality`, an edit to identical content is a no-op.
    async fn edit_msg(&self, msg: &MessageRef, content: MessageContent)
    -> Result<(), SurfaceError>;

    /// Delete a message, where the platform supports it.
    async fn delete_msg(&self, msg: &MessageRef) -> Result<(), SurfaceError>;

    async fn add_reaction(&self, msg: &MessageRef, reaction: &str) -> Result<(), SurfaceError>;

    async fn remove_reaction(&self, msg: &MessageRef, reaction: &str) -> Result<(), SurfaceError>;

    async fn list_reactions(&self, msg: &MessageRef) -> Result<Vec<String>, SurfaceError>;

    fn capabilities(&self) -> SurfaceCapabilities;

    /// Subscribe to inbound platform events. Webhook-driven surfaces
    /// return `Unsupported`.
    fn subscribe(&self, handler: SurfaceEventHandler)
    -> Result<SurfaceSubscription, SurfaceError>;
}
