//! Event schema: topics, event kinds, and payload shapes
//!
//! The topic set is closed: six static topics plus the parametric
//! `out.req.<requestId>` family carrying per-request agent output.
//!
//! Every event kind maps to a topic and a default correlation key.
//! Payloads are MessagePack-encoded with named fields so decoders tolerate
//! added fields.

use std::collections::HashMap;
use std::fmt;

use lilac_surface::OutputFragment;
use serde::{Deserialize, Serialize};

use super::envelope::HEADER_REQUEST_ID;
use super::error::BusError;

/// Prefix of the per-request output-stream topic family
pub const OUTPUT_TOPIC_PREFIX: &str = "out.req.";

/// The closed set of bus topics
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Inbound user requests for workers
    CmdRequest,
    /// Workflow dispatch commands
    CmdWorkflow,
    /// Agent run commands
    CmdAgent,
    /// Surface adapter signals
    EvtAdapter,
    /// Request lifecycle events
    EvtRequest,
    /// Workflow lifecycle events
    EvtWorkflow,
    /// Per-request agent output stream
    OutputRequest(String),
}

impl Topic {
    pub fn name(&self) -> String {
        match self {
            Topic::CmdRequest => "cmd.request".to_string(),
            Topic::CmdWorkflow => "cmd.workflow".to_string(),
            Topic::CmdAgent => "cmd.agent".to_string(),
            Topic::EvtAdapter => "evt.adapter".to_string(),
            Topic::EvtRequest => "evt.request".to_string(),
            Topic::EvtWorkflow => "evt.workflow".to_string(),
            Topic::OutputRequest(request_id) => format!("{OUTPUT_TOPIC_PREFIX}{request_id}"),
        }
    }

    pub fn parse(s: &str) -> Option<Topic> {
        match s {
            "cmd.request" => Some(Topic::CmdRequest),
            "cmd.workflow" => Some(Topic::CmdWorkflow),
            "cmd.agent" => Some(Topic::CmdAgent),
            "evt.adapter" => Some(Topic::EvtAdapter),
            "evt.request" => Some(Topic::EvtRequest),
            "evt.workflow" => Some(Topic::EvtWorkflow),
            _ => s
                .strip_prefix(OUTPUT_TOPIC_PREFIX)
                .filter(|rid| !rid.is_empty())
                .map(|rid| Topic::OutputRequest(rid.to_string())),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Discriminant of the event registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    RequestMessage,
    RequestLifecycle,
    WorkflowDispatch,
    WorkflowLifecycle,
    AgentInvoke,
    AdapterSignal,
    AgentOutput,
}

impl EventKind {
    pub fn wire_type(&self) -> &'static str {
        match self {
            EventKind::RequestMessage => "cmd.request.message",
            EventKind::RequestLifecycle => "evt.request.lifecycle",
            EventKind::WorkflowDispatch => "cmd.workflow.dispatch",
            EventKind::WorkflowLifecycle => "evt.workflow.lifecycle",
            EventKind::AgentInvoke => "cmd.agent.invoke",
            EventKind::AdapterSignal => "evt.adapter.signal",
            EventKind::AgentOutput => "out.agent.output",
        }
    }

    pub fn parse(s: &str) -> Option<EventKind> {
        match s {
            "cmd.request.message" => Some(EventKind::RequestMessage),
            "evt.request.lifecycle" => Some(EventKind::RequestLifecycle),
            "cmd.workflow.dispatch" => Some(EventKind::WorkflowDispatch),
            "evt.workflow.lifecycle" => Some(EventKind::WorkflowLifecycle),
            "cmd.agent.invoke" => Some(EventKind::AgentInvoke),
            "evt.adapter.signal" => Some(EventKind::AdapterSignal),
            "out.agent.output" => Some(EventKind::AgentOutput),
            _ => None,
        }
    }

    /// The topic this kind publishes to. `None` for output-stream kinds,
    /// whose topic is derived from the `request_id` header.
    pub fn static_topic(&self) -> Option<Topic> {
        match self {
            EventKind::RequestMessage => Some(Topic::CmdRequest),
            EventKind::RequestLifecycle => Some(Topic::EvtRequest),
            EventKind::WorkflowDispatch => Some(Topic::CmdWorkflow),
            EventKind::WorkflowLifecycle => Some(Topic::EvtWorkflow),
            EventKind::AgentInvoke => Some(Topic::CmdAgent),
            EventKind::AdapterSignal => Some(Topic::EvtAdapter),
            EventKind::AgentOutput => None,
        }
    }

    pub fn decode(&self, data: &[u8]) -> Result<Event, BusError> {
        fn de<'a, T: Deserialize<'a>>(data: &'a [u8]) -> Result<T, BusError> {
            rmp_serde::from_slice(data).map_err(|e| BusError::Decode(e.to_string()))
        }
        Ok(match self {
            EventKind::RequestMessage => Event::RequestMessage(de(data)?),
            EventKind::RequestLifecycle => Event::RequestLifecycle(de(data)?),
            EventKind::WorkflowDispatch => Event::WorkflowDispatch(de(data)?),
            EventKind::WorkflowLifecycle => Event::WorkflowLifecycle(de(data)?),
            EventKind::AgentInvoke => Event::AgentInvoke(de(data)?),
            EventKind::AdapterSignal => Event::AdapterSignal(de(data)?),
            EventKind::AgentOutput => Event::AgentOutput(de(data)?),
        })
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.wire_type())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub text: String,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            text: text.into(),
        }
    }
}

/// Which worker queue a request message targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestQueue {
    /// Normal prompt intake
    Prompt,
    /// Preempts the currently active run for the keyed request
    Interrupt,
}

/// Out-of-band control flags carried by interrupt messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlFlags {
    pub cancel: bool,
    /// Only act when a run is currently active for the request
    pub requires_active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMessagePayload {
    pub queue: RequestQueue,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control: Option<ControlFlags>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Resolved,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestLifecyclePayload {
    pub state: RequestState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDispatchPayload {
    pub workflow_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Started,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowLifecyclePayload {
    pub workflow_id: String,
    pub state: WorkflowState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInvokePayload {
    pub run_id: String,
    pub request_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterSignalKind {
    MessageCreated,
    MessageEdited,
    MessageDeleted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterSignalPayload {
    /// Source message id on the originating surface
    pub message_id: String,
    pub session_id: String,
    pub signal: AdapterSignalKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentOutputPayload {
    pub fragment: OutputFragment,
}

/// Discriminated union over all event kinds
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    RequestMessage(RequestMessagePayload),
    RequestLifecycle(RequestLifecyclePayload),
    WorkflowDispatch(WorkflowDispatchPayload),
    WorkflowLifecycle(WorkflowLifecyclePayload),
    AgentInvoke(AgentInvokePayload),
    AdapterSignal(AdapterSignalPayload),
    AgentOutput(AgentOutputPayload),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::RequestMessage(_) => EventKind::RequestMessage,
            Event::RequestLifecycle(_) => EventKind::RequestLifecycle,
            Event::WorkflowDispatch(_) => EventKind::WorkflowDispatch,
            Event::WorkflowLifecycle(_) => EventKind::WorkflowLifecycle,
            Event::AgentInvoke(_) => EventKind::AgentInvoke,
            Event::AdapterSignal(_) => EventKind::AdapterSignal,
            Event::AgentOutput(_) => EventKind::AgentOutput,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, BusError> {
        fn ser<T: Serialize>(payload: &T) -> Result<Vec<u8>, BusError> {
            rmp_serde::to_vec_named(payload).map_err(|e| BusError::Encode(e.to_string()))
        }
        match self {
            Event::RequestMessage(p) => ser(p),
            Event::RequestLifecycle(p) => ser(p),
            Event::WorkflowDispatch(p) => ser(p),
            Event::WorkflowLifecycle(p) => ser(p),
            Event::AgentInvoke(p) => ser(p),
            Event::AdapterSignal(p) => ser(p),
            Event::AgentOutput(p) => ser(p),
        }
    }

    /// Default correlation key: the relevant id for request/workflow/agent
    /// and output events, the source message id for adapter signals.
    pub(crate) fn default_key(&self, headers: &HashMap<String, String>) -> Option<String> {
        match self {
            Event::RequestMessage(_) | Event::RequestLifecycle(_) | Event::AgentOutput(_) => {
                headers.get(HEADER_REQUEST_ID).cloned()
            }
            Event::WorkflowDispatch(p) => Some(p.workflow_id.clone()),
            Event::WorkflowLifecycle(p) => Some(p.workflow_id.clone()),
            Event::AgentInvoke(p) => Some(p.run_id.clone()),
            Event::AdapterSignal(p) => Some(p.message_id.clone()),
        }
    }
}
