//! Mid-review preemption state
//!
//! Tracks, per session, the latest request id plus per-request metadata
//! and acknowledgment markers. When a pull request's head moves while a
//! review request is active, `preempt` performs the state transition:
//! mint the request id for the new head, transfer the ack marker, and
//! repoint the session *before* any cancel is emitted so stale output can
//! be filtered by relay code.
//!
//! All writes come from the webhook handler task; reads go through
//! lock-guarded accessors.

use std::collections::HashMap;

use parking_lot::Mutex;

use super::review_request_id;
use crate::core::constants::REVIEW_PREEMPT_MAX_AGE_MS;

/// What produced a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestTrigger {
    Comment,
    ReviewRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewMode {
    Review,
}

/// Pull-request context of a review-mode request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrContext {
    pub number: u64,
    pub head_sha: String,
    pub mode: ReviewMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestMeta {
    pub session_id: String,
    pub repo_full_name: String,
    pub thread_number: u64,
    pub trigger: RequestTrigger,
    pub created_at_ms: i64,
    pub pr: Option<PrContext>,
}

/// Where the acknowledgment reaction was placed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckTarget {
    Comment(u64),
    Issue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckMarker {
    pub target: AckTarget,
    pub reaction_id: u64,
}

/// Result of a synchronize transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreemptOutcome {
    /// No request tracked for the session
    NoActiveRequest,
    /// Latest request is not a review
    NotReview,
    /// Review is older than the preemption window
    Stale,
    /// Head unchanged
    SameHead,
    /// Preempted: emit the interrupt for the old id, then the fresh
    /// prompt for the new one
    Preempt {
        old_request_id: String,
        new_request_id: String,
        pr_number: u64,
    },
}

#[derive(Default)]
struct TrackerState {
    latest_by_session: HashMap<String, String>,
    request_meta: HashMap<String, RequestMeta>,
    ack_by_request: HashMap<String, AckMarker>,
}

/// Session-scoped latest-request tracking
#[derive(Default)]
pub struct ReviewTracker {
    inner: Mutex<TrackerState>,
}

impl ReviewTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self, request_id: &str, meta: RequestMeta) {
        self.inner
            .lock()
            .request_meta
            .insert(request_id.to_string(), meta);
    }

    pub fn record_ack(&self, request_id: &str, marker: AckMarker) {
        self.inner
            .lock()
            .ack_by_request
            .insert(request_id.to_string(), marker);
    }

    pub fn set_latest(&self, session_id: &str, request_id: &str) {
        self.inner
            .lock()
            .latest_by_session
            .insert(session_id.to_string(), request_id.to_string());
    }

    pub fn latest(&self, session_id: &str) -> Option<String> {
        self.inner.lock().latest_by_session.get(session_id).cloned()
    }

    pub fn meta(&self, request_id: &str) -> Option<RequestMeta> {
        self.inner.lock().request_meta.get(request_id).cloned()
    }

    pub fn ack(&self, request_id: &str) -> Option<AckMarker> {
        self.inner.lock().ack_by_request.get(request_id).cloned()
    }

    /// Apply a `synchronize` to the session's state. On preemption the
    /// session points at the new request id and the old ack marker has
    /// been transferred before this returns; the caller then publishes
    /// the interrupt and the fresh prompt in that order.
    pub fn preempt(&self, session_id: &str, new_head_sha: &str, now_ms: i64) -> PreemptOutcome {
        let mut state = self.inner.lock();

        let Some(old_request_id) = state.latest_by_session.get(session_id).cloned() else {
            return PreemptOutcome::NoActiveRequest;
        };
        let Some(meta) = state.request_meta.get(&old_request_id) else {
            return PreemptOutcome::NoActiveRequest;
        };
        let Some(pr) = meta.pr.as_ref().filter(|pr| pr.mode == ReviewMode::Review) else {
            return PreemptOutcome::NotReview;
        };
        if now_ms - meta.created_at_ms > REVIEW_PREEMPT_MAX_AGE_MS {
            return PreemptOutcome::Stale;
        }
        if pr.head_sha == new_head_sha {
            return PreemptOutcome::SameHead;
        }

        let pr_number = pr.number;
        let new_request_id = review_request_id(session_id, pr_number, new_head_sha);

        if let Some(marker) = state.ack_by_request.remove(&old_request_id) {
            state.ack_by_request.insert(new_request_id.clone(), marker);
        }
        state
            .latest_by_session
            .insert(session_id.to_string(), new_request_id.clone());

        PreemptOutcome::Preempt {
            old_request_id,
            new_request_id,
            pr_number,
        }
    }
}
