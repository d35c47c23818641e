//! Webhook ingress
//!
//! Terminates the HTTP intake for GitHub events and converts them into
//! bus publishes. Per delivery:
//!
//! 1. HMAC-SHA256 signature check over the raw body (constant-time
//!    compare of the decoded bytes) -> 401 on mismatch
//! 2. delivery-id dedup inside a 10-minute window -> `deduped` reply
//! 3. JSON parse -> 400 on malformed bodies
//! 4. dispatch on `(event, action)`; everything unhandled is ignored
//!
//! Handler errors reply 500 with a redacted message and leave the
//! delivery id in the dedup window, so GitHub's automatic redelivery does
//! not hammer a failing handler.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use dashmap::DashMap;
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use super::api::GithubClient;
use super::payloads::{Issue, IssueComment, IssueCommentEvent, PullRequest, PullRequestEvent};
use super::prompt::{
    ReviewPromptArgs, ThreadPromptArgs, extract_command, interrupt_prompt, is_trigger,
    review_prompt, thread_prompt,
};
use super::review::{
    AckMarker, AckTarget, PrContext, PreemptOutcome, RequestMeta, RequestTrigger, ReviewMode,
    ReviewTracker,
};
use super::{GithubError, REQUEST_CLIENT, comment_request_id, review_request_id, session_id};
use crate::bus::{
    ChatMessage, ControlFlags, Event, HEADER_REQUEST_CLIENT, HEADER_REQUEST_ID, HEADER_SESSION_ID,
    PublishOpts, RequestMessagePayload, RequestQueue, TypedBus,
};
use crate::core::constants::{
    DEDUP_TTL_MS, DEFAULT_RECENT_COMMENTS_LIMIT, HEADER_GITHUB_DELIVERY, HEADER_GITHUB_EVENT,
    HEADER_GITHUB_SIGNATURE,
};
use crate::utils::crypto::{constant_time_eq, hmac_sha256};
use crate::utils::time::now_ms;

/// The REST surface the ingress consumes, separated for testability
#[async_trait]
pub(crate) trait GithubApi: Send + Sync {
    async fn get_issue(&self, repo: &str, number: u64) -> Result<Issue, GithubError>;
    async fn get_pull(&self, repo: &str, number: u64) -> Result<PullRequest, GithubError>;
    async fn list_recent_comments(
        &self,
        repo: &str,
        number: u64,
        limit: usize,
    ) -> Result<Vec<IssueComment>, GithubError>;
    async fn ack_comment(&self, repo: &str, comment_id: u64) -> Result<u64, GithubError>;
    async fn ack_issue(&self, repo: &str, number: u64) -> Result<u64, GithubError>;
}

#[async_trait]
impl GithubApi for GithubClient {
    async fn get_issue(&self, repo: &str, number: u64) -> Result<Issue, GithubError> {
        GithubClient::get_issue(self, repo, number).await
    }
    async fn get_pull(&self, repo: &str, number: u64) -> Result<PullRequest, GithubError> {
        GithubClient::get_pull(self, repo, number).await
    }
    async fn list_recent_comments(
        &self,
        repo: &str,
        number: u64,
        limit: usize,
    ) -> Result<Vec<IssueComment>, GithubError> {
        GithubClient::list_recent_comments(self, repo, number, limit).await
    }
    async fn ack_comment(&self, repo: &str, comment_id: u64) -> Result<u64, GithubError> {
        GithubClient::ack_comment(self, repo, comment_id).await
    }
    async fn ack_issue(&self, repo: &str, number: u64) -> Result<u64, GithubError> {
        GithubClient::ack_issue(self, repo, number).await
    }
}

/// Compute the set of bot logins that trigger on mention: configured
/// direct logins plus the derived App bot login, de-duplicated preserving
/// insertion order. An empty set disables mention triggering.
pub fn bot_mention_logins(direct: &[String], app_slug: Option<&str>) -> Vec<String> {
    let mut logins: Vec<String> = Vec::new();
    let derived = app_slug.map(|slug| format!("{slug}[bot]"));
    for login in direct.iter().cloned().chain(derived) {
        if !logins.contains(&login) {
            logins.push(login);
        }
    }
    logins
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// Endpoint path, e.g. `/webhook`
    pub path: String,
    /// Shared webhook secret
    pub secret: Vec<u8>,
    /// Resolved bot mention set (see [`bot_mention_logins`])
    pub bot_logins: Vec<String>,
    /// Cap on recent comments included in a thread prompt
    pub recent_comments_limit: usize,
}

impl WebhookConfig {
    pub fn new(path: impl Into<String>, secret: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            secret: secret.into(),
            bot_logins: Vec::new(),
            recent_comments_limit: DEFAULT_RECENT_COMMENTS_LIMIT,
        }
    }
}

pub struct WebhookState {
    config: WebhookConfig,
    bus: TypedBus,
    api: Arc<dyn GithubApi>,
    review: ReviewTracker,
    /// delivery id -> expiry, swept lazily on observation
    dedup: DashMap<String, i64>,
}

impl WebhookState {
    pub fn new(config: WebhookConfig, bus: TypedBus, api: Arc<GithubClient>) -> Arc<Self> {
        Self::with_api(config, bus, api)
    }

    pub(crate) fn with_api(
        config: WebhookConfig,
        bus: TypedBus,
        api: Arc<dyn GithubApi>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            bus,
            api,
            review: ReviewTracker::new(),
            dedup: DashMap::new(),
        })
    }

    pub fn review(&self) -> &ReviewTracker {
        &self.review
    }

    /// Record a delivery id. Returns true when it was already seen inside
    /// the dedup window. Expired records are swept before insertion.
    fn observe_delivery(&self, delivery_id: &str) -> bool {
        let now = now_ms();
        self.dedup.retain(|_, expires_at| *expires_at > now);
        if self.dedup.contains_key(delivery_id) {
            return true;
        }
        self.dedup
            .insert(delivery_id.to_string(), now + DEDUP_TTL_MS);
        false
    }

    async fn publish_request(
        &self,
        request_id: &str,
        session_id: &str,
        payload: RequestMessagePayload,
    ) -> Result<(), GithubError> {
        let mut headers = HashMap::new();
        headers.insert(HEADER_REQUEST_ID.to_string(), request_id.to_string());
        headers.insert(HEADER_SESSION_ID.to_string(), session_id.to_string());
        headers.insert(HEADER_REQUEST_CLIENT.to_string(), REQUEST_CLIENT.to_string());
        self.bus
            .publish(
                &Event::RequestMessage(payload),
                PublishOpts {
                    headers,
                    ..PublishOpts::default()
                },
            )
            .await
            .map_err(|e| GithubError::Api(format!("bus publish failed: {e}")))?;
        Ok(())
    }

    async fn publish_prompt(
        &self,
        request_id: &str,
        session_id: &str,
        prompt: String,
    ) -> Result<(), GithubError> {
        self.publish_request(
            request_id,
            session_id,
            RequestMessagePayload {
                queue: RequestQueue::Prompt,
                messages: vec![ChatMessage::user(prompt)],
                control: None,
            },
        )
        .await
    }

    async fn handle_issue_comment(&self, event: IssueCommentEvent) -> Result<(), GithubError> {
        let body = event.comment.body.clone().unwrap_or_default();
        if !is_trigger(&body, &self.config.bot_logins) {
            return Ok(());
        }

        let repo = event.repository.full_name.as_str();
        let sid = session_id(repo, event.issue.number);
        let request_id = comment_request_id(&sid, event.comment.id);
        tracing::info!(request_id = %request_id, repo, "Comment trigger");

        // Best-effort acknowledgment; a missing reaction is not fatal
        match self.api.ack_comment(repo, event.comment.id).await {
            Ok(reaction_id) => self.review.record_ack(
                &request_id,
                AckMarker {
                    target: AckTarget::Comment(event.comment.id),
                    reaction_id,
                },
            ),
            Err(e) => {
                tracing::warn!(request_id = %request_id, error = %e, "Failed to place ack reaction");
            }
        }

        let issue = self.api.get_issue(repo, event.issue.number).await?;
        let mut recent = self
            .api
            .list_recent_comments(repo, event.issue.number, self.config.recent_comments_limit)
            .await?;
        recent.retain(|comment| comment.id != event.comment.id);

        let author = event
            .comment
            .user
            .as_ref()
            .map(|user| user.login.clone())
            .unwrap_or_else(|| "unknown".to_string());
        let command = extract_command(&body, &self.config.bot_logins);
        let prompt = thread_prompt(&ThreadPromptArgs {
            thread_url: &issue.html_url,
            trigger_url: Some(&event.comment.html_url),
            title: &issue.title,
            description: issue.body.as_deref().unwrap_or(""),
            author: &author,
            command: &command,
            recent: &recent,
        });

        self.review.record_request(
            &request_id,
            RequestMeta {
                session_id: sid.clone(),
                repo_full_name: repo.to_string(),
                thread_number: event.issue.number,
                trigger: RequestTrigger::Comment,
                created_at_ms: now_ms(),
                pr: None,
            },
        );

        self.publish_prompt(&request_id, &sid, prompt).await
    }

    async fn handle_review_requested(&self, event: PullRequestEvent) -> Result<(), GithubError> {
        // Team reviewers carry no login; only bot logins trigger
        let Some(reviewer) = event.requested_reviewer.as_ref() else {
            return Ok(());
        };
        if !self.config.bot_logins.contains(&reviewer.login) {
            return Ok(());
        }

        let repo = event.repository.full_name.as_str();
        let pr_number = event.pull_request.number;
        let head_sha = event.pull_request.head.sha.clone();
        let sid = session_id(repo, pr_number);
        let request_id = review_request_id(&sid, pr_number, &head_sha);
        tracing::info!(request_id = %request_id, repo, "Review requested");

        match self.api.ack_issue(repo, pr_number).await {
            Ok(reaction_id) => self.review.record_ack(
                &request_id,
                AckMarker {
                    target: AckTarget::Issue,
                    reaction_id,
                },
            ),
            Err(e) => {
                tracing::warn!(request_id = %request_id, error = %e, "Failed to place ack reaction");
            }
        }

        let pull = self.api.get_pull(repo, pr_number).await?;
        let prompt = review_prompt(&ReviewPromptArgs {
            thread_url: &pull.html_url,
            title: &pull.title,
            description: pull.body.as_deref().unwrap_or(""),
            pr_number,
            head_sha: &head_sha,
        });

        self.review.set_latest(&sid, &request_id);
        self.review.record_request(
            &request_id,
            RequestMeta {
                session_id: sid.clone(),
                repo_full_name: repo.to_string(),
                thread_number: pr_number,
                trigger: RequestTrigger::ReviewRequest,
                created_at_ms: now_ms(),
                pr: Some(PrContext {
                    number: pr_number,
                    head_sha,
                    mode: ReviewMode::Review,
                }),
            },
        );

        self.publish_prompt(&request_id, &sid, prompt).await
    }

    async fn handle_synchronize(&self, event: PullRequestEvent) -> Result<(), GithubError> {
        let repo = event.repository.full_name.as_str();
        let pr_number = event.pull_request.number;
        let new_head_sha = event.pull_request.head.sha.clone();
        let sid = session_id(repo, pr_number);

        let outcome = self.review.preempt(&sid, &new_head_sha, now_ms());
        let PreemptOutcome::Preempt {
            old_request_id,
            new_request_id,
            pr_number,
        } = outcome
        else {
            tracing::debug!(session_id = %sid, ?outcome, "Synchronize without preemption");
            return Ok(());
        };
        tracing::info!(
            old = %old_request_id,
            new = %new_request_id,
            "Review preempted by head update"
        );

        // Interrupt the in-flight review first; the fresh prompt follows
        self.publish_request(
            &old_request_id,
            &sid,
            RequestMessagePayload {
                queue: RequestQueue::Interrupt,
                messages: vec![ChatMessage::user(interrupt_prompt())],
                control: Some(ControlFlags {
                    cancel: true,
                    requires_active: true,
                }),
            },
        )
        .await?;

        let pull = self.api.get_pull(repo, pr_number).await?;
        let prompt = review_prompt(&ReviewPromptArgs {
            thread_url: &pull.html_url,
            title: &pull.title,
            description: pull.body.as_deref().unwrap_or(""),
            pr_number,
            head_sha: &new_head_sha,
        });

        self.review.record_request(
            &new_request_id,
            RequestMeta {
                session_id: sid.clone(),
                repo_full_name: repo.to_string(),
                thread_number: pr_number,
                trigger: RequestTrigger::ReviewRequest,
                created_at_ms: now_ms(),
                pr: Some(PrContext {
                    number: pr_number,
                    head_sha: new_head_sha,
                    mode: ReviewMode::Review,
                }),
            },
        );

        self.publish_prompt(&new_request_id, &sid, prompt).await
    }

    async fn dispatch(&self, event: &str, body: &[u8]) -> Result<(), GithubError> {
        match event {
            "issue_comment" => {
                let parsed: IssueCommentEvent = parse_body(body)?;
                if parsed.action == "created" {
                    self.handle_issue_comment(parsed).await?;
                }
            }
            "pull_request" => {
                let parsed: PullRequestEvent = parse_body(body)?;
                match parsed.action.as_str() {
                    "review_requested" => self.handle_review_requested(parsed).await?,
                    "synchronize" => self.handle_synchronize(parsed).await?,
                    _ => {}
                }
            }
            _ => {}
        }
        Ok(())
    }
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, GithubError> {
    serde_json::from_slice(body).map_err(|e| GithubError::Api(format!("unexpected body shape: {e}")))
}

/// Verify `sha256=<hex>` over the raw body. Equal-length decoded byte
/// sequences are compared in constant time; an unparsable signature (bad
/// prefix, odd length, non-hex) never matches.
pub fn verify_signature(secret: &[u8], body: &[u8], signature_header: &str) -> bool {
    let Some(expected) = signature_header
        .strip_prefix("sha256=")
        .and_then(|hex_part| hex::decode(hex_part).ok())
    else {
        return false;
    };
    let actual = hmac_sha256(secret, body);
    constant_time_eq(&actual, &expected)
}

fn reply_ok() -> Response {
    (StatusCode::OK, Json(json!({"ok": true}))).into_response()
}

fn reply_deduped() -> Response {
    (StatusCode::OK, Json(json!({"ok": true, "deduped": true}))).into_response()
}

fn reply_error(status: StatusCode, error: &str) -> Response {
    (status, Json(json!({"ok": false, "error": error}))).into_response()
}

pub(crate) async fn handle_webhook(
    State(state): State<Arc<WebhookState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    };

    let Some(event) = header(HEADER_GITHUB_EVENT) else {
        return reply_error(StatusCode::BAD_REQUEST, "missing event header");
    };
    let Some(delivery_id) = header(HEADER_GITHUB_DELIVERY) else {
        return reply_error(StatusCode::BAD_REQUEST, "missing delivery header");
    };
    let signature = header(HEADER_GITHUB_SIGNATURE).unwrap_or_default();

    if !verify_signature(&state.config.secret, &body, &signature) {
        tracing::warn!(delivery_id = %delivery_id, "Webhook signature mismatch");
        return reply_error(StatusCode::UNAUTHORIZED, "signature mismatch");
    }

    if state.observe_delivery(&delivery_id) {
        tracing::debug!(delivery_id = %delivery_id, "Duplicate delivery");
        return reply_deduped();
    }

    if serde_json::from_slice::<serde_json::Value>(&body).is_err() {
        return reply_error(StatusCode::BAD_REQUEST, "invalid body");
    }

    match state.dispatch(&event, &body).await {
        Ok(()) => reply_ok(),
        Err(e) => {
            // The delivery stays in the dedup window: redeliveries of a
            // failing event would otherwise retry in a tight storm.
            tracing::error!(delivery_id = %delivery_id, event = %event, error = %e, "Webhook handler failed");
            reply_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

pub fn router(state: Arc<WebhookState>) -> Router {
    let path = state.config.path.clone();
    Router::new()
        .route(&path, post(handle_webhook))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until the shutdown future resolves
pub async fn serve(
    state: Arc<WebhookState>,
    addr: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = router(state);
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "Webhook listener started");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
