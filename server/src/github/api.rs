//! Minimal GitHub REST client
//!
//! Covers exactly what the ingress needs: issue/PR reads, recent
//! comments, and acknowledgment reactions. Every call authenticates with
//! a fresh installation token from the minter (cached there) and targets
//! the API base URL the identity material names, so GitHub Enterprise
//! hosts work unchanged.
//!
//! No retries and no per-call timeouts here; callers own cancellation.

use std::path::PathBuf;
use std::sync::Arc;

use serde::de::DeserializeOwned;

use super::payloads::{Issue, IssueComment, PullRequest, ReactionCreated};
use super::tokens::TokenMinter;
use super::GithubError;
use crate::core::constants::USER_AGENT;

/// Reaction placed as an acknowledgment marker
pub const ACK_REACTION: &str = "eyes";

/// Comments fetched per page when listing a thread tail
const COMMENTS_PAGE_SIZE: usize = 100;

pub struct GithubClient {
    http: reqwest::Client,
    minter: Arc<TokenMinter>,
    config_dir: PathBuf,
}

impl GithubClient {
    pub fn new(http: reqwest::Client, minter: Arc<TokenMinter>, config_dir: PathBuf) -> Self {
        Self {
            http,
            minter,
            config_dir,
        }
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<T, GithubError> {
        let response = request
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(GithubError::Api(format!("{what} failed: {status}")));
        }
        Ok(response.json::<T>().await?)
    }

    async fn base_and_token(&self) -> Result<(String, String), GithubError> {
        let token = self.minter.get_token(&self.config_dir).await?;
        Ok((token.api_base_url, token.token))
    }

    pub async fn get_issue(&self, repo: &str, number: u64) -> Result<Issue, GithubError> {
        let (base, token) = self.base_and_token().await?;
        let url = format!("{base}/repos/{repo}/issues/{number}");
        self.send(self.http.get(&url).bearer_auth(token), "get issue")
            .await
    }

    pub async fn get_pull(&self, repo: &str, number: u64) -> Result<PullRequest, GithubError> {
        let (base, token) = self.base_and_token().await?;
        let url = format!("{base}/repos/{repo}/pulls/{number}");
        self.send(self.http.get(&url).bearer_auth(token), "get pull request")
            .await
    }

    /// The most recent comments of a thread, oldest first, capped at
    /// `limit`. Reads one page and keeps its tail.
    pub async fn list_recent_comments(
        &self,
        repo: &str,
        number: u64,
        limit: usize,
    ) -> Result<Vec<IssueComment>, GithubError> {
        let (base, token) = self.base_and_token().await?;
        let url = format!(
            "{base}/repos/{repo}/issues/{number}/comments?per_page={COMMENTS_PAGE_SIZE}"
        );
        let mut comments: Vec<IssueComment> = self
            .send(self.http.get(&url).bearer_auth(token), "list comments")
            .await?;
        if comments.len() > limit {
            comments.drain(..comments.len() - limit);
        }
        Ok(comments)
    }

    /// Place the acknowledgment reaction on a comment; returns the
    /// reaction id so it can be moved later.
    pub async fn ack_comment(&self, repo: &str, comment_id: u64) -> Result<u64, GithubError> {
        let (base, token) = self.base_and_token().await?;
        let url = format!("{base}/repos/{repo}/issues/comments/{comment_id}/reactions");
        let created: ReactionCreated = self
            .send(
                self.http
                    .post(&url)
                    .bearer_auth(token)
                    .json(&serde_json::json!({"content": ACK_REACTION})),
                "react to comment",
            )
            .await?;
        Ok(created.id)
    }

    /// Place the acknowledgment reaction on an issue or PR body
    pub async fn ack_issue(&self, repo: &str, number: u64) -> Result<u64, GithubError> {
        let (base, token) = self.base_and_token().await?;
        let url = format!("{base}/repos/{repo}/issues/{number}/reactions");
        let created: ReactionCreated = self
            .send(
                self.http
                    .post(&url)
                    .bearer_auth(token)
                    .json(&serde_json::json!({"content": ACK_REACTION})),
                "react to issue",
            )
            .await?;
        Ok(created.id)
    }
}
