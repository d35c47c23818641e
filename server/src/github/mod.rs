//! GitHub surface: webhook ingress, REST helpers, App token minting, and
//! the mid-review preemption state machine

pub mod api;
pub mod payloads;
pub mod prompt;
pub mod review;
pub mod tokens;
pub mod webhook;

use thiserror::Error;

pub use api::GithubClient;
pub use review::{PreemptOutcome, ReviewTracker};
pub use tokens::{InstallationToken, TokenMinter};
pub use webhook::{WebhookConfig, WebhookState};

/// `request_client` header value for requests originating here
pub const REQUEST_CLIENT: &str = "github";

/// Error type for GitHub operations
#[derive(Debug, Error)]
pub enum GithubError {
    /// Identity material or configuration is missing or invalid
    #[error("configuration error: {0}")]
    Config(String),
    /// Exchanging the App JWT for an installation token failed
    #[error("token exchange failed: {0}")]
    TokenExchange(String),
    /// REST call rejected or returned an unexpected shape
    #[error("GitHub API error: {0}")]
    Api(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// Session id for a thread: `<owner>/<repo>#<number>`
pub fn session_id(repo_full_name: &str, number: u64) -> String {
    format!("{repo_full_name}#{number}")
}

/// Parse a session id. Accepts exactly `<owner>/<repo>#<number>` with a
/// positive integer number.
pub fn parse_session_id(s: &str) -> Option<(String, u64)> {
    let (repo, number) = s.split_once('#')?;
    let (owner, name) = repo.split_once('/')?;
    if owner.is_empty() || name.is_empty() || name.contains('/') {
        return None;
    }
    if number.is_empty() || !number.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let number: u64 = number.parse().ok()?;
    if number == 0 {
        return None;
    }
    Some((repo.to_string(), number))
}

/// Request id for a comment-triggered request:
/// `github:<owner/repo>#<n>:<commentId>`
pub fn comment_request_id(session_id: &str, comment_id: u64) -> String {
    format!("github:{session_id}:{comment_id}")
}

/// Request id for a review request:
/// `github:<owner/repo>#<n>:<prNumber>:<headSha[0..8]>`
pub fn review_request_id(session_id: &str, pr_number: u64, head_sha: &str) -> String {
    format!("github:{session_id}:{pr_number}:{}", short_sha(head_sha))
}

/// First 8 characters of a commit SHA
pub fn short_sha(sha: &str) -> &str {
    &sha[..sha.len().min(8)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_roundtrip() {
        let sid = session_id("acme/app", 42);
        assert_eq!(sid, "acme/app#42");
        assert_eq!(parse_session_id(&sid), Some(("acme/app".to_string(), 42)));
    }

    #[test]
    fn test_parse_session_id_rejects_bad_shapes() {
        assert_eq!(parse_session_id("acme/app"), None);
        assert_eq!(parse_session_id("acme#42"), None);
        assert_eq!(parse_session_id("/app#42"), None);
        assert_eq!(parse_session_id("acme/#42"), None);
        assert_eq!(parse_session_id("acme/app#0"), None);
        assert_eq!(parse_session_id("acme/app#-1"), None);
        assert_eq!(parse_session_id("acme/app#+1"), None);
        assert_eq!(parse_session_id("acme/app#12x"), None);
        assert_eq!(parse_session_id("a/b/c#1"), None);
        assert_eq!(parse_session_id("acme/app#"), None);
    }

    #[test]
    fn test_request_id_formats() {
        assert_eq!(
            comment_request_id("acme/app#42", 100),
            "github:acme/app#42:100"
        );
        assert_eq!(
            review_request_id("acme/app#7", 7, "aaaaaaaabbbbbbbbcccccccc"),
            "github:acme/app#7:7:aaaaaaaa"
        );
    }

    #[test]
    fn test_short_sha_tolerates_short_input() {
        assert_eq!(short_sha("abc"), "abc");
        assert_eq!(short_sha("0123456789"), "01234567");
    }
}
