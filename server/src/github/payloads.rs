//! Serde views of GitHub webhook bodies and REST responses
//!
//! Only the fields the ingress consumes are modeled; everything else in
//! the delivery is ignored.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub login: String,
    /// "User", "Bot", or "Organization"; teams have no login at all
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Repository {
    pub full_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Issue {
    pub number: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub html_url: String,
    /// Present when the issue is actually a pull request
    #[serde(default)]
    pub pull_request: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IssueComment {
    pub id: u64,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub user: Option<User>,
    #[serde(default)]
    pub html_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GitRef {
    pub sha: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub html_url: String,
    pub head: GitRef,
}

/// `issue_comment` webhook body
#[derive(Debug, Clone, Deserialize)]
pub struct IssueCommentEvent {
    pub action: String,
    pub issue: Issue,
    pub comment: IssueComment,
    pub repository: Repository,
}

/// `pull_request` webhook body
#[derive(Debug, Clone, Deserialize)]
pub struct PullRequestEvent {
    pub action: String,
    pub pull_request: PullRequest,
    #[serde(default)]
    pub requested_reviewer: Option<User>,
    pub repository: Repository,
}

/// Response of the reaction-create endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct ReactionCreated {
    pub id: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_comment_event_parses_minimal_body() {
        let body = serde_json::json!({
            "action": "created",
            "issue": {"number": 42, "title": "Crash on start", "html_url": "https://github.com/acme/app/issues/42"},
            "comment": {"id": 100, "body": "/lilac explain", "user": {"login": "alice", "type": "User"}},
            "repository": {"full_name": "acme/app"},
        });
        let event: IssueCommentEvent = serde_json::from_value(body).unwrap();
        assert_eq!(event.action, "created");
        assert_eq!(event.issue.number, 42);
        assert_eq!(event.comment.id, 100);
        assert!(event.issue.pull_request.is_none());
    }

    #[test]
    fn pull_request_event_parses_review_request() {
        let body = serde_json::json!({
            "action": "review_requested",
            "pull_request": {
                "number": 7,
                "title": "Add cache",
                "body": null,
                "html_url": "https://github.com/acme/app/pull/7",
                "head": {"sha": "aaaaaaaa000000000000"},
            },
            "requested_reviewer": {"login": "lilac-agent[bot]", "type": "Bot"},
            "repository": {"full_name": "acme/app"},
        });
        let event: PullRequestEvent = serde_json::from_value(body).unwrap();
        assert_eq!(event.pull_request.head.sha, "aaaaaaaa000000000000");
        assert_eq!(event.requested_reviewer.unwrap().login, "lilac-agent[bot]");
    }

    #[test]
    fn team_reviewer_has_no_login_field() {
        // team review requests carry requested_team instead
        let body = serde_json::json!({
            "action": "review_requested",
            "pull_request": {"number": 7, "head": {"sha": "abc"}},
            "requested_team": {"name": "platform"},
            "repository": {"full_name": "acme/app"},
        });
        let event: PullRequestEvent = serde_json::from_value(body).unwrap();
        assert!(event.requested_reviewer.is_none());
    }
}
