//! Prompt shaping for GitHub-triggered requests

use super::payloads::IssueComment;
use crate::core::constants::{COMMENT_SNIPPET_MAX_CHARS, TRIGGER_COMMAND};

/// True when a comment body addresses the bot: it starts with the trigger
/// command (bare or followed by whitespace) or mentions one of the bot
/// logins.
pub fn is_trigger(body: &str, bot_logins: &[String]) -> bool {
    if let Some(rest) = body.strip_prefix(TRIGGER_COMMAND)
        && rest.chars().next().is_none_or(char::is_whitespace)
    {
        return true;
    }
    bot_logins
        .iter()
        .any(|login| body.contains(&format!("@{login}")))
}

/// Extract the command text from a trigger comment: strip the trigger
/// command prefix, otherwise strip all bot mentions. Falls back to the
/// original body when stripping leaves nothing.
pub fn extract_command(body: &str, bot_logins: &[String]) -> String {
    let stripped = if let Some(rest) = body.strip_prefix(TRIGGER_COMMAND) {
        rest.trim().to_string()
    } else {
        let mut text = body.to_string();
        for login in bot_logins {
            text = text.replace(&format!("@{login}"), "");
        }
        text.trim().to_string()
    };
    if stripped.is_empty() {
        body.trim().to_string()
    } else {
        stripped
    }
}

pub struct ThreadPromptArgs<'a> {
    pub thread_url: &'a str,
    pub trigger_url: Option<&'a str>,
    pub title: &'a str,
    pub description: &'a str,
    pub author: &'a str,
    pub command: &'a str,
    pub recent: &'a [IssueComment],
}

/// Prompt for a comment-triggered request: thread context plus the tail
/// of the recent conversation.
pub fn thread_prompt(args: &ThreadPromptArgs<'_>) -> String {
    let mut prompt = String::new();
    prompt.push_str(&format!("GitHub thread: {}\n", args.thread_url));
    if let Some(trigger_url) = args.trigger_url {
        prompt.push_str(&format!("Triggering comment: {trigger_url}\n"));
    }
    prompt.push_str(&format!("Title: {}\n", args.title));
    if !args.description.is_empty() {
        prompt.push_str(&format!(
            "Description:\n{}\n",
            truncate_chars(args.description, COMMENT_SNIPPET_MAX_CHARS)
        ));
    }
    if !args.recent.is_empty() {
        prompt.push_str("\nRecent comments:\n");
        for comment in args.recent {
            let author = comment
                .user
                .as_ref()
                .map(|u| u.login.as_str())
                .unwrap_or("unknown");
            let body = comment.body.as_deref().unwrap_or("");
            prompt.push_str(&format!(
                "- {author}: {}\n",
                truncate_chars(body, COMMENT_SNIPPET_MAX_CHARS)
            ));
        }
    }
    prompt.push_str(&format!("\n{} asks:\n{}\n", args.author, args.command));
    prompt
}

pub struct ReviewPromptArgs<'a> {
    pub thread_url: &'a str,
    pub title: &'a str,
    pub description: &'a str,
    pub pr_number: u64,
    pub head_sha: &'a str,
}

/// Prompt for a requested review. Embeds the head SHA and requires the
/// reviewer to re-check it before submitting: a moved head means the
/// review must be declined and restarted.
pub fn review_prompt(args: &ReviewPromptArgs<'_>) -> String {
    let mut prompt = String::new();
    prompt.push_str(&format!("GitHub thread: {}\n", args.thread_url));
    prompt.push_str(&format!(
        "Review requested on pull request #{} at head {}.\n",
        args.pr_number, args.head_sha
    ));
    prompt.push_str(&format!("Title: {}\n", args.title));
    if !args.description.is_empty() {
        prompt.push_str(&format!(
            "Description:\n{}\n",
            truncate_chars(args.description, COMMENT_SNIPPET_MAX_CHARS)
        ));
    }
    prompt.push_str(&format!(
        "\nReview the changes in this pull request. Before submitting the review, \
         verify that the head commit is still {}. If the head has changed, do not \
         submit: decline and request a fresh review of the new head.\n",
        args.head_sha
    ));
    prompt
}

/// Stop message published on the interrupt queue when a review is
/// superseded by a new head
pub fn interrupt_prompt() -> String {
    "The pull request you are reviewing has been updated; its head commit is gone. \
     Stop the current review now. A fresh review of the new head has been requested."
        .to_string()
}

/// Truncate to at most `max` characters, appending an ellipsis marker
pub(crate) fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let cut: String = s.chars().take(max).collect();
    format!("{cut}…")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::github::payloads::User;

    fn logins() -> Vec<String> {
        vec!["lilac-dev".to_string(), "lilac-agent[bot]".to_string()]
    }

    #[test]
    fn trigger_command_must_be_standalone_or_spaced() {
        assert!(is_trigger("/lilac", &logins()));
        assert!(is_trigger("/lilac explain this", &logins()));
        assert!(is_trigger("/lilac\nexplain", &logins()));
        assert!(!is_trigger("/lilacs are flowers", &logins()));
        assert!(!is_trigger("say /lilac", &logins()));
    }

    #[test]
    fn mention_triggers() {
        assert!(is_trigger("hey @lilac-dev look at this", &logins()));
        assert!(is_trigger("cc @lilac-agent[bot]", &logins()));
        assert!(!is_trigger("hey @someone-else", &logins()));
        assert!(!is_trigger("hey @lilac-dev", &[]));
    }

    #[test]
    fn extract_command_strips_trigger_prefix() {
        assert_eq!(extract_command("/lilac explain this", &logins()), "explain this");
        assert_eq!(
            extract_command("@lilac-dev please fix the build", &logins()),
            "please fix the build"
        );
    }

    #[test]
    fn extract_command_falls_back_to_original() {
        assert_eq!(extract_command("/lilac", &logins()), "/lilac");
        assert_eq!(extract_command("@lilac-dev", &logins()), "@lilac-dev");
    }

    #[test]
    fn thread_prompt_contains_link_and_command() {
        let recent = vec![IssueComment {
            id: 1,
            body: Some("I can reproduce this".to_string()),
            user: Some(User {
                login: "bob".to_string(),
                kind: None,
            }),
            html_url: String::new(),
        }];
        let prompt = thread_prompt(&ThreadPromptArgs {
            thread_url: "https://github.com/acme/app/issues/42",
            trigger_url: Some("https://github.com/acme/app/issues/42#issuecomment-100"),
            title: "Crash on start",
            description: "The app crashes immediately.",
            author: "alice",
            command: "explain",
            recent: &recent,
        });
        assert!(prompt.contains("GitHub thread: https://github.com/acme/app/issues/42"));
        assert!(prompt.contains("explain"));
        assert!(prompt.contains("bob: I can reproduce this"));
        assert!(prompt.contains("alice asks:"));
    }

    #[test]
    fn review_prompt_embeds_head_sha_and_recheck() {
        let prompt = review_prompt(&ReviewPromptArgs {
            thread_url: "https://github.com/acme/app/pull/7",
            title: "Add cache",
            description: "",
            pr_number: 7,
            head_sha: "aaaaaaaa000000000000",
        });
        assert!(prompt.contains("aaaaaaaa000000000000"));
        assert!(prompt.contains("If the head has changed"));
    }

    #[test]
    fn truncate_chars_bounds_length() {
        assert_eq!(truncate_chars("short", 10), "short");
        let long = "x".repeat(20);
        let cut = truncate_chars(&long, 10);
        assert_eq!(cut.chars().count(), 11);
        assert!(cut.ends_with('…'));
    }
}
