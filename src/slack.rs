//! Slack notification sink.
//!
//! Failures here are always logged and swallowed by the caller; a broken
//! webhook must never take down a pipeline run.

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Slack rejects messages above this length; longer texts are split on
/// line boundaries.
pub const MAX_MESSAGE_LEN: usize = 4000;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("slack request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("slack API error: {0}")]
    Api(String),
}

/// Seam between the scheduler and the chat service. Tests substitute a
/// recording mock.
pub trait Notifier {
    /// Post a message, optionally into an existing thread. Returns the
    /// `(ts, channel)` pair identifying the new message.
    fn send(&self, text: &str, thread_id: Option<&str>) -> Result<(String, String), NotifyError>;

    /// Replace the text of an earlier message identified by `ts`.
    fn update(&self, text: &str, ts: &str) -> Result<(String, String), NotifyError>;
}

/// Production [`Notifier`] talking to the Slack Web API.
pub struct SlackNotifier {
    channel: String,
    token: String,
    client: reqwest::blocking::Client,
}

#[derive(Debug, Deserialize)]
struct SlackResponse {
    ok: bool,
    #[serde(default)]
    ts: Option<String>,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl SlackNotifier {
    pub fn new(channel: String, token: String) -> Self {
        SlackNotifier {
            channel,
            token,
            client: reqwest::blocking::Client::new(),
        }
    }

    fn call(
        &self,
        method: &str,
        mut body: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(String, String), NotifyError> {
        body.insert("channel".to_string(), self.channel.clone().into());

        let response: SlackResponse = self
            .client
            .post(format!("https://slack.com/api/{method}"))
            .bearer_auth(&self.token)
            .json(&body)
            .send()?
            .json()?;

        if !response.ok {
            return Err(NotifyError::Api(
                response.error.unwrap_or_else(|| "unknown error".to_string()),
            ));
        }
        let ts = response.ts.unwrap_or_default();
        let channel = response.channel.unwrap_or_else(|| self.channel.clone());
        debug!(%ts, %channel, method, "slack message accepted");
        Ok((ts, channel))
    }
}

impl Notifier for SlackNotifier {
    fn send(&self, text: &str, thread_id: Option<&str>) -> Result<(String, String), NotifyError> {
        let chunks = split_message(text, MAX_MESSAGE_LEN);
        let mut first: Option<(String, String)> = None;

        for chunk in chunks {
            let mut body = serde_json::Map::new();
            body.insert("text".to_string(), chunk.into());
            // Follow-up chunks thread under the first one.
            let thread = first.as_ref().map(|(ts, _)| ts.as_str()).or(thread_id);
            if let Some(thread) = thread {
                body.insert("thread_ts".to_string(), thread.into());
            }
            let ids = self.call("chat.postMessage", body)?;
            first.get_or_insert(ids);
        }

        Ok(first.unwrap_or_default())
    }

    fn update(&self, text: &str, ts: &str) -> Result<(String, String), NotifyError> {
        let mut chunks = split_message(text, MAX_MESSAGE_LEN).into_iter();
        let head = chunks.next().unwrap_or_default();

        let mut body = serde_json::Map::new();
        body.insert("text".to_string(), head.into());
        body.insert("ts".to_string(), ts.into());
        let ids = self.call("chat.update", body)?;

        // Overflow that no longer fits the original message goes into its
        // thread.
        for chunk in chunks {
            let mut body = serde_json::Map::new();
            body.insert("text".to_string(), chunk.into());
            body.insert("thread_ts".to_string(), ts.into());
            self.call("chat.postMessage", body)?;
        }
        Ok(ids)
    }
}

/// Split `text` into chunks of at most `limit` characters, cutting only at
/// line boundaries. Triple-backtick code blocks are closed at the end of a
/// chunk and reopened at the start of the next so every chunk renders
/// correctly on its own.
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    const FENCE: &str = "```";

    if text.len() <= limit {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut in_code_block = false;

    for line in text.split_inclusive('\n') {
        // Room needed to close a fence if we have to cut here.
        let closing = if in_code_block { FENCE.len() + 1 } else { 0 };
        if !current.is_empty() && current.len() + line.len() + closing > limit {
            if in_code_block {
                if !current.ends_with('\n') {
                    current.push('\n');
                }
                current.push_str(FENCE);
            }
            chunks.push(std::mem::take(&mut current));
            if in_code_block {
                current.push_str(FENCE);
                current.push('\n');
            }
        }
        current.push_str(line);
        if line.matches(FENCE).count() % 2 == 1 {
            in_code_block = !in_code_block;
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_messages_pass_through() {
        assert_eq!(split_message("hello", 4000), vec!["hello"]);
    }

    #[test]
    fn splits_on_line_boundaries() {
        let text = "line one\nline two\nline three\n";
        let chunks = split_message(text, 20);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.len() <= 20, "chunk too long: {chunk:?}");
        }
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn code_blocks_stay_balanced() {
        let mut text = String::from("Some text before the code block.\n```\n");
        for _ in 0..500 {
            text.push_str("This is a sample code block.\n");
        }
        text.push_str("```\nSome text after the code block.");

        let chunks = split_message(&text, MAX_MESSAGE_LEN);
        assert_eq!(chunks.len(), 4);
        for chunk in &chunks {
            assert_eq!(
                chunk.matches("```").count() % 2,
                0,
                "unbalanced fences in {chunk:?}"
            );
        }
        assert!(chunks.last().unwrap().starts_with("```"));
        assert!(chunks
            .last()
            .unwrap()
            .ends_with("Some text after the code block."));
    }
}
