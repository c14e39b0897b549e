//! Pending reflection payloads produced by REFLECTION missions.

use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reflection {
    pub title: String,
    #[serde(default)]
    pub blog_content: String,
    #[serde(default)]
    pub tweet_content: String,
}

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("No valid JSON block detected")]
    NoJson,

    #[error("Invalid reflection JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Required key \"title\" missing from harvested object")]
    MissingTitle,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("No pending reflection")]
    NothingPending,

    #[error("Publish failed: {0}")]
    Publish(String),
}

fn trailing_commas() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r",(\s*[\]}])").expect("valid trailing comma regex"))
}

/// Pull the trailing reflection object out of generator output.
///
/// The object starts at the last `{"title"` (or the first `{` when that key
/// is not found) and ends at the last `}`. Trailing commas are tolerated.
pub fn harvest_reflection(raw: &str) -> Result<Reflection, HarvestError> {
    let start = raw
        .rfind("{\"title\"")
        .or_else(|| raw.find('{'))
        .ok_or(HarvestError::NoJson)?;
    let end = raw.rfind('}').ok_or(HarvestError::NoJson)?;
    if end < start {
        return Err(HarvestError::NoJson);
    }

    let block = trailing_commas().replace_all(&raw[start..=end], "$1");
    let value: serde_json::Value = serde_json::from_str(&block)?;
    if value.get("title").is_none() {
        return Err(HarvestError::MissingTitle);
    }
    Ok(serde_json::from_value(value)?)
}

/// Downstream consumer of a finished reflection (blog, microblog, ...).
#[async_trait]
pub trait ReflectionPublisher: Send + Sync {
    async fn publish(&self, reflection: &Reflection) -> Result<(), String>;
}

/// Holds at most one reflection awaiting dispatch.
#[derive(Debug, Default)]
pub struct ReflectionBuffer {
    pending: Mutex<Option<Reflection>>,
}

impl ReflectionBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the pending reflection.
    pub async fn stage(&self, reflection: Reflection) {
        info!(title = %reflection.title, "Reflection staged");
        *self.pending.lock().await = Some(reflection);
    }

    pub async fn peek(&self) -> Option<Reflection> {
        self.pending.lock().await.clone()
    }

    /// Drop the pending reflection. Returns whether one was present.
    pub async fn purge(&self) -> bool {
        self.pending.lock().await.take().is_some()
    }

    /// Publish the pending reflection. On failure it is staged again unless a
    /// newer one arrived in the meantime.
    pub async fn dispatch(&self, publisher: &dyn ReflectionPublisher) -> Result<Reflection, DispatchError> {
        let reflection = self
            .pending
            .lock()
            .await
            .take()
            .ok_or(DispatchError::NothingPending)?;

        match publisher.publish(&reflection).await {
            Ok(()) => {
                info!(title = %reflection.title, "Reflection dispatched");
                Ok(reflection)
            }
            Err(e) => {
                warn!(title = %reflection.title, "Reflection dispatch failed, re-staging: {}", e);
                let mut pending = self.pending.lock().await;
                if pending.is_none() {
                    *pending = Some(reflection);
                }
                Err(DispatchError::Publish(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn sample(title: &str) -> Reflection {
        Reflection {
            title: title.to_string(),
            blog_content: "Long form".to_string(),
            tweet_content: "Short form".to_string(),
        }
    }

    struct FlakyPublisher {
        fail: AtomicBool,
    }

    #[async_trait]
    impl ReflectionPublisher for FlakyPublisher {
        async fn publish(&self, _reflection: &Reflection) -> Result<(), String> {
            if self.fail.load(Ordering::SeqCst) {
                Err("microblog rejected post".to_string())
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn harvests_last_title_object_after_log_noise() {
        let raw = "Thinking...\n{\"draft\": true}\n\
                   {\"title\": \"Neon\", \"blogContent\": \"Rain on chrome\", \"tweetContent\": \"#neon\",}\n";
        let reflection = harvest_reflection(raw).unwrap();
        assert_eq!(reflection.title, "Neon");
        assert_eq!(reflection.blog_content, "Rain on chrome");
        assert_eq!(reflection.tweet_content, "#neon");
    }

    #[test]
    fn falls_back_to_first_brace() {
        let raw = "out: { \"title\": \"Spaced\", \"tags\": [\"a\", \"b\",], }";
        assert_eq!(harvest_reflection(raw).unwrap().title, "Spaced");
    }

    #[test]
    fn rejects_missing_json_and_missing_title() {
        assert!(matches!(harvest_reflection("no json here"), Err(HarvestError::NoJson)));
        assert!(matches!(harvest_reflection("} then {"), Err(HarvestError::NoJson)));
        assert!(matches!(
            harvest_reflection("{\"blogContent\": \"x\"}"),
            Err(HarvestError::MissingTitle)
        ));
        assert!(matches!(harvest_reflection("{\"title\": }"), Err(HarvestError::Parse(_))));
    }

    #[tokio::test]
    async fn stage_peek_purge() {
        let buffer = ReflectionBuffer::new();
        assert!(buffer.peek().await.is_none());
        buffer.stage(sample("One")).await;
        assert_eq!(buffer.peek().await.unwrap().title, "One");
        assert!(buffer.purge().await);
        assert!(!buffer.purge().await);
    }

    #[tokio::test]
    async fn failed_dispatch_restages() {
        let buffer = ReflectionBuffer::new();
        let publisher = FlakyPublisher {
            fail: AtomicBool::new(true),
        };
        assert!(matches!(
            buffer.dispatch(&publisher).await,
            Err(DispatchError::NothingPending)
        ));

        buffer.stage(sample("Retry me")).await;
        assert!(matches!(
            buffer.dispatch(&publisher).await,
            Err(DispatchError::Publish(_))
        ));
        assert_eq!(buffer.peek().await.unwrap().title, "Retry me");

        publisher.fail.store(false, Ordering::SeqCst);
        let sent = buffer.dispatch(&publisher).await.unwrap();
        assert_eq!(sent.title, "Retry me");
        assert!(buffer.peek().await.is_none());
    }
}
