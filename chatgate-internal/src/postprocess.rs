//! Side-channel metadata carried in the provider's answer.
//!
//! The system prompt asks the model to end its answer with
//! `[PRIORITY_SCORE: N]`. The tag is stripped before the user sees the text.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, LazyLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::store::{DataStore, PriorityUpdate};

#[expect(clippy::expect_used)]
static PRIORITY_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[PRIORITY_SCORE:\s*(\d+)\]").expect("priority tag pattern is valid")
});

/// A tag with the spaces that would otherwise be left doubled around it
#[expect(clippy::expect_used)]
static PRIORITY_TAG_WITH_SPACING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[ \t]*\[PRIORITY_SCORE:\s*\d+\][ \t]*|[ \t]*\[PRIORITY_SCORE:\s*\d+\]")
        .expect("priority tag spacing pattern is valid")
});

const MAX_PRIORITY_SCORE: u8 = 100;
const SUMMARY_CHARS: usize = 200;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PriorityLevel {
    High,
    Medium,
    Low,
}

impl PriorityLevel {
    pub fn from_score(score: u8) -> Self {
        match score {
            80.. => PriorityLevel::High,
            50..=79 => PriorityLevel::Medium,
            _ => PriorityLevel::Low,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatTurnResult {
    pub visible_text: String,
    pub priority_score: Option<u8>,
    pub priority_level: Option<PriorityLevel>,
}

impl ChatTurnResult {
    /// First characters of the visible answer, used as the conversation summary
    pub fn summary(&self) -> String {
        self.visible_text.chars().take(SUMMARY_CHARS).collect()
    }
}

/// Pulls the priority tag out of a raw provider answer.
///
/// The first tag supplies the score, clamped to 0..=100. Every tag is removed
/// from the visible text along with trailing whitespace; leading text keeps
/// its own spacing. Without a tag the text is returned untouched.
pub fn extract_priority(raw_answer: &str) -> ChatTurnResult {
    let Some(captures) = PRIORITY_TAG.captures(raw_answer) else {
        return ChatTurnResult {
            visible_text: raw_answer.to_string(),
            priority_score: None,
            priority_level: None,
        };
    };

    // Digit runs too long for u64 are still "more than 100"
    let score = captures
        .get(1)
        .map(|digits| {
            digits
                .as_str()
                .parse::<u64>()
                .map(|n| n.min(u64::from(MAX_PRIORITY_SCORE)))
                .unwrap_or(u64::from(MAX_PRIORITY_SCORE))
        })
        .and_then(|n| u8::try_from(n).ok());

    let visible_text = PRIORITY_TAG_WITH_SPACING
        .replace_all(raw_answer, "")
        .trim_end()
        .to_string();
    ChatTurnResult {
        visible_text,
        priority_score: score,
        priority_level: score.map(PriorityLevel::from_score),
    }
}

/// Persists the score on the conversation without blocking the turn.
///
/// Returns `None` when there is nothing to persist. Failures are logged and dropped.
pub fn schedule_priority_update(
    store: Arc<dyn DataStore>,
    conversation_id: Option<&str>,
    result: &ChatTurnResult,
) -> Option<JoinHandle<()>> {
    let conversation_id = conversation_id?.to_string();
    let (score, level) = result.priority_score.zip(result.priority_level)?;
    let update = PriorityUpdate {
        priority_score: score,
        priority_level: level,
        summary: result.summary(),
    };
    Some(tokio::spawn(async move {
        match store
            .update_conversation_priority(&conversation_id, &update)
            .await
        {
            Ok(()) => debug!(
                conversation_id = %conversation_id,
                score = update.priority_score,
                level = %update.priority_level,
                "Updated conversation priority"
            ),
            Err(e) => warn!(
                conversation_id = %conversation_id,
                "Failed to update conversation priority: {e}"
            ),
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryDataStore;
    use std::str::FromStr;

    #[test]
    fn test_high_priority_tag_is_stripped() {
        let result = extract_priority("...helpful text [PRIORITY_SCORE: 85]");
        assert_eq!(result.visible_text, "...helpful text");
        assert_eq!(result.priority_score, Some(85));
        assert_eq!(result.priority_level, Some(PriorityLevel::High));
    }

    #[test]
    fn test_level_boundaries() {
        assert_eq!(
            extract_priority("a [PRIORITY_SCORE: 55]").priority_level,
            Some(PriorityLevel::Medium)
        );
        assert_eq!(
            extract_priority("a [PRIORITY_SCORE: 10]").priority_level,
            Some(PriorityLevel::Low)
        );
        assert_eq!(PriorityLevel::from_score(80), PriorityLevel::High);
        assert_eq!(PriorityLevel::from_score(79), PriorityLevel::Medium);
        assert_eq!(PriorityLevel::from_score(50), PriorityLevel::Medium);
        assert_eq!(PriorityLevel::from_score(49), PriorityLevel::Low);
    }

    #[test]
    fn test_no_tag_leaves_text_unchanged() {
        let raw = "  Thanks for reaching out!  ";
        let result = extract_priority(raw);
        assert_eq!(result.visible_text, raw);
        assert_eq!(result.priority_score, None);
        assert_eq!(result.priority_level, None);
    }

    #[test]
    fn test_out_of_range_score_is_clamped() {
        let result = extract_priority("ok [PRIORITY_SCORE: 250]");
        assert_eq!(result.priority_score, Some(100));

        let result = extract_priority("ok [PRIORITY_SCORE: 99999999999999999999999]");
        assert_eq!(result.priority_score, Some(100));
        assert_eq!(result.visible_text, "ok");
    }

    #[test]
    fn test_malformed_tag_is_not_a_score() {
        let result = extract_priority("ok [PRIORITY_SCORE: high]");
        assert_eq!(result.priority_score, None);
        assert_eq!(result.visible_text, "ok [PRIORITY_SCORE: high]");
    }

    #[test]
    fn test_first_tag_wins_and_all_are_removed() {
        let result = extract_priority("[PRIORITY_SCORE:20] Hello there [PRIORITY_SCORE: 90]");
        assert_eq!(result.priority_score, Some(20));
        assert_eq!(result.visible_text, "Hello there");
    }

    #[test]
    fn test_mid_text_tag_leaves_single_space() {
        let result = extract_priority("Hello [PRIORITY_SCORE: 5] world");
        assert_eq!(result.visible_text, "Hello world");
        assert_eq!(result.priority_score, Some(5));
    }

    #[test]
    fn test_only_trailing_whitespace_is_trimmed() {
        let result = extract_priority("  Indented answer\n\n[PRIORITY_SCORE: 60]  \n");
        assert_eq!(result.visible_text, "  Indented answer");
    }

    #[test]
    fn test_level_string_forms() {
        assert_eq!(PriorityLevel::High.to_string(), "high");
        assert_eq!(PriorityLevel::from_str("medium").unwrap(), PriorityLevel::Medium);
        assert_eq!(
            serde_json::to_value(PriorityLevel::Low).unwrap(),
            serde_json::json!("low")
        );
    }

    #[tokio::test]
    async fn test_priority_update_is_persisted() {
        let store = Arc::new(InMemoryDataStore::new());
        let result = extract_priority("We'd love to help. [PRIORITY_SCORE: 90]");
        let handle = schedule_priority_update(store.clone(), Some("conv-1"), &result).unwrap();
        handle.await.unwrap();

        let updates = store.priority_updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].0, "conv-1");
        assert_eq!(updates[0].1.priority_level, PriorityLevel::High);
        assert_eq!(updates[0].1.summary, "We'd love to help.");
    }

    #[tokio::test]
    async fn test_no_update_without_conversation_or_score() {
        let store = Arc::new(InMemoryDataStore::new());
        let scored = extract_priority("x [PRIORITY_SCORE: 90]");
        assert!(schedule_priority_update(store.clone(), None, &scored).is_none());

        let unscored = extract_priority("x");
        assert!(schedule_priority_update(store, Some("conv-1"), &unscored).is_none());
    }

    #[tokio::test]
    async fn test_update_failure_is_swallowed() {
        let store = Arc::new(InMemoryDataStore::new());
        store.set_unavailable(true);
        let result = extract_priority("x [PRIORITY_SCORE: 90]");
        let handle = schedule_priority_update(store.clone(), Some("conv-1"), &result).unwrap();
        // The task completes normally even though the write failed
        handle.await.unwrap();
        assert!(store.priority_updates().is_empty());
    }

    #[test]
    fn test_summary_is_bounded() {
        let long = "a".repeat(500);
        let result = extract_priority(&format!("{long} [PRIORITY_SCORE: 60]"));
        assert_eq!(result.summary().chars().count(), 200);
    }
}
