use std::sync::Arc;

use serde_json::json;
use tracing::{debug, warn};

use crate::agent::CompletionBackend;
use crate::models::{Message, FALLBACK_TITLE};

/// Messages considered when suggesting titles.
const SUGGESTION_WINDOW: usize = 6;
const MAX_SUGGESTIONS: usize = 4;
/// Per-message character cap in the suggestion prompt.
const SUGGESTION_EXCERPT_CHARS: usize = 500;

/// Best-effort session titling. Never fails: errors turn into the fallback
/// title or an empty suggestion list.
#[derive(Clone)]
pub struct TitleGenerator {
    backend: Arc<dyn CompletionBackend>,
}

impl TitleGenerator {
    pub fn new(backend: Arc<dyn CompletionBackend>) -> Self {
        Self { backend }
    }

    pub async fn generate_title(&self, seed: &str) -> String {
        let prompt = format!(
            "Generate a very short, concise title (max 4-5 words) for a health/ayurveda \
             related conversation that starts with this message: \"{}\". Do not use quotes.",
            seed.trim()
        );
        match self.backend.complete(&prompt).await {
            Ok(raw) => clean_title(&raw).unwrap_or_else(|| FALLBACK_TITLE.to_string()),
            Err(e) => {
                debug!("Title generation failed, using fallback: {e}");
                FALLBACK_TITLE.to_string()
            }
        }
    }

    /// Up to four alternative titles for the latest part of a conversation.
    pub async fn generate_title_suggestions(&self, recent: &[Message]) -> Vec<String> {
        let start = recent.len().saturating_sub(SUGGESTION_WINDOW);
        let transcript: Vec<String> = recent[start..]
            .iter()
            .filter(|m| !m.content.trim().is_empty())
            .map(|m| {
                let excerpt: String = m.content.chars().take(SUGGESTION_EXCERPT_CHARS).collect();
                format!("{}: {}", m.role, excerpt)
            })
            .collect();
        if transcript.is_empty() {
            return Vec::new();
        }

        let prompt = format!(
            "Suggest {MAX_SUGGESTIONS} short, distinct titles (max 5 words each) for this \
             health/ayurveda conversation. Return only a JSON array of strings.\n\n{}",
            transcript.join("\n")
        );
        let schema = json!({
            "type": "array",
            "items": { "type": "string" },
            "maxItems": MAX_SUGGESTIONS,
        });

        match self.backend.complete_list(&prompt, schema).await {
            Ok(raw) => raw
                .iter()
                .filter_map(|s| clean_title(s))
                .take(MAX_SUGGESTIONS)
                .collect(),
            Err(e) => {
                warn!("Title suggestions unavailable: {e}");
                Vec::new()
            }
        }
    }
}

/// First line of a model reply with surrounding quotes and markdown removed.
fn clean_title(raw: &str) -> Option<String> {
    let line = raw.lines().map(str::trim).find(|l| !l.is_empty())?;
    let title = line
        .trim_start_matches('#')
        .trim_matches(|c: char| matches!(c, '"' | '\'' | '*' | '`' | '“' | '”'))
        .trim();
    (!title.is_empty()).then(|| title.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::ScriptedBackend;
    use crate::models::MessageRole;

    fn generator(backend: ScriptedBackend) -> (TitleGenerator, Arc<ScriptedBackend>) {
        let backend = Arc::new(backend);
        (TitleGenerator::new(backend.clone()), backend)
    }

    #[tokio::test]
    async fn title_is_cleaned_of_quotes() {
        let (titles, backend) = generator(ScriptedBackend::default().with_title("\"Immunity Boosting Herbs\"\n"));
        assert_eq!(titles.generate_title("best herbs for immunity?").await, "Immunity Boosting Herbs");
        assert!(backend.title_prompts()[0].contains("best herbs for immunity?"));
    }

    #[tokio::test]
    async fn failures_fall_back() {
        let (titles, _) = generator(ScriptedBackend::default());
        assert_eq!(titles.generate_title("hello").await, FALLBACK_TITLE);

        let (titles, _) = generator(ScriptedBackend::default().with_title("  \n \"\" "));
        assert_eq!(titles.generate_title("hello").await, FALLBACK_TITLE);
    }

    #[tokio::test]
    async fn suggestions_are_capped_and_cleaned() {
        let (titles, _) = generator(
            ScriptedBackend::default().with_suggestions(&["Kapha Diet", "\"Light Meals\"", "", "Ginger Tea", "Morning Routine", "Extra"]),
        );
        let suggestions = titles.generate_title_suggestions(&[Message::user("Kapha diet?")]).await;
        assert_eq!(suggestions, ["Kapha Diet", "Light Meals", "Ginger Tea", "Morning Routine"]);
    }

    #[tokio::test]
    async fn suggestions_only_send_recent_turns() {
        let (titles, backend) = generator(ScriptedBackend::default().with_suggestions(&["A"]));
        let messages: Vec<Message> = (0..10)
            .map(|i| {
                let role = if i % 2 == 0 { MessageRole::User } else { MessageRole::Assistant };
                Message::new(role, format!("turn-{i}"))
            })
            .collect();

        titles.generate_title_suggestions(&messages).await;
        let prompt = backend.list_prompts.lock().unwrap()[0].clone();
        assert!(!prompt.contains("turn-3"));
        assert!(prompt.contains("turn-4"));
        assert!(prompt.contains("turn-9"));
    }

    #[tokio::test]
    async fn suggestion_failure_is_empty() {
        let (titles, _) = generator(ScriptedBackend::default());
        assert!(titles.generate_title_suggestions(&[Message::user("hi")]).await.is_empty());
        assert!(titles.generate_title_suggestions(&[]).await.is_empty());
    }
}
