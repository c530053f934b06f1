use std::sync::Arc;

use serde::Serialize;
use td_harness::security::{InputSanitizer, SecurityError};
use thiserror::Error;
use tracing::{debug, warn};

pub use crate::llm::{ChatRole, ChatTurn};
use crate::llm::{LlmConfig, LlmError, LlmProvider};

/// Messages sent to the provider per request, the new one included.
pub const MAX_HISTORY_MESSAGES: usize = 20;
/// Characters kept from each message.
pub const MAX_MESSAGE_CHARS: usize = 2_000;

const SYSTEM_PROMPT: &str = "You are the online assistant of a travel agency. \
You help visitors choose beach, city and excursion tours, explain what is usually \
included (flights, transfers, hotel, meals, insurance), visa and document basics, \
and how the agency's cashback and referral programme works: clients earn a share \
of every completed trip, can turn their balance into promo codes and get a bonus \
when friends they referred travel. You never invent prices, availability or \
hotel ratings; for a concrete offer you ask the visitor to leave a contact request \
so a manager can call back. Answer briefly, in the visitor's language.";

#[derive(Debug, Error)]
pub enum AssistantError {
    #[error("message is empty")]
    EmptyMessage,

    #[error(transparent)]
    Rejected(#[from] SecurityError),

    #[error("assistant unavailable: {0}")]
    Provider(#[from] LlmError),
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatReply {
    pub reply: String,
    pub model: String,
}

/// Frames visitor conversations with the agency system prompt.
pub struct TravelAssistant {
    provider: Arc<dyn LlmProvider>,
    config: LlmConfig,
    sanitizer: InputSanitizer,
}

impl TravelAssistant {
    pub fn new(provider: Arc<dyn LlmProvider>, config: LlmConfig) -> Self {
        let config = LlmConfig {
            system_prompt: Some(SYSTEM_PROMPT.to_string()),
            ..config
        };
        Self {
            provider,
            config,
            sanitizer: InputSanitizer::for_chat(MAX_MESSAGE_CHARS),
        }
    }

    pub async fn reply(
        &self,
        history: &[ChatTurn],
        message: &str,
    ) -> Result<ChatReply, AssistantError> {
        if message.trim().is_empty() {
            return Err(AssistantError::EmptyMessage);
        }
        let message = self.sanitizer.sanitize(message)?;
        let messages = build_conversation(history, &message);
        debug!(
            provider = self.provider.name(),
            messages = messages.len(),
            "sending chat request"
        );

        let resp = self
            .provider
            .complete(&messages, &self.config)
            .await
            .inspect_err(|e| warn!(error = %e, "chat provider failed"))?;
        Ok(ChatReply {
            reply: resp.text.trim().to_string(),
            model: resp.model,
        })
    }
}

/// Last [`MAX_HISTORY_MESSAGES`] messages ending with `message`, each cut to
/// [`MAX_MESSAGE_CHARS`]. Empty turns are skipped and the result always
/// starts with a user message.
fn build_conversation(history: &[ChatTurn], message: &str) -> Vec<ChatTurn> {
    let keep = MAX_HISTORY_MESSAGES - 1;
    let earlier: Vec<&ChatTurn> = history
        .iter()
        .filter(|t| !t.content.trim().is_empty())
        .collect();
    let start = earlier.len().saturating_sub(keep);

    let mut turns: Vec<ChatTurn> = earlier[start..]
        .iter()
        .map(|t| ChatTurn {
            role: t.role,
            content: truncate_chars(t.content.trim(), MAX_MESSAGE_CHARS),
        })
        .skip_while(|t| t.role != ChatRole::User)
        .collect();
    turns.push(ChatTurn::user(truncate_chars(message, MAX_MESSAGE_CHARS)));
    turns
}

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(role: ChatRole, content: &str) -> ChatTurn {
        ChatTurn {
            role,
            content: content.into(),
        }
    }

    #[test]
    fn history_is_capped() {
        let history: Vec<ChatTurn> = (0..50)
            .map(|i| {
                let role = if i % 2 == 0 { ChatRole::User } else { ChatRole::Assistant };
                turn(role, &format!("m{i}"))
            })
            .collect();
        let msgs = build_conversation(&history, "now");
        assert!(msgs.len() <= MAX_HISTORY_MESSAGES);
        assert_eq!(msgs[0].role, ChatRole::User);
        assert_eq!(msgs.last().unwrap().content, "now");
        assert_eq!(msgs[msgs.len() - 2].content, "m49");
    }

    #[test]
    fn leading_assistant_turns_are_dropped() {
        let history = vec![turn(ChatRole::Assistant, "Hello! How can I help?")];
        let msgs = build_conversation(&history, "Tours to Egypt?");
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].role, ChatRole::User);
    }

    #[test]
    fn truncation_counts_chars() {
        assert_eq!(truncate_chars("привет", 3), "при");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }
}
