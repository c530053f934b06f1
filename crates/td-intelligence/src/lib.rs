//! AI chat for the public site: provider abstraction plus the travel
//! assistant that frames every conversation.

pub mod assistant;
pub mod llm;

pub use assistant::{AssistantError, ChatReply, ChatTurn, TravelAssistant};
pub use llm::{provider_from_config, LlmProvider};
