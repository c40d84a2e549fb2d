//! Tool-calling agent with an explicit turn dispatcher.
//!
//! - [`decide`] maps the last model message and the [`RunState`] to the next [`Action`]
//! - `Agent` drives the model, runs tools and delivers a captured tool result at most once
//! - `query` and `query_stream` entry points
//! - Tool registry + JSON schema validation + dependency injection
//! - Anthropic adapter via `AnthropicModel`, with streaming and extended thinking
//! - Delivery sinks via `Notifier` (`WebhookNotifier`, `LogNotifier`)

pub mod agent;
pub mod dispatch;
pub mod error;
pub mod llm;
#[cfg(feature = "cli")]
pub mod logging;
pub mod notify;
pub mod tools;

pub use agent::{Agent, AgentBuilder, AgentConfig, AgentEvent, query, query_stream};
pub use dispatch::{Action, Phase, RunState, decide};
pub use error::{AgentError, NotifyError, ProviderError, SchemaError, ToolError};
pub use llm::{
    AnthropicModel, AnthropicModelConfig, ChatModel, CompletionAccumulator, ModelCompletion,
    ModelMessage, ModelStream, ModelStreamChunk, ModelToolCall, ModelToolChoice,
    ModelToolDefinition, ModelUsage,
};
pub use notify::{LogNotifier, Notifier, WebhookNotifier, WebhookNotifierConfig};
pub use tools::{
    DependencyMap, SearchHit, TavilyConfig, ToolOutcome, ToolSpec, WebSearchClient,
    PUBLISH_NOTIFICATION_TOOL, publish_notification_tool, web_search_tool,
};
