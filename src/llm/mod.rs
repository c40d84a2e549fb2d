mod anthropic;
mod streaming;

use std::sync::Arc;

use async_stream::stream;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde_json::Value;

use crate::error::ProviderError;

pub use anthropic::{AnthropicModel, AnthropicModelConfig};
pub use streaming::{CompletionAccumulator, ModelStreamChunk};

#[derive(Clone, Debug, PartialEq)]
pub enum ModelMessage {
    System(String),
    User(String),
    Assistant {
        content: Option<String>,
        tool_calls: Vec<ModelToolCall>,
    },
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        content: String,
        is_error: bool,
    },
}

impl ModelMessage {
    pub fn tool_calls(&self) -> &[ModelToolCall] {
        match self {
            ModelMessage::Assistant { tool_calls, .. } => tool_calls,
            _ => &[],
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ModelToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Clone, Debug)]
pub struct ModelToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModelToolChoice {
    Auto,
    Required,
    None,
    Tool(String),
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ModelCompletion {
    pub text: Option<String>,
    pub thinking: Option<String>,
    pub tool_calls: Vec<ModelToolCall>,
    pub usage: Option<ModelUsage>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ModelUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

pub type ModelStream<'a> = BoxStream<'a, Result<ModelStreamChunk, ProviderError>>;

#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn invoke(
        &self,
        messages: &[ModelMessage],
        tools: &[ModelToolDefinition],
        tool_choice: ModelToolChoice,
    ) -> Result<ModelCompletion, ProviderError>;

    /// Streams one completion as incremental chunks.
    ///
    /// Providers without native streaming fall back to a single
    /// [`ModelStreamChunk::Completed`] built from [`ChatModel::invoke`].
    fn invoke_stream<'a>(
        &'a self,
        messages: &'a [ModelMessage],
        tools: &'a [ModelToolDefinition],
        tool_choice: ModelToolChoice,
    ) -> ModelStream<'a> {
        Box::pin(stream! {
            yield self
                .invoke(messages, tools, tool_choice)
                .await
                .map(ModelStreamChunk::Completed);
        })
    }
}

#[async_trait]
impl<T> ChatModel for Arc<T>
where
    T: ChatModel + ?Sized,
{
    async fn invoke(
        &self,
        messages: &[ModelMessage],
        tools: &[ModelToolDefinition],
        tool_choice: ModelToolChoice,
    ) -> Result<ModelCompletion, ProviderError> {
        (**self).invoke(messages, tools, tool_choice).await
    }

    fn invoke_stream<'a>(
        &'a self,
        messages: &'a [ModelMessage],
        tools: &'a [ModelToolDefinition],
        tool_choice: ModelToolChoice,
    ) -> ModelStream<'a> {
        (**self).invoke_stream(messages, tools, tool_choice)
    }
}
