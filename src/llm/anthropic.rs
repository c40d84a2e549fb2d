use anthropic_ai_sdk::client::AnthropicClient;
use anthropic_ai_sdk::types::message::{
    ContentBlock, ContentBlockDelta, CreateMessageParams, CreateMessageResponse, Message,
    MessageClient, MessageError, RequiredMessageParams, Role, StreamEvent, Thinking, ThinkingType,
    Tool, ToolChoice,
};
use async_stream::stream;
use async_trait::async_trait;
use futures_util::StreamExt;
use tracing::{debug, warn};

use crate::error::ProviderError;
use crate::llm::{
    ChatModel, ModelCompletion, ModelMessage, ModelStream, ModelStreamChunk, ModelToolCall,
    ModelToolChoice, ModelToolDefinition, ModelUsage,
};

/// Runtime configuration for [`AnthropicModel`].
#[derive(Debug, Clone)]
pub struct AnthropicModelConfig {
    pub api_key: String,
    /// Model id, for example `claude-3-7-sonnet-latest`.
    pub model: String,
    pub api_version: String,
    /// Base URL override for proxies or compatible gateways.
    pub api_base_url: Option<String>,
    pub max_tokens: u32,
    /// Ignored while extended thinking is enabled.
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    /// Enables extended thinking with this token budget.
    pub thinking_budget_tokens: Option<usize>,
}

impl AnthropicModelConfig {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            api_version: AnthropicClient::DEFAULT_API_VERSION.to_string(),
            api_base_url: None,
            max_tokens: 4096,
            temperature: None,
            top_p: None,
            thinking_budget_tokens: None,
        }
    }

    /// Reads `ANTHROPIC_API_KEY` and the optional `ANTHROPIC_BASE_URL`.
    pub fn from_env(model: impl Into<String>) -> Result<Self, ProviderError> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| ProviderError::Request("ANTHROPIC_API_KEY is not set".to_string()))?;
        let mut config = Self::new(api_key, model);
        config.api_base_url = std::env::var("ANTHROPIC_BASE_URL")
            .ok()
            .filter(|url| !url.trim().is_empty());
        Ok(config)
    }

    pub fn with_thinking_budget(mut self, budget_tokens: usize) -> Self {
        self.thinking_budget_tokens = Some(budget_tokens);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// Anthropic Messages API adapter implementing [`ChatModel`].
#[derive(Debug, Clone)]
pub struct AnthropicModel {
    client: AnthropicClient,
    config: AnthropicModelConfig,
}

impl AnthropicModel {
    pub fn new(config: AnthropicModelConfig) -> Result<Self, ProviderError> {
        let mut builder =
            AnthropicClient::builder(config.api_key.clone(), config.api_version.clone());
        if let Some(url) = &config.api_base_url {
            builder = builder.with_api_base_url(url.clone());
        }

        let client = builder
            .build::<MessageError>()
            .map_err(|err| ProviderError::Request(err.to_string()))?;

        Ok(Self { client, config })
    }

    pub fn from_env(model: impl Into<String>) -> Result<Self, ProviderError> {
        Self::new(AnthropicModelConfig::from_env(model)?)
    }

    pub fn config(&self) -> &AnthropicModelConfig {
        &self.config
    }
}

#[async_trait]
impl ChatModel for AnthropicModel {
    async fn invoke(
        &self,
        messages: &[ModelMessage],
        tools: &[ModelToolDefinition],
        tool_choice: ModelToolChoice,
    ) -> Result<ModelCompletion, ProviderError> {
        let request = build_request(&self.config, messages, tools, tool_choice, false);

        let response = self
            .client
            .create_message(Some(&request))
            .await
            .map_err(|err| ProviderError::Request(err.to_string()))?;

        Ok(normalize_response(&response))
    }

    fn invoke_stream<'a>(
        &'a self,
        messages: &'a [ModelMessage],
        tools: &'a [ModelToolDefinition],
        tool_choice: ModelToolChoice,
    ) -> ModelStream<'a> {
        let request = build_request(&self.config, messages, tools, tool_choice, true);

        Box::pin(stream! {
            let events = match self.client.create_message_streaming(&request).await {
                Ok(events) => events,
                Err(err) => {
                    yield Err(ProviderError::Request(err.to_string()));
                    return;
                }
            };
            futures_util::pin_mut!(events);

            while let Some(event) = events.next().await {
                let event = match event {
                    Ok(event) => event,
                    Err(err) => {
                        yield Err(ProviderError::Request(err.to_string()));
                        return;
                    }
                };

                match normalize_stream_event(&event) {
                    Some(StreamItem::Chunk(chunk)) => yield Ok(chunk),
                    Some(StreamItem::Stop) => break,
                    Some(StreamItem::Error(message)) => {
                        warn!(%message, "anthropic stream reported an error");
                        yield Err(ProviderError::Response(message));
                        return;
                    }
                    None => {}
                }
            }
        })
    }
}

fn build_request(
    config: &AnthropicModelConfig,
    messages: &[ModelMessage],
    tools: &[ModelToolDefinition],
    tool_choice: ModelToolChoice,
    stream: bool,
) -> CreateMessageParams {
    let (history, system) = to_anthropic_messages(messages);

    let required = RequiredMessageParams {
        model: config.model.clone(),
        messages: history,
        max_tokens: config.max_tokens,
    };

    let mut request = CreateMessageParams::new(required).with_stream(stream);

    if let Some(system_prompt) = system {
        request = request.with_system(system_prompt);
    }

    match (config.thinking_budget_tokens, config.temperature) {
        (Some(budget_tokens), temperature) => {
            if temperature.is_some() {
                debug!("temperature is ignored while extended thinking is enabled");
            }
            request = request.with_thinking(Thinking {
                budget_tokens,
                type_: ThinkingType::Enabled,
            });
        }
        (None, Some(temperature)) => request = request.with_temperature(temperature),
        (None, None) => {}
    }

    if let Some(top_p) = config.top_p {
        request = request.with_top_p(top_p);
    }

    if !tools.is_empty() {
        let anthropic_tools = tools
            .iter()
            .map(|tool| Tool {
                name: tool.name.clone(),
                description: Some(tool.description.clone()),
                input_schema: tool.parameters.clone(),
            })
            .collect::<Vec<_>>();

        request = request.with_tools(anthropic_tools);
        request = request.with_tool_choice(match tool_choice {
            ModelToolChoice::Auto => ToolChoice::Auto,
            ModelToolChoice::Required => ToolChoice::Any,
            ModelToolChoice::None => ToolChoice::None,
            ModelToolChoice::Tool(name) => ToolChoice::Tool { name },
        });
    }

    request
}

fn to_anthropic_messages(messages: &[ModelMessage]) -> (Vec<Message>, Option<String>) {
    let mut system_lines = Vec::new();
    let mut anthropic_messages = Vec::new();

    for message in messages {
        match message {
            ModelMessage::System(content) => system_lines.push(content.clone()),
            ModelMessage::User(content) => {
                anthropic_messages.push(Message::new_text(Role::User, content.clone()));
            }
            ModelMessage::Assistant {
                content,
                tool_calls,
            } => {
                let mut blocks = Vec::new();
                if let Some(content) = content
                    && !content.is_empty()
                {
                    blocks.push(ContentBlock::Text {
                        text: content.clone(),
                    });
                }
                blocks.extend(tool_calls.iter().map(|call| ContentBlock::ToolUse {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    input: call.arguments.clone(),
                }));
                if !blocks.is_empty() {
                    anthropic_messages.push(Message::new_blocks(Role::Assistant, blocks));
                }
            }
            ModelMessage::ToolResult {
                tool_call_id,
                content,
                is_error,
                ..
            } => {
                let rendered = if *is_error {
                    format!("Error: {content}")
                } else {
                    content.clone()
                };
                anthropic_messages.push(Message::new_blocks(
                    Role::User,
                    vec![ContentBlock::ToolResult {
                        tool_use_id: tool_call_id.clone(),
                        content: rendered,
                    }],
                ));
            }
        }
    }

    let system = if system_lines.is_empty() {
        None
    } else {
        Some(system_lines.join("\n\n"))
    };

    (anthropic_messages, system)
}

fn normalize_response(response: &CreateMessageResponse) -> ModelCompletion {
    let mut text_parts = Vec::new();
    let mut thinking_parts = Vec::new();
    let mut tool_calls = Vec::new();

    for block in &response.content {
        match block {
            ContentBlock::Text { text } => text_parts.push(text.clone()),
            ContentBlock::ToolUse { id, name, input } => tool_calls.push(ModelToolCall {
                id: id.clone(),
                name: name.clone(),
                arguments: input.clone(),
            }),
            ContentBlock::Thinking { thinking, .. } => thinking_parts.push(thinking.clone()),
            ContentBlock::RedactedThinking { data } => {
                thinking_parts.push(format!("[redacted:{} bytes]", data.len()))
            }
            _ => {}
        }
    }

    ModelCompletion {
        text: (!text_parts.is_empty()).then(|| text_parts.join("\n")),
        thinking: (!thinking_parts.is_empty()).then(|| thinking_parts.join("\n")),
        tool_calls,
        usage: Some(ModelUsage {
            input_tokens: response.usage.input_tokens,
            output_tokens: response.usage.output_tokens,
        }),
    }
}

#[derive(Debug, PartialEq)]
enum StreamItem {
    Chunk(ModelStreamChunk),
    Stop,
    Error(String),
}

fn normalize_stream_event(event: &StreamEvent) -> Option<StreamItem> {
    match event {
        StreamEvent::ContentBlockStart {
            index,
            content_block,
        } => match content_block {
            ContentBlock::ToolUse { id, name, input } => {
                Some(StreamItem::Chunk(ModelStreamChunk::ToolCallStart {
                    index: *index,
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                }))
            }
            ContentBlock::Text { text } if !text.is_empty() => {
                Some(StreamItem::Chunk(ModelStreamChunk::TextDelta {
                    index: *index,
                    text: text.clone(),
                }))
            }
            _ => None,
        },
        StreamEvent::ContentBlockDelta { index, delta } => match delta {
            ContentBlockDelta::TextDelta { text } => {
                Some(StreamItem::Chunk(ModelStreamChunk::TextDelta {
                    index: *index,
                    text: text.clone(),
                }))
            }
            ContentBlockDelta::ThinkingDelta { thinking } => {
                Some(StreamItem::Chunk(ModelStreamChunk::ThinkingDelta {
                    index: *index,
                    content: thinking.clone(),
                }))
            }
            ContentBlockDelta::InputJsonDelta { partial_json } => {
                Some(StreamItem::Chunk(ModelStreamChunk::ToolInputDelta {
                    index: *index,
                    partial_json: partial_json.clone(),
                }))
            }
            ContentBlockDelta::SignatureDelta { .. } => None,
        },
        StreamEvent::MessageStart { message } => {
            Some(StreamItem::Chunk(ModelStreamChunk::Usage(ModelUsage {
                input_tokens: message.usage.input_tokens,
                output_tokens: message.usage.output_tokens,
            })))
        }
        StreamEvent::MessageDelta {
            usage: Some(usage),
            ..
        } => Some(StreamItem::Chunk(ModelStreamChunk::Usage(ModelUsage {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
        }))),
        StreamEvent::MessageStop => Some(StreamItem::Stop),
        StreamEvent::Error { error } => Some(StreamItem::Error(error.message.clone())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use anthropic_ai_sdk::types::message::{
        MessageContent, MessageDeltaContent, MessageStartContent, StopReason, StreamUsage, Usage,
    };
    use serde_json::json;

    use super::*;
    use crate::llm::CompletionAccumulator;

    fn response(content: Vec<ContentBlock>, stop_reason: StopReason) -> CreateMessageResponse {
        CreateMessageResponse {
            content,
            id: "msg_1".to_string(),
            model: "claude-test".to_string(),
            role: Role::Assistant,
            stop_reason: Some(stop_reason),
            stop_sequence: None,
            type_: "message".to_string(),
            usage: Usage {
                input_tokens: 12,
                output_tokens: 5,
            },
        }
    }

    #[test]
    fn normalize_response_keeps_search_call_and_usage() {
        let completion = normalize_response(&response(
            vec![
                ContentBlock::Text {
                    text: "Searching first".to_string(),
                },
                ContentBlock::ToolUse {
                    id: "toolu_1".to_string(),
                    name: "web_search".to_string(),
                    input: json!({"query": "langgraph basics"}),
                },
            ],
            StopReason::ToolUse,
        ));

        assert_eq!(completion.text.as_deref(), Some("Searching first"));
        assert_eq!(completion.tool_calls.len(), 1);
        assert_eq!(completion.tool_calls[0].name, "web_search");
        assert_eq!(
            completion.usage,
            Some(ModelUsage {
                input_tokens: 12,
                output_tokens: 5,
            })
        );
    }

    #[test]
    fn normalize_response_separates_thinking_from_answer() {
        let completion = normalize_response(&response(
            vec![
                ContentBlock::Thinking {
                    thinking: "a greeting needs no tools".to_string(),
                    signature: "sig".to_string(),
                },
                ContentBlock::Text {
                    text: "Hello!".to_string(),
                },
            ],
            StopReason::EndTurn,
        ));

        assert_eq!(
            completion.thinking.as_deref(),
            Some("a greeting needs no tools")
        );
        assert_eq!(completion.text.as_deref(), Some("Hello!"));
        assert!(completion.tool_calls.is_empty());
    }

    #[test]
    fn tool_results_become_user_blocks_and_system_is_hoisted() {
        let history = vec![
            ModelMessage::System("be brief".to_string()),
            ModelMessage::User("what is new".to_string()),
            ModelMessage::Assistant {
                content: None,
                tool_calls: vec![ModelToolCall {
                    id: "toolu_1".to_string(),
                    name: "web_search".to_string(),
                    arguments: json!({"query": "news"}),
                }],
            },
            ModelMessage::ToolResult {
                tool_call_id: "toolu_1".to_string(),
                tool_name: "web_search".to_string(),
                content: "timeout".to_string(),
                is_error: true,
            },
        ];

        let (messages, system) = to_anthropic_messages(&history);
        assert_eq!(system.as_deref(), Some("be brief"));
        assert_eq!(messages.len(), 3);

        let MessageContent::Blocks { content } = &messages[2].content else {
            panic!("expected blocks")
        };
        assert_eq!(
            content[0],
            ContentBlock::ToolResult {
                tool_use_id: "toolu_1".to_string(),
                content: "Error: timeout".to_string(),
            }
        );
    }

    #[test]
    fn empty_assistant_turn_is_skipped() {
        let history = vec![
            ModelMessage::User("hi".to_string()),
            ModelMessage::Assistant {
                content: Some(String::new()),
                tool_calls: vec![],
            },
        ];

        let (messages, system) = to_anthropic_messages(&history);
        assert!(system.is_none());
        assert_eq!(messages.len(), 1);
    }

    #[test]
    fn stream_deltas_map_to_chunks() {
        let text = StreamEvent::ContentBlockDelta {
            index: 0,
            delta: ContentBlockDelta::TextDelta {
                text: "いろは".to_string(),
            },
        };
        assert_eq!(
            normalize_stream_event(&text),
            Some(StreamItem::Chunk(ModelStreamChunk::TextDelta {
                index: 0,
                text: "いろは".to_string(),
            }))
        );

        let input = StreamEvent::ContentBlockDelta {
            index: 1,
            delta: ContentBlockDelta::InputJsonDelta {
                partial_json: "{\"query\"".to_string(),
            },
        };
        assert_eq!(
            normalize_stream_event(&input),
            Some(StreamItem::Chunk(ModelStreamChunk::ToolInputDelta {
                index: 1,
                partial_json: "{\"query\"".to_string(),
            }))
        );

        assert_eq!(
            normalize_stream_event(&StreamEvent::MessageStop),
            Some(StreamItem::Stop)
        );
        assert_eq!(normalize_stream_event(&StreamEvent::Ping), None);
    }

    #[test]
    fn stream_message_start_and_delta_report_usage() {
        let start = StreamEvent::MessageStart {
            message: MessageStartContent {
                id: "msg_1".to_string(),
                type_: "message".to_string(),
                role: Role::Assistant,
                content: vec![],
                model: "claude-test".to_string(),
                stop_reason: None,
                stop_sequence: None,
                usage: Usage {
                    input_tokens: 12,
                    output_tokens: 1,
                },
            },
        };
        assert_eq!(
            normalize_stream_event(&start),
            Some(StreamItem::Chunk(ModelStreamChunk::Usage(ModelUsage {
                input_tokens: 12,
                output_tokens: 1,
            })))
        );

        let delta = StreamEvent::MessageDelta {
            delta: MessageDeltaContent {
                stop_reason: Some(StopReason::EndTurn),
                stop_sequence: None,
            },
            usage: Some(StreamUsage {
                input_tokens: 0,
                output_tokens: 48,
            }),
        };
        assert_eq!(
            normalize_stream_event(&delta),
            Some(StreamItem::Chunk(ModelStreamChunk::Usage(ModelUsage {
                input_tokens: 0,
                output_tokens: 48,
            })))
        );

        let without_usage = StreamEvent::MessageDelta {
            delta: MessageDeltaContent {
                stop_reason: None,
                stop_sequence: None,
            },
            usage: None,
        };
        assert_eq!(normalize_stream_event(&without_usage), None);

        let mut accumulator = CompletionAccumulator::new();
        for event in [start, delta] {
            if let Some(StreamItem::Chunk(chunk)) = normalize_stream_event(&event) {
                accumulator.push(chunk);
            }
        }
        let completion = accumulator.finish().expect("completion assembles");
        assert_eq!(
            completion.usage,
            Some(ModelUsage {
                input_tokens: 12,
                output_tokens: 48,
            })
        );
    }

    #[test]
    fn stream_tool_use_start_carries_id_and_name() {
        let event = StreamEvent::ContentBlockStart {
            index: 2,
            content_block: ContentBlock::ToolUse {
                id: "toolu_9".to_string(),
                name: "publish_notification".to_string(),
                input: json!({}),
            },
        };

        assert_eq!(
            normalize_stream_event(&event),
            Some(StreamItem::Chunk(ModelStreamChunk::ToolCallStart {
                index: 2,
                id: "toolu_9".to_string(),
                name: "publish_notification".to_string(),
                input: json!({}),
            }))
        );
    }

    #[test]
    fn thinking_budget_drops_temperature() {
        let mut config =
            AnthropicModelConfig::new("key", "claude-test").with_thinking_budget(1024);
        config.temperature = Some(0.3);

        let request = build_request(
            &config,
            &[ModelMessage::User("こんにちは".to_string())],
            &[],
            ModelToolChoice::None,
            false,
        );
        let value = serde_json::to_value(&request).expect("request serializes");

        assert_eq!(value["thinking"]["budget_tokens"], 1024);
        assert!(value["temperature"].is_null());
        assert!(value["tools"].is_null());
    }
}
