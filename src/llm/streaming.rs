use serde_json::{Value, json};

use crate::error::ProviderError;
use crate::llm::{ModelCompletion, ModelToolCall, ModelUsage};

/// Incremental piece of a streamed completion.
///
/// `index` is the provider's content block index; deltas sharing an index
/// belong to the same block.
#[derive(Clone, Debug, PartialEq)]
pub enum ModelStreamChunk {
    TextDelta {
        index: usize,
        text: String,
    },
    ThinkingDelta {
        index: usize,
        content: String,
    },
    ToolCallStart {
        index: usize,
        id: String,
        name: String,
        input: Value,
    },
    ToolInputDelta {
        index: usize,
        partial_json: String,
    },
    Usage(ModelUsage),
    /// A whole completion, sent by providers that do not stream.
    Completed(ModelCompletion),
}

#[derive(Debug)]
struct PendingToolCall {
    index: usize,
    id: String,
    name: String,
    input: Value,
    partial_json: String,
}

/// Folds stream chunks back into a [`ModelCompletion`].
#[derive(Debug, Default)]
pub struct CompletionAccumulator {
    text: Vec<(usize, String)>,
    thinking: Vec<(usize, String)>,
    tool_calls: Vec<PendingToolCall>,
    usage: Option<ModelUsage>,
    completed: Option<ModelCompletion>,
}

impl CompletionAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: ModelStreamChunk) {
        match chunk {
            ModelStreamChunk::TextDelta { index, text } => append_block(&mut self.text, index, &text),
            ModelStreamChunk::ThinkingDelta { index, content } => {
                append_block(&mut self.thinking, index, &content)
            }
            ModelStreamChunk::ToolCallStart {
                index,
                id,
                name,
                input,
            } => self.tool_calls.push(PendingToolCall {
                index,
                id,
                name,
                input,
                partial_json: String::new(),
            }),
            ModelStreamChunk::ToolInputDelta {
                index,
                partial_json,
            } => {
                if let Some(call) = self.tool_calls.iter_mut().rev().find(|c| c.index == index) {
                    call.partial_json.push_str(&partial_json);
                }
            }
            ModelStreamChunk::Usage(usage) => {
                let total = self.usage.get_or_insert_with(ModelUsage::default);
                total.input_tokens = total.input_tokens.max(usage.input_tokens);
                total.output_tokens = total.output_tokens.max(usage.output_tokens);
            }
            ModelStreamChunk::Completed(completion) => self.completed = Some(completion),
        }
    }

    pub fn finish(self) -> Result<ModelCompletion, ProviderError> {
        if let Some(completion) = self.completed {
            return Ok(completion);
        }

        let mut tool_calls = Vec::with_capacity(self.tool_calls.len());
        for call in self.tool_calls {
            let arguments = if call.partial_json.trim().is_empty() {
                if call.input.is_null() {
                    json!({})
                } else {
                    call.input
                }
            } else {
                serde_json::from_str(&call.partial_json).map_err(|err| {
                    ProviderError::Response(format!(
                        "tool input for '{}' is not valid JSON: {err}",
                        call.name
                    ))
                })?
            };

            tool_calls.push(ModelToolCall {
                id: call.id,
                name: call.name,
                arguments,
            });
        }

        Ok(ModelCompletion {
            text: join_blocks(self.text),
            thinking: join_blocks(self.thinking),
            tool_calls,
            usage: self.usage,
        })
    }
}

fn append_block(blocks: &mut Vec<(usize, String)>, index: usize, delta: &str) {
    match blocks.last_mut() {
        Some((last, content)) if *last == index => content.push_str(delta),
        _ => blocks.push((index, delta.to_string())),
    }
}

fn join_blocks(blocks: Vec<(usize, String)>) -> Option<String> {
    if blocks.is_empty() {
        None
    } else {
        Some(
            blocks
                .into_iter()
                .map(|(_, content)| content)
                .collect::<Vec<_>>()
                .join("\n"),
        )
    }
}
