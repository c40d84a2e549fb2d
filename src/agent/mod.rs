use std::collections::HashMap;
use std::sync::Arc;

use async_stream::try_stream;
use futures_util::{Stream, StreamExt};
use tracing::{debug, info, warn};

use crate::dispatch::{Action, Phase, RunState, decide};
use crate::error::{AgentError, ToolError};
use crate::llm::{
    ChatModel, CompletionAccumulator, ModelCompletion, ModelMessage, ModelStreamChunk,
    ModelToolCall, ModelToolChoice, ModelToolDefinition,
};
use crate::notify::Notifier;
use crate::tools::{DependencyMap, PUBLISH_NOTIFICATION_TOOL, ToolOutcome, ToolSpec};

pub const DEFAULT_DELIVERY_PREFIX: &str = "Search result summary:\n";
const SKIPPED_AFTER_DONE: &str = "Skipped: run already completed.";

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Upper bound on model calls per run.
    pub max_iterations: u32,
    /// Upper bound on tool rounds per run. `None` leaves it to `max_iterations`.
    pub max_tool_rounds: Option<u32>,
    pub system_prompt: Option<String>,
    /// Only results of this tool are captured for delivery. `None` captures any tool.
    pub capture_tool: Option<String>,
    pub delivery_prefix: String,
    /// Use the model's streaming endpoint and emit delta events.
    pub stream: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 24,
            max_tool_rounds: None,
            system_prompt: None,
            capture_tool: None,
            delivery_prefix: DEFAULT_DELIVERY_PREFIX.to_string(),
            stream: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Thinking {
        content: String,
    },
    ThinkingDelta {
        content: String,
    },
    Text {
        content: String,
    },
    TextDelta {
        content: String,
    },
    ToolCall {
        tool: String,
        args_json: serde_json::Value,
        tool_call_id: String,
    },
    ToolResult {
        tool: String,
        result_text: String,
        tool_call_id: String,
        is_error: bool,
    },
    /// The captured result was published to the notifier.
    Delivered {
        content: String,
    },
    FinalResponse {
        content: String,
    },
}

pub struct AgentBuilder {
    model: Option<Arc<dyn ChatModel>>,
    tools: Vec<ToolSpec>,
    config: AgentConfig,
    notifier: Option<Arc<dyn Notifier>>,
    dependencies: DependencyMap,
    dependency_overrides: DependencyMap,
}

impl Default for AgentBuilder {
    fn default() -> Self {
        Self {
            model: None,
            tools: Vec::new(),
            config: AgentConfig::default(),
            notifier: None,
            dependencies: DependencyMap::new(),
            dependency_overrides: DependencyMap::new(),
        }
    }
}

impl AgentBuilder {
    pub fn model<M>(mut self, model: M) -> Self
    where
        M: ChatModel + 'static,
    {
        self.model = Some(Arc::new(model));
        self
    }

    pub fn tool(mut self, tool: ToolSpec) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools.extend(tools);
        self
    }

    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    pub fn system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn max_iterations(mut self, max_iterations: u32) -> Self {
        self.config.max_iterations = max_iterations;
        self
    }

    pub fn max_tool_rounds(mut self, max_tool_rounds: u32) -> Self {
        self.config.max_tool_rounds = Some(max_tool_rounds);
        self
    }

    pub fn capture_tool(mut self, tool_name: impl Into<String>) -> Self {
        self.config.capture_tool = Some(tool_name.into());
        self
    }

    pub fn delivery_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.delivery_prefix = prefix.into();
        self
    }

    pub fn stream(mut self, stream: bool) -> Self {
        self.config.stream = stream;
        self
    }

    /// Sets the delivery sink. Tool results are only captured when one is set.
    ///
    /// The notifier is also registered as an `Arc<dyn Notifier>` dependency.
    /// It cannot be combined with the `publish_notification` tool, which would
    /// reach the same sink without going through [`RunState`].
    pub fn notifier<N>(mut self, notifier: N) -> Self
    where
        N: Notifier + 'static,
    {
        let notifier: Arc<dyn Notifier> = Arc::new(notifier);
        self.dependencies.insert(notifier.clone());
        self.notifier = Some(notifier);
        self
    }

    pub fn dependency<T>(self, value: T) -> Self
    where
        T: Send + Sync + 'static,
    {
        self.dependencies.insert(value);
        self
    }

    pub fn dependency_named<T>(self, key: impl Into<String>, value: T) -> Self
    where
        T: Send + Sync + 'static,
    {
        self.dependencies.insert_named(key, value);
        self
    }

    pub fn dependency_override<T>(self, value: T) -> Self
    where
        T: Send + Sync + 'static,
    {
        self.dependency_overrides.insert(value);
        self
    }

    pub fn dependency_override_named<T>(self, key: impl Into<String>, value: T) -> Self
    where
        T: Send + Sync + 'static,
    {
        self.dependency_overrides.insert_named(key, value);
        self
    }

    pub fn build(self) -> Result<Agent, AgentError> {
        let Some(model) = self.model else {
            return Err(AgentError::Config(
                "agent model must be configured via AgentBuilder::model(...)".to_string(),
            ));
        };

        if self.config.max_iterations == 0 {
            return Err(AgentError::Config(
                "max_iterations must be at least 1".to_string(),
            ));
        }

        let mut tool_map = HashMap::new();
        for tool in &self.tools {
            if tool_map
                .insert(tool.name().to_string(), tool.clone())
                .is_some()
            {
                return Err(AgentError::Config(format!(
                    "duplicate tool registered: {}",
                    tool.name()
                )));
            }
        }

        if let Some(capture_tool) = &self.config.capture_tool
            && !tool_map.contains_key(capture_tool)
        {
            return Err(AgentError::Config(format!(
                "capture tool is not registered: {capture_tool}"
            )));
        }

        if self.notifier.is_some() && tool_map.contains_key(PUBLISH_NOTIFICATION_TOOL) {
            return Err(AgentError::Config(format!(
                "{PUBLISH_NOTIFICATION_TOOL} publishes outside the deliver-once result; \
                 register the notifier as a dependency instead of AgentBuilder::notifier"
            )));
        }

        Ok(Agent {
            model,
            tools: self.tools,
            tool_map,
            config: self.config,
            notifier: self.notifier,
            dependencies: self.dependencies,
            dependency_overrides: self.dependency_overrides,
            history: Vec::new(),
            last_run: None,
        })
    }
}

/// Tool-calling agent driven by the turn dispatcher.
///
/// Each `query` is one run: the model is called, [`decide`] picks the next
/// action, the agent performs it and appends the resulting messages, until
/// the dispatcher says [`Action::Stop`]. The conversation history is kept
/// across runs; the [`RunState`] is not.
pub struct Agent {
    model: Arc<dyn ChatModel>,
    tools: Vec<ToolSpec>,
    tool_map: HashMap<String, ToolSpec>,
    config: AgentConfig,
    notifier: Option<Arc<dyn Notifier>>,
    dependencies: DependencyMap,
    dependency_overrides: DependencyMap,
    history: Vec<ModelMessage>,
    last_run: Option<RunState>,
}

impl Agent {
    pub fn builder() -> AgentBuilder {
        AgentBuilder::default()
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    pub fn messages_len(&self) -> usize {
        self.history.len()
    }

    pub fn history(&self) -> &[ModelMessage] {
        &self.history
    }

    /// State of the most recent run that finished without error.
    pub fn last_run_state(&self) -> Option<&RunState> {
        self.last_run.as_ref()
    }

    pub async fn query(&mut self, user_message: impl Into<String>) -> Result<String, AgentError> {
        let stream = self.query_stream(user_message);
        futures_util::pin_mut!(stream);

        let mut final_response: Option<String> = None;

        while let Some(event) = stream.next().await {
            if let AgentEvent::FinalResponse { content } = event? {
                final_response = Some(content);
            }
        }

        final_response.ok_or(AgentError::MissingFinalResponse)
    }

    pub fn query_stream(
        &mut self,
        user_message: impl Into<String>,
    ) -> impl Stream<Item = Result<AgentEvent, AgentError>> + '_ {
        let user_message = user_message.into();

        try_stream! {
            if self.history.is_empty()
                && let Some(system_prompt) = &self.config.system_prompt
            {
                self.history.push(ModelMessage::System(system_prompt.clone()));
            }

            self.history.push(ModelMessage::User(user_message));
            info!(history_len = self.history.len(), "run started");

            let tool_definitions = self.tool_definitions();
            let mut run = RunState::new();
            let mut phase = Phase::default();
            let mut model_calls = 0_u32;
            let mut tool_rounds = 0_u32;
            let mut final_text = String::new();
            let mut done_message: Option<String> = None;

            while !phase.is_terminal() {
                let action = if done_message.is_some() {
                    // A `Done` tool outcome stands in for the model's final turn.
                    decide(None, &run)
                } else {
                    if model_calls >= self.config.max_iterations {
                        Err::<(), AgentError>(AgentError::MaxIterationsReached {
                            max_iterations: self.config.max_iterations,
                        })?;
                    }
                    model_calls += 1;

                    let tool_choice = self.tool_choice(&tool_definitions, tool_rounds);
                    let completion = if self.config.stream {
                        let mut accumulator = CompletionAccumulator::new();
                        let chunks = self
                            .model
                            .invoke_stream(&self.history, &tool_definitions, tool_choice);
                        futures_util::pin_mut!(chunks);
                        while let Some(chunk) = chunks.next().await {
                            let chunk = chunk?;
                            match &chunk {
                                ModelStreamChunk::TextDelta { text, .. } => {
                                    yield AgentEvent::TextDelta { content: text.clone() };
                                }
                                ModelStreamChunk::ThinkingDelta { content, .. } => {
                                    yield AgentEvent::ThinkingDelta { content: content.clone() };
                                }
                                _ => {}
                            }
                            accumulator.push(chunk);
                        }
                        accumulator.finish()?
                    } else {
                        self.model
                            .invoke(&self.history, &tool_definitions, tool_choice)
                            .await?
                    };

                    if let Some(thinking) = completion.thinking.clone() {
                        yield AgentEvent::Thinking { content: thinking };
                    }

                    self.append_assistant_message(&completion);

                    if let Some(text) = completion.text.as_ref().filter(|text| !text.is_empty()) {
                        final_text = text.clone();
                        yield AgentEvent::Text { content: text.clone() };
                    }

                    decide(self.history.last(), &run)
                };

                debug!(?action, ?phase, "dispatcher decision");
                phase = phase.on_decision(action);

                match action {
                    Action::RunTools => {
                        tool_rounds += 1;
                        let tool_calls = self
                            .history
                            .last()
                            .map(|message| message.tool_calls().to_vec())
                            .unwrap_or_default();
                        let over_budget = self
                            .config
                            .max_tool_rounds
                            .is_some_and(|max| tool_rounds > max);

                        let mut pending = tool_calls.into_iter();
                        while let Some(tool_call) = pending.next() {
                            yield AgentEvent::ToolCall {
                                tool: tool_call.name.clone(),
                                args_json: tool_call.arguments.clone(),
                                tool_call_id: tool_call.id.clone(),
                            };

                            let execution = if over_budget {
                                ToolExecutionResult::error(format!(
                                    "Tool round limit reached ({}); answer without tools.",
                                    self.config.max_tool_rounds.unwrap_or_default()
                                ))
                            } else {
                                self.execute_tool_call(&tool_call).await
                            };

                            self.history.push(ModelMessage::ToolResult {
                                tool_call_id: tool_call.id.clone(),
                                tool_name: tool_call.name.clone(),
                                content: execution.result_text.clone(),
                                is_error: execution.is_error,
                            });

                            if self.should_capture(&tool_call.name, execution.is_error)
                                && run.capture_result(execution.result_text.clone())
                            {
                                debug!(tool = %tool_call.name, "captured tool result for delivery");
                            }

                            yield AgentEvent::ToolResult {
                                tool: tool_call.name.clone(),
                                result_text: execution.result_text,
                                tool_call_id: tool_call.id.clone(),
                                is_error: execution.is_error,
                            };

                            if let Some(message) = execution.done_message {
                                // Every tool_use needs a tool_result before the history is reused.
                                for skipped in pending.by_ref() {
                                    let result_text = SKIPPED_AFTER_DONE.to_string();
                                    self.history.push(ModelMessage::ToolResult {
                                        tool_call_id: skipped.id.clone(),
                                        tool_name: skipped.name.clone(),
                                        content: result_text.clone(),
                                        is_error: true,
                                    });
                                    yield AgentEvent::ToolResult {
                                        tool: skipped.name,
                                        result_text,
                                        tool_call_id: skipped.id,
                                        is_error: true,
                                    };
                                }
                                final_text = message.clone();
                                done_message = Some(message);
                                break;
                            }
                        }

                        phase = phase.on_action_complete();
                    }
                    Action::DeliverResult => {
                        let content = self.deliver(&mut run).await?;
                        phase = phase.on_action_complete();
                        yield AgentEvent::Delivered { content };
                    }
                    Action::Stop => {}
                }
            }

            info!(model_calls, tool_rounds, delivered = run.delivered(), "run finished");
            self.last_run = Some(run);

            yield AgentEvent::FinalResponse {
                content: final_text,
            };
        }
    }

    fn tool_definitions(&self) -> Vec<ModelToolDefinition> {
        self.tools
            .iter()
            .map(|tool| ModelToolDefinition {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.json_schema().clone(),
            })
            .collect()
    }

    fn tool_choice(
        &self,
        tool_definitions: &[ModelToolDefinition],
        tool_rounds: u32,
    ) -> ModelToolChoice {
        let exhausted = self
            .config
            .max_tool_rounds
            .is_some_and(|max| tool_rounds >= max);

        if tool_definitions.is_empty() || exhausted {
            ModelToolChoice::None
        } else {
            ModelToolChoice::Auto
        }
    }

    fn should_capture(&self, tool_name: &str, is_error: bool) -> bool {
        if self.notifier.is_none() || is_error {
            return false;
        }
        self.config
            .capture_tool
            .as_deref()
            .is_none_or(|capture| capture == tool_name)
    }

    async fn deliver(&self, run: &mut RunState) -> Result<String, AgentError> {
        let (Some(notifier), Some(result)) = (&self.notifier, run.last_result_text()) else {
            return Err(AgentError::Config(
                "delivery requested without a notifier and captured result".to_string(),
            ));
        };

        let content = format!("{}{}", self.config.delivery_prefix, result);
        notifier.publish(&content).await?;
        run.mark_delivered();
        info!(bytes = content.len(), "captured result delivered");
        Ok(content)
    }

    fn append_assistant_message(&mut self, completion: &ModelCompletion) {
        self.history.push(ModelMessage::Assistant {
            content: completion.text.clone(),
            tool_calls: completion.tool_calls.clone(),
        });
    }

    async fn execute_tool_call(&self, tool_call: &ModelToolCall) -> ToolExecutionResult {
        let Some(tool) = self.tool_map.get(&tool_call.name) else {
            warn!(tool = %tool_call.name, "model requested an unknown tool");
            return ToolExecutionResult::error(
                ToolError::NotFound(tool_call.name.clone()).to_string(),
            );
        };

        let runtime_dependencies = self.dependencies.merged_with(&self.dependency_overrides);

        match tool
            .execute(tool_call.arguments.clone(), &runtime_dependencies)
            .await
        {
            Ok(ToolOutcome::Text(text)) => ToolExecutionResult {
                result_text: text,
                is_error: false,
                done_message: None,
            },
            Ok(ToolOutcome::Done(message)) => ToolExecutionResult {
                result_text: format!("Task completed: {message}"),
                is_error: false,
                done_message: Some(message),
            },
            Err(err) => {
                warn!(tool = %tool_call.name, error = %err, "tool execution failed");
                ToolExecutionResult::error(err.to_string())
            }
        }
    }
}

struct ToolExecutionResult {
    result_text: String,
    is_error: bool,
    done_message: Option<String>,
}

impl ToolExecutionResult {
    fn error(result_text: String) -> Self {
        Self {
            result_text,
            is_error: true,
            done_message: None,
        }
    }
}

pub async fn query(
    agent: &mut Agent,
    user_message: impl Into<String>,
) -> Result<String, AgentError> {
    agent.query(user_message).await
}

pub fn query_stream(
    agent: &mut Agent,
    user_message: impl Into<String>,
) -> impl Stream<Item = Result<AgentEvent, AgentError>> + '_ {
    agent.query_stream(user_message)
}
