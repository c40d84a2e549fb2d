use std::error::Error;
use std::io::Write;
use std::sync::Arc;

use clap::{ArgAction, Parser};
use dotenvy::dotenv;
use futures_util::StreamExt;
use notify_agent_rs::logging::init_logging;
use notify_agent_rs::{
    Agent, AgentEvent, AnthropicModel, LogNotifier, Notifier, NotifyError, WebSearchClient,
    WebhookNotifier, publish_notification_tool, web_search_tool,
};
use tracing::{info, warn};

const SYSTEM_PROMPT: &str = "You are a research assistant.\n\
Rules:\n\
1. Call web_search exactly once.\n\
2. Summarize the search results concisely in the user's language.\n\
3. Once the summary is written, do not call any more tools.";
const PUBLISH_RULE: &str =
    "4. Exception to rule 3: call publish_notification exactly once with the summary.";

#[derive(Parser, Debug)]
#[command(
    name = "search_notify",
    version,
    about = "Search the web once, summarize, and publish the search result"
)]
struct Cli {
    /// Question to research; joined with spaces
    question: Vec<String>,

    /// Model id
    #[arg(long, env = "ANTHROPIC_MODEL", default_value = "claude-3-7-sonnet-latest")]
    model: String,

    /// Tool rounds allowed before tools are withheld from the model
    #[arg(long, default_value_t = 1)]
    max_tool_rounds: u32,

    /// Let the model publish through the publish_notification tool instead of
    /// delivering the captured search result once after the run
    #[arg(long, action = ArgAction::SetTrue)]
    expose_publish_tool: bool,

    /// Wait for whole responses instead of streaming them
    #[arg(long, action = ArgAction::SetTrue)]
    no_stream: bool,

    /// Log level when RUST_LOG is unset (error,warn,info,debug,trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn notifier_from_env() -> Arc<dyn Notifier> {
    match WebhookNotifier::from_env() {
        Ok(notifier) => Arc::new(notifier),
        Err(NotifyError::NotConfigured(reason)) => {
            warn!(%reason, "webhook not configured, notifications go to the log");
            let topic = std::env::var("NOTIFY_TOPIC").unwrap_or_else(|_| "search-results".into());
            Arc::new(LogNotifier::with_topic(topic))
        }
        Err(err) => {
            warn!(error = %err, "webhook notifier unavailable, notifications go to the log");
            Arc::new(LogNotifier::new())
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    dotenv().ok();
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    let question = cli.question.join(" ");
    let question = if question.trim().is_empty() {
        "Explain the basics of LangGraph in simple terms".to_string()
    } else {
        question
    };

    let builder = Agent::builder()
        .model(AnthropicModel::from_env(cli.model)?)
        .tool(web_search_tool())
        .dependency(WebSearchClient::from_env()?)
        .stream(!cli.no_stream);
    let builder = if cli.expose_publish_tool {
        // One extra round for the publish call.
        builder
            .tool(publish_notification_tool())
            .dependency(notifier_from_env())
            .max_tool_rounds(cli.max_tool_rounds + 1)
            .system_prompt(format!("{SYSTEM_PROMPT}\n{PUBLISH_RULE}"))
    } else {
        builder
            .notifier(notifier_from_env())
            .capture_tool("web_search")
            .max_tool_rounds(cli.max_tool_rounds)
            .system_prompt(SYSTEM_PROMPT)
    };
    let mut agent = builder.build()?;

    info!(%question, "starting search run");
    {
        let stream = agent.query_stream(question);
        futures_util::pin_mut!(stream);

        while let Some(event) = stream.next().await {
            print_event(event?, cli.no_stream)?;
        }
    }

    match agent.last_run_state() {
        Some(run) if run.delivered() => info!("search result published"),
        _ => info!("run finished without a search result to publish"),
    }

    Ok(())
}

fn print_event(event: AgentEvent, no_stream: bool) -> std::io::Result<()> {
    match event {
        AgentEvent::TextDelta { content } => {
            print!("{content}");
            std::io::stdout().flush()?;
        }
        AgentEvent::Text { content } => {
            if no_stream {
                println!("{content}");
            } else {
                println!();
            }
        }
        AgentEvent::ToolCall {
            tool,
            args_json,
            tool_call_id,
        } => println!("tool-call [{tool_call_id}] {tool}: {args_json}"),
        AgentEvent::ToolResult {
            tool,
            result_text,
            is_error,
            ..
        } => {
            let status = if is_error { "error" } else { "ok" };
            println!("tool-result {tool} ({status}): {}", truncate(&result_text, 200));
        }
        AgentEvent::Delivered { content } => {
            println!("delivered: {}", truncate(&content, 200));
        }
        AgentEvent::Thinking { .. }
        | AgentEvent::ThinkingDelta { .. }
        | AgentEvent::FinalResponse { .. } => {}
    }
    Ok(())
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let head = text.chars().take(max_chars).collect::<String>();
    format!("{head}...")
}
