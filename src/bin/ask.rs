use std::error::Error;
use std::io::Write;

use clap::{ArgAction, Parser};
use dotenvy::dotenv;
use futures_util::StreamExt;
use notify_agent_rs::logging::init_logging;
use notify_agent_rs::{Agent, AgentEvent, AnthropicModel, AnthropicModelConfig};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "ask", version, about = "Ask the model a single question")]
struct Cli {
    /// Question to send; joined with spaces
    prompt: Vec<String>,

    /// Model id
    #[arg(long, env = "ANTHROPIC_MODEL", default_value = "claude-3-7-sonnet-latest")]
    model: String,

    /// Print the answer as it is generated
    #[arg(long, action = ArgAction::SetTrue)]
    stream: bool,

    /// Enable extended thinking with this token budget
    #[arg(long)]
    thinking_budget: Option<usize>,

    #[arg(long, default_value_t = 4096)]
    max_tokens: u32,

    #[arg(long)]
    system: Option<String>,

    /// Log level when RUST_LOG is unset (error,warn,info,debug,trace)
    #[arg(long, default_value = "warn")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    dotenv().ok();
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    let prompt = cli.prompt.join(" ");
    let prompt = if prompt.trim().is_empty() {
        "Explain Rust ownership in three sentences.".to_string()
    } else {
        prompt
    };

    let mut config = AnthropicModelConfig::from_env(cli.model)?.with_max_tokens(cli.max_tokens);
    if let Some(budget) = cli.thinking_budget {
        config = config.with_thinking_budget(budget);
    }
    info!(model = %config.model, stream = cli.stream, "asking");

    let mut builder = Agent::builder()
        .model(AnthropicModel::new(config)?)
        .max_iterations(1)
        .stream(cli.stream);
    if let Some(system) = cli.system {
        builder = builder.system_prompt(system);
    }
    let mut agent = builder.build()?;

    let stream = agent.query_stream(prompt);
    futures_util::pin_mut!(stream);

    let mut stdout = std::io::stdout();
    let mut in_thinking = false;

    while let Some(event) = stream.next().await {
        match event? {
            AgentEvent::ThinkingDelta { content } => {
                if !in_thinking {
                    writeln!(stdout, "<thinking>")?;
                    in_thinking = true;
                }
                write!(stdout, "{content}")?;
                stdout.flush()?;
            }
            AgentEvent::TextDelta { content } => {
                if in_thinking {
                    writeln!(stdout, "\n</thinking>")?;
                    in_thinking = false;
                }
                write!(stdout, "{content}")?;
                stdout.flush()?;
            }
            AgentEvent::Thinking { content } if !cli.stream => {
                println!("<thinking>\n{content}\n</thinking>");
            }
            AgentEvent::Text { content } if !cli.stream => {
                println!("{content}");
            }
            AgentEvent::FinalResponse { .. } if cli.stream => {
                if in_thinking {
                    write!(stdout, "\n</thinking>")?;
                }
                writeln!(stdout)?;
            }
            _ => {}
        }
    }

    Ok(())
}
