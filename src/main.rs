mod bridge;
mod client;
mod config;
mod protocol;
mod request;
mod resolver;
mod server;
mod utf8;

use clap::{Args, Parser, Subcommand, ValueEnum};
use client::{ChatClient, ClientConfig};
use config::ToolConfig;
use protocol::{ChatRequestBody, StreamEvent};
use server::ServerConfig;
use std::error::Error;
use std::process::ExitCode;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing_subscriber::{EnvFilter, fmt};

type MainResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(
    name = "cli-bridge",
    version,
    about = "Stream a command-line tool's output to HTTP clients as server-sent events"
)]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP bridge.
    Serve(ServeArgs),
    /// Send one prompt to a running bridge and print the tool's output.
    Run(RunArgs),
    /// Print the JSON Schema of the chat request body.
    Schema,
}

#[derive(Debug, Args)]
struct ServeArgs {
    /// Address to listen on.
    #[arg(long, env = "CLI_BRIDGE_LISTEN", default_value = "127.0.0.1:3001")]
    listen: String,

    #[command(flatten)]
    tool: ToolConfig,
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Prompt for the tool.
    prompt: String,

    /// Base URL of the bridge.
    #[arg(long, env = "CLI_BRIDGE_SERVER", default_value = "http://127.0.0.1:3001")]
    server: String,

    #[arg(long)]
    sandbox: bool,

    #[arg(long)]
    yolo: bool,

    #[arg(long)]
    model: Option<String>,

    /// Working directory for the tool, as seen by the server.
    #[arg(long)]
    cwd: Option<String>,

    #[arg(long, env = "CLI_BRIDGE_API_KEY", hide_env_values = true)]
    api_key: Option<String>,
}

#[tokio::main]
async fn main() -> MainResult<ExitCode> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let default_level = match cli.command {
        Command::Serve(_) => "info",
        _ => "warn",
    };
    init_tracing(cli.log_format, default_level)?;

    match cli.command {
        Command::Serve(args) => {
            server::run(ServerConfig {
                listen: args.listen,
                tool: args.tool,
            })
            .await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Run(args) => run_prompt(args).await,
        Command::Schema => {
            let schema = serde_json::to_string_pretty(&protocol::chat_request_schema())?;
            println!("{schema}");
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn init_tracing(format: LogFormat, default_level: &str) -> MainResult<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = fmt().with_env_filter(filter).with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    }
}

async fn run_prompt(args: RunArgs) -> MainResult<ExitCode> {
    let client = ChatClient::new(ClientConfig {
        base_url: args.server,
    });
    let body = ChatRequestBody {
        prompt: args.prompt,
        sandbox: args.sandbox,
        yolo: args.yolo,
        model: args.model,
        working_directory: args.cwd,
        api_key: args.api_key,
    };

    let terminal = client.stream_chat(&body, write_output).await;

    match terminal {
        Ok(StreamEvent::Close(code)) => Ok(exit_code(code)),
        Ok(StreamEvent::Error(message)) => {
            eprintln!("error: {message}");
            Ok(ExitCode::FAILURE)
        }
        Ok(_) => Ok(ExitCode::FAILURE),
        Err(err) => {
            eprintln!("error: {err}");
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn write_output(event: StreamEvent) {
    let result = match event {
        StreamEvent::Stdout(chunk) => write_flush(tokio::io::stdout(), &chunk).await,
        StreamEvent::Stderr(chunk) => write_flush(tokio::io::stderr(), &chunk).await,
        StreamEvent::Close(_) | StreamEvent::Error(_) => Ok(()),
    };
    if let Err(err) = result {
        tracing::warn!(error = %err, "failed to write tool output");
    }
}

async fn write_flush<W: AsyncWrite + Unpin>(mut out: W, chunk: &str) -> std::io::Result<()> {
    out.write_all(chunk.as_bytes()).await?;
    out.flush().await
}

fn exit_code(code: i32) -> ExitCode {
    u8::try_from(code)
        .map(ExitCode::from)
        .unwrap_or(ExitCode::FAILURE)
}
