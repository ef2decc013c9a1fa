use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

mod error;
mod models;
mod parser;
mod relay;
mod retry;
mod server;
mod session;
mod settings;
mod storage;

use settings::SettingsLayer;

#[derive(Debug, Parser)]
#[command(name = "waves_relay")]
#[command(about = "Chat relay that turns prompts into HTML via a chat-completion model", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the chat API. The default credential is read from WAVES_API_KEY.
    Start {
        #[arg(long, default_value = "127.0.0.1:3000")]
        listen: String,
        /// Base URL of the chat-completion API
        #[arg(long)]
        upstream_url: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        temperature: Option<f32>,
        #[arg(long)]
        max_tokens: Option<u32>,
        /// User/assistant pairs kept per conversation
        #[arg(long)]
        history_pairs: Option<usize>,
        /// Conversations kept before the least recently used one is dropped
        #[arg(long)]
        max_sessions: Option<usize>,
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Start {
            listen,
            upstream_url,
            model,
            temperature,
            max_tokens,
            history_pairs,
            max_sessions,
            timeout_secs,
        } => {
            let addr: SocketAddr = listen.parse()?;
            let flags = SettingsLayer {
                upstream_url,
                api_key: None,
                model,
                temperature,
                max_tokens,
                history_pairs,
                max_sessions,
                timeout_secs,
            };
            let settings = settings::resolve_settings(&flags, &SettingsLayer::from_env())?;
            if settings.api_key.is_none() {
                tracing::warn!("no default API key configured; callers must send their own");
            }

            let store = Arc::new(storage::InMemoryConversationStore::new(settings.history_pairs, settings.max_sessions));
            let model = Arc::new(models::OpenAICompatible::new(
                settings.upstream_url.clone(),
                settings.model.clone(),
                settings.timeout,
            )?);
            let state = server::AppState { relay: relay::Relay::new(store, model, &settings) };
            server::serve(addr, state).await?;
        }
    }
    Ok(())
}
