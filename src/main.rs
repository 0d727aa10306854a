mod config;
mod console;
mod static_server;
mod updates;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use madmail_core::client::{ConfigMutationCoordinator, HttpTransport, RemoteAdminClient};
use madmail_core::profiles::{ProfileBook, SavedServerProfile};
use madmail_core::store::JsonFileCollection;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "madmail-admin", version)]
#[command(about = "Administration console for Madmail servers")]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    console: ConsoleArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive admin console (default)
    Console(ConsoleArgs),
    /// Serve a console build from a local directory
    Serve {
        /// Directory containing index.html
        dir: PathBuf,
        /// Port on 127.0.0.1, 0 picks a free one
        #[arg(short, long, default_value_t = 0)]
        port: u16,
    },
}

#[derive(Args)]
struct ConsoleArgs {
    /// Admin endpoint, e.g. https://mail.example.org/api/admin
    #[arg(long, env = "MADMAIL_URL")]
    url: Option<String>,

    /// Admin token
    #[arg(long, env = "MADMAIL_TOKEN", hide_env_values = true)]
    token: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("madmail_admin=info"))
        .init();

    let cli = Cli::parse();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("madmail-admin")
        .build()?;

    match cli.command {
        Some(Commands::Serve { dir, port }) => runtime.block_on(static_server::serve(dir, port)),
        Some(Commands::Console(args)) => runtime.block_on(run_console(args)),
        None => runtime.block_on(run_console(cli.console)),
    }
}

async fn run_console(args: ConsoleArgs) -> Result<()> {
    let settings = config::load_settings();

    // Flags and environment win over the persisted session
    let initial = args
        .url
        .or_else(|| settings.last_url.clone())
        .zip(args.token.or_else(|| settings.last_token.clone()));

    let transport = Arc::new(HttpTransport::new(settings.request_timeout())?);
    let (events_tx, events_rx) = async_channel::unbounded();
    let coordinator =
        ConfigMutationCoordinator::new(RemoteAdminClient::new(transport), settings.poll_policy(), events_tx);

    let profiles = ProfileBook::new(Arc::new(JsonFileCollection::<SavedServerProfile>::new(
        config::get_servers_path(),
    )));

    let (notices_tx, notices_rx) = async_channel::unbounded();
    let updates = match settings.asset_origin.as_deref() {
        Some(origin) => match updates::ConsoleUpdates::start(origin, &settings, notices_tx).await {
            Ok(updates) => Some(updates),
            Err(e) => {
                log::warn!("Console update detection disabled: {:#}", e);
                None
            }
        },
        None => None,
    };

    console::Console::new(coordinator, profiles, settings, config::get_settings_path(), updates)
        .run(events_rx, notices_rx, initial)
        .await
}
