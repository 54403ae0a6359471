// Conversation client entry point.
//
// Startup sequence:
// 1. Initialize tracing (log to file, not terminal)
// 2. Load config
// 3. Start the live feed
// 4. Build the backend: websocket + HTTP, or the SQLite store with --local
// 5. Create the reconciler and channels
// 6. Spawn the event loop and the printer task
// 7. Read commands from stdin until /quit or EOF
// 8. Cleanup on exit

mod commands;
mod render;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use convo_core::app;
use convo_core::config::{self, Config};
use convo_core::db::{Database, StoreChatApi, StoreTransport, StoredUser};
use convo_core::http_api::HttpChatApi;
use convo_core::live::LiveFeed;
use convo_core::message::ConversationSummary;
use convo_core::protocol::{UiUpdate, UserCommand};
use convo_core::reconciler::Reconciler;
use convo_core::transport::{ChatApi, Transport};
use convo_core::ws_client::{WsSettings, WsTransport};

use commands::{Input, HELP};
use render::{summary_line, Renderer};

#[derive(Debug, Default, PartialEq, Eq)]
struct Args {
    /// Serve history and mutations from the local SQLite store.
    local: bool,
    /// Conversation to open on startup.
    remote: Option<String>,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> anyhow::Result<Args> {
    let mut parsed = Args::default();
    for arg in args {
        match arg.as_str() {
            "--local" => parsed.local = true,
            flag if flag.starts_with("--") => anyhow::bail!("unknown option {flag}"),
            _ if parsed.remote.is_some() => anyhow::bail!("usage: convo [--local] [user-id]"),
            _ => parsed.remote = Some(arg),
        }
    }
    Ok(parsed)
}

/// Where `/list` and `/unread` are answered from.
enum Directory {
    Remote(HttpChatApi),
    Local { db: Arc<Database>, user_id: String },
}

impl Directory {
    async fn conversations(&self) -> anyhow::Result<Vec<ConversationSummary>> {
        match self {
            Directory::Remote(api) => Ok(api.conversations().await?),
            Directory::Local { db, user_id } => db.conversations(user_id, 100),
        }
    }

    async fn unread_count(&self) -> anyhow::Result<usize> {
        match self {
            Directory::Remote(api) => Ok(api.unread_count().await?),
            Directory::Local { db, user_id } => db.unread_count(user_id),
        }
    }
}

/// Everything the event loop talks to, for one of the two modes.
struct Backend {
    transport: Arc<dyn Transport>,
    api: Arc<dyn ChatApi>,
    directory: Directory,
    /// The websocket supervisor, when there is one.
    supervisor: Option<JoinHandle<()>>,
}

fn build_backend(config: &Config, local: bool, feed: &Arc<LiveFeed>) -> anyhow::Result<Backend> {
    if local {
        let db = Arc::new(Database::open(&config.db_path).context("failed to open database")?);
        db.upsert_user(&StoredUser::from_config(&config.user))
            .context("failed to register local user")?;
        info!("Database opened at {}", config.db_path);

        let user_id = config.user.id.clone();
        let api = StoreChatApi::new(Arc::clone(&db), user_id.clone(), config.chat.history_page_size);
        let transport = StoreTransport::new(Arc::clone(&db), Arc::clone(feed), user_id.clone());
        Ok(Backend {
            transport: Arc::new(transport),
            api: Arc::new(api),
            directory: Directory::Local { db, user_id },
            supervisor: None,
        })
    } else {
        let (transport, handle) =
            WsTransport::spawn(WsSettings::from_config(config), Arc::clone(feed));
        let api = HttpChatApi::from_config(config).context("failed to build API client")?;
        let directory =
            Directory::Remote(HttpChatApi::from_config(config).context("failed to build API client")?);
        info!("Using conversation API at {}", config.server.base_url);
        Ok(Backend {
            transport: Arc::new(transport),
            api: Arc::new(api),
            directory,
            supervisor: Some(handle),
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = parse_args(std::env::args().skip(1))?;

    // 1. Initialize tracing (log to file, not terminal)
    init_tracing()?;
    info!("Conversation client starting up");

    // 2. Load config
    let config = config::load_config().context("failed to load configuration")?;
    info!(
        "Config loaded: user={}, server={}",
        config.user.id, config.server.base_url
    );

    // 3. Live feed
    let feed = Arc::new(LiveFeed::new(config.user.id.clone()));

    // 4. Backend
    let backend = build_backend(&config, args.local, &feed)?;

    // 5. Reconciler and channels
    let reconciler = Reconciler::new(
        backend.transport,
        backend.api,
        config.user.id.clone(),
        args.remote.clone().unwrap_or_default(),
        config.chat.typing_idle(),
    );
    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let (ui_tx, ui_rx) = mpsc::channel(256);

    // 6. Event loop and printer
    let live_rx = feed.subscribe();
    let app_handle = tokio::spawn(async move {
        if let Err(e) = app::run(reconciler, live_rx, cmd_rx, ui_tx).await {
            error!("Conversation loop error: {}", e);
        }
    });
    let printer_handle = tokio::spawn(print_updates(ui_rx));

    println!("Signed in as {}. Type /help for commands.", config.user.id);
    if args.remote.is_none() {
        println!("Open a conversation with /open <user-id>.");
    }

    // 7. Read commands until the user quits
    if let Err(e) = read_commands(cmd_tx, &backend.directory).await {
        error!("Input error: {}", e);
    }

    // 8. Cleanup: wait for the loop to withdraw typing state (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = app_handle.await;
        let _ = printer_handle.await;
    })
    .await;

    // The supervisor may be sleeping between reconnect attempts.
    if let Some(handle) = backend.supervisor {
        handle.abort();
    }

    info!("Conversation client shut down cleanly");
    Ok(())
}

async fn print_updates(mut ui_rx: mpsc::Receiver<UiUpdate>) {
    let mut renderer = Renderer::new();
    while let Some(update) = ui_rx.recv().await {
        for line in renderer.render(&update) {
            println!("{line}");
        }
    }
}

async fn read_commands(
    cmd_tx: mpsc::Sender<UserCommand>,
    directory: &Directory,
) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let input = match commands::parse_line(&line) {
            Ok(input) => input,
            Err(e) => {
                println!("{e}");
                continue;
            }
        };

        match input {
            Input::Commands(cmds) => {
                let quitting = cmds.contains(&UserCommand::Quit);
                for cmd in cmds {
                    if cmd_tx.send(cmd).await.is_err() {
                        return Ok(());
                    }
                }
                if quitting {
                    return Ok(());
                }
            }
            Input::ConfirmClear => {
                println!("Delete every message in this conversation? [y/N]");
                let answer = lines.next_line().await?.unwrap_or_default();
                let confirmed = commands::is_affirmative(&answer);
                if cmd_tx.send(UserCommand::Clear { confirmed }).await.is_err() {
                    return Ok(());
                }
            }
            Input::ListConversations => match directory.conversations().await {
                Ok(list) if list.is_empty() => println!("No conversations yet."),
                Ok(list) => list.iter().for_each(|s| println!("{}", summary_line(s))),
                Err(e) => println!("! could not list conversations: {e}"),
            },
            Input::UnreadCount => match directory.unread_count().await {
                Ok(count) => println!("{count} unread"),
                Err(e) => println!("! could not count unread messages: {e}"),
            },
            Input::Help => println!("{HELP}"),
            Input::Nothing => {}
        }
    }

    // EOF: ask the loop to wind down.
    let _ = cmd_tx.send(UserCommand::Quit).await;
    Ok(())
}

/// Initialize tracing to log to a file (the terminal is the chat UI).
fn init_tracing() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let log_dir = std::env::current_dir()?.join("logs");
    std::fs::create_dir_all(&log_dir)?;

    let log_file = std::fs::File::create(log_dir.join("convo.log"))?;

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("convo_core=info,convo=info,warn")),
        )
        .with_writer(log_file)
        .with_ansi(false)
        .with_target(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    Ok(())
}
