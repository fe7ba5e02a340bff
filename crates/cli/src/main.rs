use std::io::stdout;
use std::process::ExitCode;
use std::sync::Arc;

use hilo::error::{BackendSnafu, CliResult, SettingsSnafu, StorageSnafu, TerminalSnafu};
use hilo::input::next_input;
use hilo::render::TranscriptRenderer;
use hilo::settings::{ChatSettings, SettingsStore};
use hilo_chat::{ChatStore, DispatchOutcome, SendLock, SendStatus};
use hilo_storage::{MemoryStorage, MessageStore, SessionId, SqliteStorage};
use snafu::ResultExt;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(error = %error, "hilo exited with an error");
            eprintln!("error: {error}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn run() -> CliResult<()> {
    let settings_store = SettingsStore::load();
    let session_id = match std::env::args().nth(1) {
        Some(raw) => SessionId::parse(&raw).context(StorageSnafu {
            stage: "parse-session-argument",
        })?,
        None => settings_store.ensure_session().context(SettingsSnafu {
            stage: "ensure-session",
        })?,
    };
    let settings = settings_store.settings();

    let storage = open_storage(&settings, &settings_store).await?;
    let backend = hilo_llm::create_backend(settings.backend_config()).context(BackendSnafu {
        stage: "create-backend",
    })?;
    let lock = Arc::new(SendLock::new());

    let store = ChatStore::builder(session_id, storage, backend)
        .lock(lock)
        .config(settings.dispatcher_config())
        .on_error(|message| eprintln!("\nerror: {message}"))
        .build();
    tracing::info!(session_id = %session_id, endpoint = %settings.endpoint, "chat session ready");

    store.load().await;
    let renderer = Arc::new(TranscriptRenderer::new(stdout()));
    renderer
        .print_history(&store.snapshot())
        .context(TerminalSnafu {
            stage: "print-history",
        })?;

    let listener = Arc::clone(&renderer);
    let _subscription = store.subscribe(move |snapshot| {
        if let Err(error) = listener.render(snapshot) {
            tracing::warn!(error = %error, "failed to render reply");
        }
    });

    chat_loop(&store).await
}

async fn open_storage(
    settings: &ChatSettings,
    settings_store: &SettingsStore,
) -> CliResult<Arc<dyn MessageStore>> {
    if settings.uses_memory_database() {
        tracing::info!("using in-memory message storage");
        return Ok(Arc::new(MemoryStorage::new()));
    }

    let location = settings.database_location(&settings_store.config_dir());
    let storage = SqliteStorage::open(&location).await.context(StorageSnafu {
        stage: "open-sqlite",
    })?;
    Ok(Arc::new(storage))
}

async fn chat_loop(store: &ChatStore) -> CliResult<()> {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut async_stdout = tokio::io::stdout();
    let mut lines = stdin.lines();

    loop {
        async_stdout.write_all(b"> ").await.context(TerminalSnafu {
            stage: "write-prompt",
        })?;
        async_stdout.flush().await.context(TerminalSnafu {
            stage: "flush-prompt",
        })?;

        // Ctrl-C at the prompt ends the session.
        let line = next_input(&mut lines, tokio::signal::ctrl_c()).await;
        let Some(input) = line.context(TerminalSnafu {
            stage: "read-line",
        })?
        else {
            println!();
            break;
        };

        match input.trim() {
            "" => continue,
            "/quit" | "/exit" => break,
            "/clear" => {
                store.clear().await;
                println!("conversation cleared");
                continue;
            }
            _ => {}
        }

        match store.send(&input) {
            SendStatus::Dispatched(handle) => {
                let wait = handle.wait();
                tokio::pin!(wait);
                let outcome = tokio::select! {
                    outcome = &mut wait => outcome,
                    _ = tokio::signal::ctrl_c() => {
                        store.abort();
                        wait.await
                    }
                };
                if outcome == DispatchOutcome::Cancelled {
                    println!("\n[cancelled]");
                }
            }
            SendStatus::Busy => eprintln!("still waiting for the previous reply"),
            SendStatus::Empty => {}
            SendStatus::NoRuntime => eprintln!("chat runtime is not available"),
        }
    }

    Ok(())
}
