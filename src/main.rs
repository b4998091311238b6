//! session-tail: follow one agent session from the terminal.
//!
//! Mounts a [`SessionView`] for the given session, prints each output record
//! to stdout as it lands in the store, and forwards stdin lines to the
//! session as `session:input`. Status changes and diagnostics go to stderr.
//! Ctrl-C or end of stdin unmounts and disconnects.

use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};

use session_channel::protocol::OutputRecord;
use session_channel::{
    Config, Connection, SessionCache, SessionCallbacks, SessionChannel, SessionView, SharedStore,
};

#[derive(Parser)]
#[command(name = "session-tail", version, about = "Follow an agent session's live output")]
struct Cli {
    /// Path to config file (TOML)
    #[arg(long)]
    config: Option<String>,
    /// API server base URL, overrides config and SESSION_CHANNEL_URL
    #[arg(long)]
    url: Option<String>,
    /// Session to follow
    session_id: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("session-tail: {e}");
            std::process::exit(2);
        }
    };
    if let Some(url) = cli.url {
        config.connection.url = url;
    }

    // stdout carries session output only
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .with_writer(std::io::stderr)
        .init();

    info!("session-tail v{} starting", env!("CARGO_PKG_VERSION"));

    let connection = Connection::new(config.connection.clone());
    let channel = SessionChannel::new(connection.clone());
    let store = SharedStore::new(config.store.output_buffer_size);
    let cache: Arc<dyn SessionCache> = Arc::new(|id: &str| {
        debug!("Session {id} metadata is stale");
    });

    let session_id = cli.session_id;
    let mut view = SessionView::new(session_id.clone(), channel.clone(), store.clone(), cache);
    if let Err(e) = view.mount().await {
        error!("Cannot follow session {session_id}: {e}");
        std::process::exit(1);
    }

    let status_for = session_id.clone();
    let status_watch = channel.subscribe(
        &session_id,
        SessionCallbacks::new().on_status(move |event| {
            if event.session_id == status_for {
                eprintln!("[status] {}", event.status.as_str());
            }
        }),
    );

    let printer = tokio::spawn(print_outputs(store, session_id));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => view.send_input(line),
                Ok(None) => break,
                Err(e) => {
                    warn!("stdin: {e}");
                    break;
                }
            }
        }
    }

    status_watch.unsubscribe();
    view.unmount();
    printer.abort();
    connection.disconnect();
}

/// Print records as they arrive, noting any evicted before they were read.
async fn print_outputs(store: SharedStore, session_id: String) {
    let mut cursor = 0;
    loop {
        let (records, dropped, next) = store.wait_for_output(&session_id, cursor).await;
        if dropped > 0 {
            eprintln!("[... {dropped} records dropped ...]");
        }
        for record in &records {
            print_record(record);
        }
        cursor = next;
    }
}

fn print_record(record: &OutputRecord) {
    let content = record.content.trim_end_matches('\n');
    println!("[{}] {content}", record.kind.as_str());
}
