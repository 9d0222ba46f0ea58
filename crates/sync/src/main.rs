//! chatsync
//!
//! Thin command-line host for the sync engine: follow a session live,
//! list sessions, or export a transcript.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chatsync::logging::{init_logging, LogConfig};
use chatsync::{
    ConfigOverrides, DataDir, HttpBridge, HttpBridgeConfig, SyncConfig, SyncHandle, SyncSnapshot,
    SyncStatus,
};
use chatsync_protocol::Role;
use clap::{Parser, Subcommand};
use tracing::info;

/// Client-side sync engine for assistant chat sessions.
#[derive(Parser, Debug)]
#[command(name = "chatsync", version, about, long_about = None)]
struct Cli {
    /// Assistant server base URL
    #[arg(long, global = true, env = "CHATSYNC_SERVER_URL")]
    server: Option<String>,

    /// Workspace directory sent with every request
    #[arg(long, global = true, env = "CHATSYNC_WORKSPACE")]
    workspace: Option<String>,

    /// Where config.toml and logs live
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Follow the connection and a session's messages until Ctrl-C.
    Tail {
        /// Session to show (default: none, status only)
        #[arg(long)]
        session: Option<String>,
    },
    /// List top-level sessions.
    Sessions,
    /// Print a session transcript as Markdown.
    Export {
        /// Session id
        id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;
    data_dir
        .ensure_dirs()
        .with_context(|| format!("creating {}", data_dir.root().display()))?;
    let _logging = init_logging(&LogConfig {
        log_dir: data_dir.log_dir(),
    })?;

    let overrides = ConfigOverrides {
        server_url: cli.server.clone(),
        workspace: cli.workspace.clone(),
    };
    let config = SyncConfig::load(&data_dir, &overrides)?;
    info!(
        component = "cli",
        event = "cli.start",
        server_url = %config.server_url,
        workspace = ?config.workspace,
    );

    let bridge = Arc::new(HttpBridge::new(HttpBridgeConfig::from(&config))?);

    match cli.command {
        Commands::Tail { session } => {
            let handle = SyncHandle::spawn(bridge, config, session);
            tail(&handle).await?;
            handle.shutdown().await;
        }
        Commands::Sessions => {
            let handle = SyncHandle::spawn(bridge, config, None);
            let snapshot = handle
                .wait_for(|s| s.is_ready() || matches!(s.status, SyncStatus::Error { .. }))
                .await?;
            if let SyncStatus::Error { message } = &snapshot.status {
                anyhow::bail!("could not load sessions: {message}");
            }
            for session in &snapshot.sessions {
                let title = if session.title.is_empty() {
                    "(untitled)"
                } else {
                    session.title.as_str()
                };
                println!("{}\t{}", session.id, title);
            }
            handle.shutdown().await;
        }
        Commands::Export { id } => {
            let handle = SyncHandle::spawn(bridge, config, None);
            let markdown = handle.export_session(id).await?;
            print!("{markdown}");
            handle.shutdown().await;
        }
    }
    Ok(())
}

async fn tail(handle: &SyncHandle) -> anyhow::Result<()> {
    let mut revisions = handle.subscribe_revisions();
    let mut last_status: Option<SyncStatus> = None;
    let mut printed: HashSet<String> = HashSet::new();

    loop {
        let snapshot = handle.snapshot();
        if last_status.as_ref() != Some(&snapshot.status) {
            eprintln!("[{}]", snapshot.status.label());
            last_status = Some(snapshot.status.clone());
        }
        print_settled(&snapshot, &mut printed);
        if let Some(error) = &snapshot.session_error {
            eprintln!("! {error}");
        }

        tokio::select! {
            changed = revisions.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
            }
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

/// Print user messages right away and assistant messages once complete.
fn print_settled(snapshot: &SyncSnapshot, printed: &mut HashSet<String>) {
    for message in &snapshot.messages {
        let settled = match message.info.role {
            Role::User => true,
            Role::Assistant => message.info.time.completed.is_some(),
        };
        if !settled || !printed.insert(message.info.id.clone()) {
            continue;
        }
        let who = match message.info.role {
            Role::User => "you",
            Role::Assistant => message.info.agent.as_deref().unwrap_or("assistant"),
        };
        println!("{who}> {}", message.text);
    }
}
