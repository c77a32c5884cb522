use anyhow::Result;
use clap::Parser;
use client_core::{
    ChatClient, ClientEvent, ConversationEntry, RealtimeClient, Reconciled, SendError, ViewEntry,
};
use shared::domain::ConversationId;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::{self, error::RecvError},
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "http://127.0.0.1:8443")]
    server_url: String,
    #[arg(long)]
    username: String,
    /// Conversation to open right after login.
    #[arg(long)]
    open: Option<i64>,
}

enum Command {
    List,
    Open(ConversationId),
    Close,
    Quit,
    Send(String),
    Unknown(String),
}

fn parse_command(line: &str) -> Option<Command> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Some(Command::Send(line.to_string()));
    };
    let mut parts = rest.split_whitespace();
    let command = match (parts.next(), parts.next()) {
        (Some("list"), None) => Command::List,
        (Some("close"), None) => Command::Close,
        (Some("quit"), None) => Command::Quit,
        (Some("open"), Some(id)) => match id.parse::<i64>() {
            Ok(id) => Command::Open(ConversationId(id)),
            Err(_) => Command::Unknown(line.to_string()),
        },
        _ => Command::Unknown(line.to_string()),
    };
    Some(command)
}

fn print_conversations(entries: &[ConversationEntry]) {
    if entries.is_empty() {
        println!("(no conversations)");
    }
    for entry in entries {
        let title = entry.summary.title.as_deref().unwrap_or("untitled");
        let preview = entry.preview().unwrap_or("");
        println!(
            "  [{}] {} ({}) {}",
            entry.conversation_id(),
            title,
            entry.activity_at().format("%Y-%m-%d %H:%M"),
            preview
        );
    }
}

fn print_entry(entry: &ViewEntry) {
    let marker = if entry.is_provisional() { "…" } else { " " };
    println!(
        "{marker} {} user {}: {}",
        entry.created_at().format("%H:%M"),
        entry.sender_id(),
        entry.content()
    );
}

fn render(event: ClientEvent) {
    match event {
        ClientEvent::ConversationsLoaded(_) => {}
        ClientEvent::ConversationListChanged(entries) => {
            if let Some(top) = entries.first() {
                println!("* activity in conversation {}", top.conversation_id());
            }
        }
        ClientEvent::ConversationOpened { .. } | ClientEvent::ProvisionalAdded(_) => {}
        ClientEvent::ConversationClosed(id) => println!("closed conversation {id}"),
        ClientEvent::MessageReconciled {
            outcome: Reconciled::Collapsed { .. },
            ..
        } => {}
        ClientEvent::MessageReconciled { message, .. } => {
            println!(
                "  {} {}: {}",
                message.created_at.format("%H:%M"),
                message.sender.username,
                message.content
            );
        }
        ClientEvent::SendFailed { reason, .. } => println!("! message not sent: {reason}"),
        ClientEvent::Error(message) => println!("! {message}"),
    }
}

/// Renders until the client goes away; a lagging receiver skips ahead.
async fn pump_events(mut events: broadcast::Receiver<ClientEvent>, mut render: impl FnMut(ClientEvent)) {
    loop {
        match events.recv().await {
            Ok(event) => render(event),
            Err(RecvError::Lagged(skipped)) => println!("! {skipped} updates skipped"),
            Err(RecvError::Closed) => break,
        }
    }
}

/// Failures after the request went out arrive as `SendFailed` events.
fn send_error_notice(err: &SendError) -> Option<String> {
    match err {
        SendError::Rejected(_) | SendError::Network(_) => None,
        SendError::NoOpenConversation => Some("! open a conversation first: /open <id>".to_string()),
        other => Some(format!("! {other}")),
    }
}

async fn open(client: &std::sync::Arc<RealtimeClient>, conversation_id: ConversationId) {
    match client.open_conversation(conversation_id).await {
        Ok(entries) => {
            println!("--- conversation {conversation_id} ---");
            entries.iter().for_each(print_entry);
        }
        Err(err) => println!("! cannot open {conversation_id}: {err:#}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();
    let args = Args::parse();

    let client = RealtimeClient::connect_http(&args.server_url)?;
    tokio::spawn(pump_events(client.subscribe_events(), render));

    let user_id = client.login(&args.username).await?;
    println!("Logged in as {} (user_id={user_id})", args.username);
    print_conversations(&client.conversations().await);
    if let Some(id) = args.open {
        open(&client, ConversationId(id)).await;
    }
    println!("commands: /list, /open <id>, /close, /quit; anything else is sent");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match parse_command(&line) {
            None => {}
            Some(Command::List) => print_conversations(&client.conversations().await),
            Some(Command::Open(id)) => open(&client, id).await,
            Some(Command::Close) => {
                if let Err(err) = client.close_conversation().await {
                    println!("! {err:#}");
                }
            }
            Some(Command::Quit) => break,
            Some(Command::Send(content)) => {
                if let Err(err) = client.send_message(&content).await {
                    if let Some(notice) = send_error_notice(&err) {
                        println!("{notice}");
                    }
                }
            }
            Some(Command::Unknown(input)) => println!("unknown command: {input}"),
        }
    }
    Ok(())
}
