use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{
    load_settings, ChatBackend, ChatSession, ConnectionState, OlderPageOutcome, RestBackend,
    SyncError, Transport, WebSocketTransport,
};
use shared::{
    domain::{MemberRole, Message, MessageId, RoomId, UserId},
    protocol::ServerEvent,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::error::RecvError,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Terminal client for a single chat room")]
struct Args {
    /// REST base url; overrides client.toml and the environment.
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    token: String,
    #[arg(long)]
    user_id: i64,
    #[arg(long)]
    room: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(url) = args.server_url {
        settings.server_url = url;
    }
    let backend: Arc<dyn ChatBackend> =
        Arc::new(RestBackend::new(settings.server_url.clone(), args.token.clone()));
    let transport: Arc<dyn Transport> = Arc::new(WebSocketTransport);
    let session = ChatSession::new(settings, transport, backend, UserId(args.user_id));

    let printer = tokio::spawn(print_events(Arc::clone(&session)));
    let status = tokio::spawn(print_status(Arc::clone(&session)));

    let outcome = run(&session, &args.token, RoomId(args.room)).await;

    session.dispose();
    printer.abort();
    status.abort();
    outcome
}

async fn run(session: &Arc<ChatSession>, token: &str, room_id: RoomId) -> Result<()> {
    session.connect(token).await.context("connect failed")?;
    let joined = session
        .join_room(room_id)
        .await
        .with_context(|| format!("joining room {}", room_id.0))?;
    println!(
        "joined {} ({} online)",
        joined.room_name.as_deref().unwrap_or("room"),
        session.online_users().len()
    );
    for member in session.members() {
        let role = match member.role {
            MemberRole::Owner => " (owner)",
            MemberRole::Admin => " (admin)",
            MemberRole::Member => "",
        };
        println!("  {}{role}", member.username);
    }

    session.load_initial_page().await?;
    for message in session.messages() {
        print_message(&message);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };
        match line.trim() {
            "" => continue,
            "/quit" => break,
            "/older" => match session.load_older_page().await {
                Ok(OlderPageOutcome::Loaded { added, has_older, .. }) => {
                    for message in session.messages().iter().take(added) {
                        print_message(message);
                    }
                    if !has_older {
                        println!("-- beginning of history --");
                    }
                }
                Ok(OlderPageOutcome::Exhausted) => println!("-- beginning of history --"),
                Ok(_) => {}
                Err(err) => report(&err),
            },
            "/rejoin" => match session.rejoin().await {
                Some(Ok(joined)) => println!("rejoined room {}", joined.room_id.0),
                Some(Err(err)) => report(&err),
                None => println!("nothing to rejoin"),
            },
            command if command.starts_with('/') => run_command(session, command).await,
            text => match session.send_message(text, None).await {
                Ok(message) => print_message(&message),
                Err(err) => report(&err),
            },
        }
    }
    info!("cli: leaving");
    Ok(())
}

/// `/socket <text>`, `/edit <id> <text>` and `/delete <id>`.
async fn run_command(session: &ChatSession, command: &str) {
    let (name, rest) = command.split_once(' ').unwrap_or((command, ""));
    let result = match name {
        "/socket" => session
            .send_message_over_socket(rest, None)
            .await
            .map(|message| print_message(&message)),
        "/edit" => {
            let (id, text) = rest.trim().split_once(' ').unwrap_or((rest.trim(), ""));
            match id.parse() {
                Ok(id) => session
                    .edit_message(MessageId(id), text, None)
                    .await
                    .map(|message| print_message(&message)),
                Err(_) => {
                    println!("usage: /edit <id> <text>");
                    return;
                }
            }
        }
        "/delete" => match rest.trim().parse() {
            Ok(id) => session
                .delete_message(MessageId(id))
                .await
                .map(|()| println!("(message {id} deleted)")),
            Err(_) => {
                println!("usage: /delete <id>");
                return;
            }
        },
        _ => {
            println!("unknown command {name}");
            return;
        }
    };
    if let Err(err) = result {
        report(&err);
    }
}

fn report(err: &SyncError) {
    if err.is_user_visible() {
        println!("! {err}");
    } else {
        warn!("cli: {err}");
    }
}

async fn print_events(session: Arc<ChatSession>) {
    let mut events = session.events();
    let local = session.local_user();
    loop {
        let event = events.recv().await;
        if let Ok(scoped) = &event {
            if scoped.room_id().is_some_and(|room| Some(room) != session.current_room()) {
                continue;
            }
        }
        match event {
            Ok(ServerEvent::NewMessage(message)) if message.author_id != local => {
                print_message(&message)
            }
            Ok(ServerEvent::MessageUpdated(message)) if message.author_id != local => {
                print!("(edited) ");
                print_message(&message)
            }
            Ok(ServerEvent::MessageDeleted { message_id, .. }) => {
                println!("(message {} deleted)", message_id.0)
            }
            Ok(ServerEvent::UserTyping {
                username,
                is_typing: true,
                user_id,
                ..
            }) if user_id != local => println!("{username} is typing..."),
            Ok(ServerEvent::MaxReconnectAttempts { attempts }) => {
                println!("gave up reconnecting after {attempts} attempts; type /quit")
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "cli: event printer lagged"),
            Err(RecvError::Closed) => return,
        }
    }
}

async fn print_status(session: Arc<ChatSession>) {
    let mut status = session.status();
    while status.changed().await.is_ok() {
        let state = *status.borrow_and_update();
        match state {
            ConnectionState::Connected => println!("[connected]"),
            ConnectionState::Connecting => println!("[connecting]"),
            ConnectionState::Error => println!("[connection error]"),
            ConnectionState::Disconnected => println!("[disconnected]"),
        }
    }
}

fn print_message(message: &Message) {
    let image = message
        .image_url
        .as_deref()
        .map(|url| format!(" [{url}]"))
        .unwrap_or_default();
    println!(
        "{} #{}: {}{image}",
        message.created_at.format("%H:%M"),
        message.author_id.0,
        message.content
    );
}
