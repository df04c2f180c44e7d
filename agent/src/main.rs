//! Clientdesk Agent
//!
//! Headless host for the clientdesk core: keeps a signed-in client portal
//! session alive, rings on incoming video calls and relays conversation
//! messages through a small line-oriented command loop.

mod commands;
mod config;

use anyhow::Context;
use clap::{Parser, Subcommand};
use clientdesk_core::{
    ApiClient, AudioOutput, CallEvent, ChannelKey, DraftAttachment, EventHandlers, Message,
    MessageDraft, RealtimeClient, Session, SessionGuard, SilentOutput, Subscription,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::commands::{Command, HELP};
use crate::config::AppConfig;

/// Clientdesk Agent CLI
#[derive(Parser)]
#[command(name = "clientdesk-agent")]
#[command(about = "Client portal agent: conversations and incoming video calls")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Directory holding config.json and session.json
    #[arg(short, long)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in and store the session
    Login {
        #[arg(long)]
        email: String,

        #[arg(long)]
        password: String,
    },

    /// Forget the stored session
    Logout,

    /// Connect and handle calls and messages
    Run,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let data_dir = cli.data_dir.unwrap_or_else(config::default_data_dir);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("cannot create data directory {:?}", data_dir))?;
    let config = AppConfig::load(&data_dir).context("invalid config.json")?;

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!("Starting clientdesk agent v{}", env!("CARGO_PKG_VERSION"));
    tracing::debug!("Data directory: {:?}", data_dir);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Login { email, password } => login(&config, &data_dir, &email, &password).await,
        Commands::Logout => logout(&data_dir),
        Commands::Run => run(config, &data_dir).await,
    }
}

async fn login(config: &AppConfig, data_dir: &Path, email: &str, password: &str) -> anyhow::Result<()> {
    let session = ApiClient::login(&config.client, email, password)
        .await
        .context("login failed")?;
    config::save_session(data_dir, &session)?;

    println!("Signed in as {} #{}", session.role, session.user_id);
    Ok(())
}

fn logout(data_dir: &Path) -> anyhow::Result<()> {
    if config::clear_session(data_dir)? {
        println!("Signed out");
    } else {
        println!("No stored session");
    }
    Ok(())
}

#[cfg(feature = "audio")]
fn audio_output(enabled: bool) -> Arc<dyn AudioOutput> {
    if enabled {
        Arc::new(clientdesk_core::RodioOutput::default())
    } else {
        Arc::new(SilentOutput)
    }
}

#[cfg(not(feature = "audio"))]
fn audio_output(enabled: bool) -> Arc<dyn AudioOutput> {
    if enabled {
        tracing::info!("Built without the `audio` feature, ringtone is silent");
    }
    Arc::new(SilentOutput)
}

async fn run(config: AppConfig, data_dir: &Path) -> anyhow::Result<()> {
    let Some(session) = config::load_session(data_dir)? else {
        anyhow::bail!("Not signed in. Run `clientdesk-agent login` first.");
    };

    let client = match RealtimeClient::connect(
        &config.client,
        session.clone(),
        SessionGuard::new(),
        audio_output(config.audio),
    )
    .await
    {
        Ok(client) => client,
        Err(e) if e.is_unauthorized() => return expire_session(data_dir),
        Err(e) => return Err(e).context("cannot start realtime client"),
    };

    let mut calls = client.calls().subscribe();
    let mut invalidated = client.session_invalidated();
    let _identity_printer = print_incoming(&client, ChannelKey::identity(session.user_id, session.role)).await;
    let mut conversation_printer: Option<Subscription> = None;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    println!("Connected. Type `help` for commands.");

    loop {
        tokio::select! {
            changed = invalidated.changed() => {
                if changed.is_err() || *invalidated.borrow() {
                    client.shutdown();
                    return expire_session(data_dir);
                }
            }
            event = calls.recv() => match event {
                Ok(event) => print_call_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Call events dropped");
                }
                Err(RecvError::Closed) => break,
            },
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let command = match line.parse::<Command>() {
                    Ok(command) => command,
                    Err(e) if e.is_empty() => continue,
                    Err(e) => {
                        println!("{}", e);
                        continue;
                    }
                };
                if command == Command::Quit {
                    break;
                }
                if let Command::Open(id) = &command {
                    conversation_printer = print_incoming(&client, ChannelKey::Conversation(*id)).await;
                }
                if let Err(e) = execute(&client, &session, command).await {
                    println!("! {:#}", e);
                }
            }
        }
    }

    drop(conversation_printer);
    client.shutdown();
    Ok(())
}

fn expire_session(data_dir: &Path) -> anyhow::Result<()> {
    config::clear_session(data_dir)?;
    anyhow::bail!("Session expired. Run `clientdesk-agent login` again.")
}

async fn execute(client: &RealtimeClient, session: &Session, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Accept => {
            let handoff = client.calls().accept().await?;
            println!("Joining room {} (call {})", handoff.room_id, handoff.call_id);
        }
        Command::Reject => {
            let id = client.calls().reject().await?;
            println!("Declined call {}", id);
        }
        Command::End(id) => {
            client.end_call(id).await?;
            println!("Call {} ended", id);
        }
        Command::Open(id) => {
            let messages = client.open_conversation(id).await?;
            println!("Conversation {} ({} messages)", id, messages.len());
            for message in &messages {
                print_message(message, session);
            }
        }
        Command::Send(text) => {
            let sent = client.send_message(MessageDraft::text(None, text)).await?;
            print_message(&sent.message, session);
        }
        Command::Attach { path, text } => {
            let bytes = tokio::fs::read(&path)
                .await
                .with_context(|| format!("cannot read {:?}", path))?;
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "attachment".to_string());
            let draft = MessageDraft {
                body: text,
                ..Default::default()
            }
            .with_attachment(DraftAttachment::new(file_name, bytes));
            let sent = client.send_message(draft).await?;
            print_message(&sent.message, session);
        }
        Command::Edit(id, text) => {
            let message = client.conversation().edit(id, &text).await?;
            print_message(&message, session);
        }
        Command::Delete(id) => {
            client.conversation().delete(id).await?;
            println!("Deleted message {}", id);
        }
        Command::Messages => {
            for message in client.conversation().messages() {
                print_message(&message, session);
            }
        }
        Command::Refresh => {
            client.refresh().await;
            println!("{} messages", client.conversation().messages().len());
        }
        Command::Help => println!("{}", HELP),
        Command::Quit => {}
    }
    Ok(())
}

/// Prints messages from the other party as they arrive on `key`.
async fn print_incoming(client: &RealtimeClient, key: ChannelKey) -> Option<Subscription> {
    let me = client.session().clone();
    let handlers = EventHandlers::new().on_message_sent(move |message| {
        if !message.is_from(me.user_id, me.role) {
            print_message(&message, &me);
        }
    });

    match client.notifications().subscribe(key, handlers).await {
        Ok(subscription) => Some(subscription),
        Err(e) => {
            tracing::warn!(channel = %key, error = %e, "Live message printing unavailable");
            None
        }
    }
}

fn print_call_event(event: &CallEvent) {
    match event {
        CallEvent::Ringing(call) => println!(
            "Incoming video call {} from {} (accept / reject)",
            call.id, call.initiator.name
        ),
        CallEvent::Accepted(handoff) => println!("Call {} accepted", handoff.call_id),
        CallEvent::AcceptFailed(id) => println!("Call {} could not be joined", id),
        CallEvent::Rejected(id) => println!("Call {} declined", id),
        CallEvent::Expired(id) => println!("Call {} was not answered", id),
        CallEvent::Missed(id) => println!("Missed call {}", id),
    }
}

fn print_message(message: &Message, session: &Session) {
    let who = if message.is_from(session.user_id, session.role) {
        "me".to_string()
    } else {
        format!("{} #{}", message.sender.role, message.sender.id)
    };
    let marker = if message.is_pending { " (sending)" } else { "" };
    let time = message.created_at.format("%Y-%m-%d %H:%M");

    match (&message.body, &message.attachment) {
        (Some(body), Some(a)) => println!("[{}] {}{}: {} [{}]", time, who, marker, body, a.url),
        (Some(body), None) => println!("[{}] {}{}: {}", time, who, marker, body),
        (None, Some(a)) => println!("[{}] {}{}: [{} {}]", time, who, marker, a.mime_type, a.url),
        (None, None) => println!("[{}] {}{}: (empty)", time, who, marker),
    }
}
