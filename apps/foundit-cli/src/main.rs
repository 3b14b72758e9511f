use anyhow::Context;
use clap::Parser;
use foundit_chat::{Backends, ChatConfig, ChatSession, ImageAttachment, Incoming, SessionEvent};
use foundit_store::{
    ChatStore, LocalObjectStorage, MessageRow, PresenceHub, ProfileRow, SqliteStore, StoreConfig,
};
use futures::channel::mpsc::UnboundedReceiver;
use futures::{FutureExt, StreamExt};
use std::collections::{HashMap, HashSet};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

/// Foundit Chat - conversations about lost and found items, in the terminal
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Identity to chat as
    #[arg(short, long)]
    user: String,

    /// SQLite database file
    #[arg(short, long, default_value = "foundit-chat.db")]
    db: PathBuf,

    /// Directory holding uploaded images
    #[arg(short, long, default_value = "objects")]
    objects: PathBuf,

    /// Base URL the objects directory is served from (file:// URLs when omitted)
    #[arg(long)]
    public_base: Option<Url>,
}

/// Messages shown in `history` when a conversation is opened
const HISTORY_TAIL: usize = 20;

type Session = (ChatSession, UnboundedReceiver<SessionEvent>);

/// Sessions of every identity used in this process, all sharing one store
struct Client {
    store: Arc<SqliteStore>,
    objects: Arc<LocalObjectStorage>,
    presence: PresenceHub,
    config: ChatConfig,
    sessions: HashMap<String, Session>,
    active: String,
    shown: HashSet<String>,
}

impl Client {
    async fn switch_to(&mut self, user: &str) -> anyhow::Result<()> {
        if !self.sessions.contains_key(user) {
            let backends = Backends::new(
                self.store.clone(),
                self.objects.clone(),
                self.presence.clone(),
            );
            let session = ChatSession::start(user, self.config.clone(), backends)
                .await
                .with_context(|| format!("Failed to start session for {}", user))?;
            self.sessions.insert(user.to_string(), session);
        }
        self.active = user.to_string();
        self.shown.clear();

        let (session, events) = self.active_mut()?;
        session.process_pending().await?;
        // Events queued while another identity was active are stale
        while let Some(Some(_)) = events.next().now_or_never() {}
        Ok(())
    }

    fn active(&self) -> anyhow::Result<&ChatSession> {
        self.sessions
            .get(&self.active)
            .map(|(session, _)| session)
            .context("No active session")
    }

    fn active_mut(&mut self) -> anyhow::Result<&mut Session> {
        self.sessions
            .get_mut(&self.active)
            .context("No active session")
    }
}

/// What woke the main loop
enum Step {
    Update(Incoming),
    Event(SessionEvent),
    Input(String),
    Quit,
}

fn show_help() {
    println!("\n📖 Available Commands:");
    println!("  ┌──────────────────────────────────────────────────────┐");
    println!("  │  help, ?, h                Show this help             │");
    println!("  │  profile <name>            Set your display name      │");
    println!("  │  as <user>                 Switch identity            │");
    println!("  │  chat, c <user> [user..]   Start or reopen a chat     │");
    println!("  │  list, ls                  List conversations         │");
    println!("  │  open, o <n|id>            Open a conversation        │");
    println!("  │  close                     Close the conversation     │");
    println!("  │  send, s <text>            Send a message             │");
    println!("  │  image, img <path> [..]    Send up to 5 images        │");
    println!("  │  history, hist             Show the conversation      │");
    println!("  │  react, r <n> <emoji>      React to message n         │");
    println!("  │  unreact <n>               Remove your reaction       │");
    println!("  │  delete, del <n>           Delete your message n      │");
    println!("  │  typing, t                 Signal that you are typing │");
    println!("  │  read                      Mark the chat as read      │");
    println!("  │  forget <n|id>             Delete a conversation      │");
    println!("  │  quit, exit, q             Exit                       │");
    println!("  └──────────────────────────────────────────────────────┘");
    println!("\n💡 Tips:");
    println!("  • Anything that is not a command is sent to the open conversation");
    println!("  • Message numbers are the ones shown by 'history'");
}

fn display_welcome(args: &Args) {
    println!("🎯 Foundit Chat - {}", args.user);
    println!("💾 Database: {:?}", args.db);
    println!("🖼️  Images: {:?}", args.objects);
    if let Some(base) = &args.public_base {
        println!("🌐 Served from: {}", base);
    }
    println!("\nWelcome to Foundit Chat! Type 'help' for commands.");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
}

fn conversation_title(session: &ChatSession, index: usize) -> String {
    let Some(conversation) = session.conversations().get(index) else {
        return String::new();
    };
    let names: Vec<&str> = conversation
        .others(session.me())
        .map(|m| m.display_name.as_deref().unwrap_or(&m.user_id))
        .collect();
    names.join(", ")
}

fn list_conversations(session: &ChatSession) {
    let conversations = session.conversations();
    if conversations.is_empty() {
        println!("📭 No conversations yet. Use 'chat <user>' to start one.");
        return;
    }
    println!("💬 Conversations ({} unread):", session.total_unread());
    for (i, conversation) in conversations.iter().enumerate() {
        let marker = if conversation.unread { "●" } else { " " };
        let open = if session.open_conversation_id() == Some(conversation.id.as_str()) {
            " (open)"
        } else {
            ""
        };
        println!(
            "  {} {}. {}{} - {}",
            marker,
            i + 1,
            conversation_title(session, i),
            open,
            conversation.last_message.as_deref().unwrap_or("no messages yet")
        );
    }
}

fn format_message(session: &ChatSession, index: usize, message: &MessageRow) -> String {
    let mine = message.sender_id == session.me();
    let who = if mine { "You" } else { message.sender_id.as_str() };
    let body = match ImageAttachment::from_message(message) {
        Some(image) => format!("📷 {} ({}x{})", image.url, image.width, image.height),
        None => message.content.clone(),
    };

    let mut line = format!(
        "  {}. [{}] {}: {}",
        index + 1,
        message.created_at.format("%H:%M"),
        who,
        body
    );
    if let Some(reactions) = session.reactions(&message.id) {
        for (emoji, count) in &reactions.counts {
            line.push_str(&format!(" {}{}", emoji, count));
        }
    }
    if mine {
        line.push_str(if session.is_seen_by_others(&message.id) {
            " ✓✓"
        } else {
            " ✓"
        });
    }
    line
}

fn show_history(session: &ChatSession, shown: &mut HashSet<String>) {
    let messages = session.messages();
    if messages.is_empty() {
        println!("📭 No messages yet");
    }
    let start = messages.len().saturating_sub(HISTORY_TAIL);
    for (i, message) in messages.iter().enumerate() {
        shown.insert(message.id.clone());
        if i >= start {
            println!("{}", format_message(session, i, message));
        }
    }
}

fn message_id(session: &ChatSession, arg: Option<&&str>) -> Option<String> {
    let n: usize = arg?.parse().ok()?;
    session
        .messages()
        .get(n.checked_sub(1)?)
        .map(|m| m.id.clone())
}

fn conversation_id(session: &ChatSession, arg: &str) -> Option<String> {
    if let Ok(n) = arg.parse::<usize>() {
        return session
            .conversations()
            .get(n.checked_sub(1)?)
            .map(|c| c.id.clone());
    }
    session.conversation(arg).map(|c| c.id.clone())
}

#[instrument(skip_all)]
fn handle_session_event(event: SessionEvent, session: &ChatSession, shown: &mut HashSet<String>) {
    debug!(event = ?event, "Handling session event");
    match event {
        SessionEvent::MessagesChanged => {
            for (i, message) in session.messages().iter().enumerate() {
                if shown.insert(message.id.clone()) && message.sender_id != session.me() {
                    println!("{}", format_message(session, i, message));
                }
            }
        }
        SessionEvent::TypingChanged(true) => println!("✍️  someone is typing..."),
        SessionEvent::TypingChanged(false) => {}
        SessionEvent::Notice(text) => println!("❌ {}", text),
        SessionEvent::ConversationsChanged
        | SessionEvent::ReactionsChanged
        | SessionEvent::ReadMapChanged => {}
    }
}

/// Run one command line. Returns false to quit.
#[instrument(skip(client), fields(command = input))]
async fn process_command(input: &str, client: &mut Client) -> anyhow::Result<bool> {
    let parts: Vec<&str> = input.split_whitespace().collect();
    if parts.is_empty() {
        return Ok(true);
    }

    match parts[0] {
        "help" | "?" | "h" => show_help(),
        "quit" | "exit" | "q" => {
            println!("👋 Goodbye!");
            return Ok(false);
        }
        "profile" => {
            if parts.len() < 2 {
                println!("❌ Usage: profile <display name>");
            } else {
                let display_name = parts[1..].join(" ");
                client
                    .store
                    .upsert_profile(ProfileRow {
                        user_id: client.active.clone(),
                        display_name: display_name.clone(),
                        avatar_url: None,
                    })
                    .await?;
                println!("📝 You are now shown as {}", display_name);
            }
        }
        "as" => match parts.get(1) {
            Some(user) => {
                client.switch_to(user).await?;
                println!("🔁 Now chatting as {}", user);
                list_conversations(client.active()?);
            }
            None => println!("❌ Usage: as <user>"),
        },
        "chat" | "c" => {
            if parts.len() < 2 {
                println!("❌ Usage: chat <user> [user...]");
            } else {
                let others: Vec<String> = parts[1..].iter().map(|s| s.to_string()).collect();
                let Client { sessions, active, shown, .. } = client;
                let Some((session, _)) = sessions.get_mut(active.as_str()) else {
                    return Ok(true);
                };
                if let Ok(id) = session.create_or_get_conversation(&others).await {
                    if session.open(&id).await.is_ok() {
                        println!("💬 Chatting with {}", others.join(", "));
                        show_history(session, shown);
                    }
                }
            }
        }
        "list" | "ls" => list_conversations(client.active()?),
        "open" | "o" => {
            let Client { sessions, active, shown, .. } = client;
            let Some((session, _)) = sessions.get_mut(active.as_str()) else {
                return Ok(true);
            };
            match parts.get(1).and_then(|arg| conversation_id(session, arg)) {
                Some(id) => {
                    shown.clear();
                    if session.open(&id).await.is_ok() {
                        show_history(session, shown);
                    }
                }
                None => println!("❌ Usage: open <number from 'list'>"),
            }
        }
        "close" => {
            let (session, _) = client.active_mut()?;
            if let Some(id) = session.open_conversation_id().map(str::to_string) {
                session.close(&id);
                println!("🚪 Closed conversation");
            }
        }
        "forget" => {
            let (session, _) = client.active_mut()?;
            match parts.get(1).and_then(|arg| conversation_id(session, arg)) {
                Some(id) => {
                    if session.delete_conversation(&id).await.is_ok() {
                        println!("🗑️  Conversation deleted");
                    }
                }
                None => println!("❌ Usage: forget <number from 'list'>"),
            }
        }
        "history" | "hist" => {
            let Client { sessions, active, shown, .. } = client;
            if let Some((session, _)) = sessions.get(active.as_str()) {
                show_history(session, shown);
            }
        }
        "image" | "img" => {
            let (session, _) = client.active_mut()?;
            let Some(id) = session.open_conversation_id().map(str::to_string) else {
                println!("❌ Open a conversation first");
                return Ok(true);
            };
            if parts.len() < 2 {
                println!("❌ Usage: image <path> [path...]");
                return Ok(true);
            }
            let paths: Vec<PathBuf> = parts[1..].iter().map(PathBuf::from).collect();
            info!(count = paths.len(), "Sending images");
            let results = session.send_images(&id, &paths).await;
            let sent = results.iter().filter(|r| r.is_ok()).count();
            println!("📷 Sent {} of {} images", sent, paths.len());
        }
        "react" | "r" => {
            let (session, _) = client.active_mut()?;
            match (message_id(session, parts.get(1)), parts.get(2)) {
                (Some(message_id), Some(emoji)) => {
                    let _ = session.add_reaction(&message_id, emoji).await;
                }
                _ => println!("❌ Usage: react <message number> <emoji>"),
            }
        }
        "unreact" => {
            let (session, _) = client.active_mut()?;
            match message_id(session, parts.get(1)) {
                Some(message_id) => {
                    let _ = session.remove_reaction(&message_id).await;
                }
                None => println!("❌ Usage: unreact <message number>"),
            }
        }
        "delete" | "del" => {
            let (session, _) = client.active_mut()?;
            match message_id(session, parts.get(1)) {
                Some(message_id) => match session.delete_message(&message_id).await {
                    Ok(true) => println!("🗑️  Message deleted"),
                    Ok(false) => println!("❌ You can only delete your own messages"),
                    Err(_) => {}
                },
                None => println!("❌ Usage: delete <message number>"),
            }
        }
        "typing" | "t" => client.active_mut()?.0.keystroke(),
        "read" => {
            let (session, _) = client.active_mut()?;
            if let Some(id) = session.open_conversation_id().map(str::to_string) {
                let _ = session.mark_read(&id).await;
            }
        }
        "send" | "s" => {
            let text = input
                .split_once(char::is_whitespace)
                .map(|(_, rest)| rest)
                .unwrap_or_default();
            send_text(client, text).await?;
        }
        _ => send_text(client, input).await?,
    }
    Ok(true)
}

async fn send_text(client: &mut Client, text: &str) -> anyhow::Result<()> {
    let Client { sessions, active, shown, .. } = client;
    let Some((session, _)) = sessions.get_mut(active.as_str()) else {
        return Ok(());
    };
    let Some(id) = session.open_conversation_id().map(str::to_string) else {
        println!("❓ Unknown command. Open a conversation to send messages, or type 'help'.");
        return Ok(());
    };
    if let Ok(message) = session.send_text(&id, text).await {
        shown.insert(message.id);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();

    let args = Args::parse();
    tokio::fs::create_dir_all(&args.objects).await?;

    info!("Opening store at {:?}", args.db);
    let store = Arc::new(
        SqliteStore::new(StoreConfig {
            db_path: args.db.clone(),
            ..Default::default()
        })
        .await?,
    );
    let mut objects = LocalObjectStorage::new(args.objects.clone());
    if let Some(base) = args.public_base.clone() {
        objects = objects.with_public_base(base);
    }

    let mut client = Client {
        store,
        objects: Arc::new(objects),
        presence: PresenceHub::default(),
        config: ChatConfig::default(),
        sessions: HashMap::new(),
        active: String::new(),
        shown: HashSet::new(),
    };
    client.switch_to(&args.user).await?;

    display_welcome(&args);
    list_conversations(client.active()?);

    // Spawn a simple stdin reader that forwards lines via a channel
    let (stdin_sender, mut stdin_receiver) = tokio::sync::mpsc::unbounded_channel::<String>();
    let stdin_handle = tokio::spawn(async move {
        use tokio::io::{AsyncBufReadExt, BufReader};
        let mut stdin = BufReader::new(tokio::io::stdin());
        let mut line = String::new();

        loop {
            line.clear();
            match stdin.read_line(&mut line).await {
                Ok(0) => break, // EOF
                Ok(_) => {
                    let line = line.trim().to_string();
                    if !line.is_empty() && stdin_sender.send(line).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    info!("Starting main event loop");
    loop {
        print!("> ");
        let _ = io::stdout().flush();

        let step = {
            let (session, events) = client.active_mut()?;
            tokio::select! {
                incoming = session.recv_update() => Step::Update(incoming),
                Some(event) = events.next() => Step::Event(event),
                Some(input) = stdin_receiver.recv() => Step::Input(input),
                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl+C, initiating shutdown");
                    println!("\n👋 Goodbye!");
                    Step::Quit
                }
            }
        };

        match step {
            // Applied outside the select so no other branch can cut it short
            Step::Update(incoming) => match client.active_mut()?.0.apply_update(incoming).await {
                Ok(()) => debug!("Applied remote change"),
                Err(foundit_chat::ChatError::Disconnected) => {
                    error!("Change feed closed, exiting");
                    break;
                }
                Err(e) => warn!("Remote change failed to apply: {}", e),
            },
            Step::Event(event) => {
                let Client { sessions, active, shown, .. } = &mut client;
                if let Some((session, _)) = sessions.get(active.as_str()) {
                    handle_session_event(event, session, shown);
                }
            }
            Step::Input(input) => match process_command(&input, &mut client).await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => error!(error = %e, "Command failed"),
            },
            Step::Quit => break,
        }
    }

    info!("Cleaning up resources");
    stdin_handle.abort();
    Ok(())
}
