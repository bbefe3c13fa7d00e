use std::env;
use std::sync::Arc;

use log::{info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::{Instant, sleep_until};

use chatsync::api::events::ClientEvent;
use chatsync::auth::{self, AuthProvider, JwtAuthProvider, StaticToken};
use chatsync::geo::{FixedPosition, GeolocationProvider, NoGeolocation};
use chatsync::utils::format_timestamp;
use chatsync::{ChatEngine, ChatError, HttpHistoryService, Result, Settings};

const HELP: &str = "\
commands:
  /list                 conversations, most recent first
  /open <peer>          focus a conversation and load its history
  /to <peer> <text>     start a conversation with <peer>
  /name <peer> <name>   set a display name
  /click [id]           open the conversation behind an alert
  /reconnect            reconnect to the broker
  /quit
anything else is sent to the open conversation";

/// Resolves credentials from the environment first, then the config file.
fn credentials(settings: &Settings) -> Result<(Arc<dyn AuthProvider>, String)> {
    let token = env::var("CHATSYNC_TOKEN").ok().or_else(|| settings.token.clone()).unwrap_or_default();
    let user = env::var("CHATSYNC_USER").ok().or_else(|| settings.user_id.clone());

    if let Ok(claims) = auth::decode_claims(&token) {
        let me = user.unwrap_or(claims.sub);
        return Ok((Arc::new(JwtAuthProvider::new(token)), me));
    }
    let me = user.ok_or_else(|| {
        ChatError::Config("user_id (or CHATSYNC_USER) is required when the token is not a JWT".into())
    })?;
    Ok((Arc::new(StaticToken::new(token)), me))
}

pub fn build_engine(settings: &Settings) -> Result<ChatEngine> {
    let (auth, me) = credentials(settings)?;
    let history = Arc::new(HttpHistoryService::new(
        &settings.api.base_url,
        settings.api.timeout(),
        auth.clone(),
    )?);
    let geolocation: Arc<dyn GeolocationProvider> = match settings.geolocation.fixed_position() {
        Some((lat, lon)) => Arc::new(FixedPosition::new(lat, lon)),
        None => Arc::new(NoGeolocation),
    };
    Ok(ChatEngine::new(settings, me, auth, history, geolocation))
}

pub async fn run(settings: Settings) -> Result<()> {
    let mut engine = build_engine(&settings)?;

    match engine.connect().await {
        Ok(()) => {}
        Err(e) if e.is_transient() => warn!("{}; retrying in the background", e),
        Err(e) => return Err(e),
    }
    if let Err(e) = engine.bootstrap().await {
        warn!("Could not load conversations: {}", e);
    }
    println!("{}", HELP);
    print_conversations(&engine);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let deadline = engine.notifications().next_deadline();
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if !handle_line(&mut engine, line.trim()).await {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("stdin closed: {}", e);
                    break;
                }
            },
            event = engine.next_event() => match event {
                Some(event) => render_event(&event),
                None => break,
            },
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                engine.notifications_mut().sweep(Instant::now());
            },
        }
    }

    engine.disconnect();
    info!("Bye");
    Ok(())
}

/// Returns `false` when the user asked to quit.
async fn handle_line(engine: &mut ChatEngine, line: &str) -> bool {
    if line.is_empty() {
        return true;
    }
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();

    let result = match command {
        "/quit" => return false,
        "/help" => {
            println!("{}", HELP);
            Ok(())
        }
        "/list" => {
            print_conversations(engine);
            Ok(())
        }
        "/open" => engine.open_conversation(rest).await.map(|()| print_open(engine)),
        "/to" => match rest.split_once(' ') {
            Some((peer, text)) => engine.start_conversation(peer, text).await.map(|_| print_open(engine)),
            None => Err(ChatError::Validation("usage: /to <peer> <text>".into())),
        },
        "/name" => match rest.split_once(' ') {
            Some((peer, name)) if engine.store_mut().set_display_name(peer, name) => Ok(()),
            _ => Err(ChatError::Validation("usage: /name <known peer> <name>".into())),
        },
        "/click" => click(engine, rest).await,
        "/reconnect" => engine.connect().await,
        _ if command.starts_with('/') => Err(ChatError::Validation(format!("unknown command {}", command))),
        _ => match engine.store().open_peer().map(str::to_string) {
            Some(peer) => engine.send(&peer, line).await.map(|_| ()),
            None => Err(ChatError::Validation("open a conversation first (/open <peer>)".into())),
        },
    };

    if let Err(e) = result {
        println!("! {}", e);
    }
    true
}

async fn click(engine: &mut ChatEngine, arg: &str) -> Result<()> {
    let id = if arg.is_empty() {
        let now = Instant::now();
        engine.notifications().active(now).last().map(|(n, _)| n.id)
    } else {
        arg.parse::<u64>().ok()
    };
    let Some(id) = id else {
        return Err(ChatError::Validation("no such alert".into()));
    };
    match engine.activate_notification(id).await? {
        Some(_) => print_open(engine),
        None => println!("alert {} already gone", id),
    }
    Ok(())
}

fn render_event(event: &ClientEvent) {
    match event {
        ClientEvent::ConnectionChanged(state) => println!("* {}", state),
        ClientEvent::MessageReceived {
            message,
            notification,
            appended,
            ..
        } => {
            if *appended {
                println!("[{}] {}: {}", format_timestamp(&message.sent_at), notification.display_name, message.content);
            } else {
                println!("(alert {}) {}: {}", notification.id, notification.display_name, notification.text);
            }
        }
    }
}

fn print_conversations(engine: &ChatEngine) {
    let conversations = engine.store().conversations();
    if conversations.is_empty() {
        println!("no conversations yet");
    }
    for conversation in conversations {
        let unread = match conversation.unread_count {
            0 => String::new(),
            n => format!(" ({} unread)", n),
        };
        println!(
            "{} [{}]{}: {}",
            conversation.display_name,
            conversation.peer_id,
            unread,
            conversation.last_message.as_deref().unwrap_or("")
        );
    }
}

fn print_open(engine: &ChatEngine) {
    let store = engine.store();
    let Some(peer) = store.open_peer() else {
        return;
    };
    println!("--- {} ---", store.display_name(peer));
    for message in store.messages() {
        let who = if message.sender_id == store.me() { "you".to_string() } else { store.display_name(&message.sender_id) };
        println!("[{}] {}: {}", format_timestamp(&message.sent_at), who, message.content);
    }
}
