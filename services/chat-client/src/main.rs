//! Chat session client
//!
//! Interactive terminal front end over `SessionFacade`:
//! 1. Loads config and seeds the renewal credential if one is configured
//! 2. Restores a session silently when the renewal cookie is valid
//! 3. Reads commands from stdin (`help` lists them)
//! 4. Prints inbound messages as they arrive

mod config;
mod conversation;
mod error;
mod facade;
mod metrics;

use std::sync::Arc;

use anyhow::{Context, Result};
use chat_auth::{CredentialStore, Identity};
use chat_channel::{Message, SessionEvent, WsConnector};
use reqwest::cookie::Jar;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::error::ClientError;
use crate::facade::SessionFacade;

const HELP: &str = "\
commands:
  login              print the login URL
  token <url>        finish login with the redirect URL
  enter <user-id>    open the conversation with a user
  send <text>        send a message
  reconnect          re-establish the channel
  disconnect         leave the channel
  logout             end the session
  whoami             show the logged-in identity
  history            show the message log
  status             show the connection state
  quit               exit";

/// One line of user input.
#[derive(Debug, PartialEq, Eq)]
enum Input {
    Login,
    Token(String),
    Enter(i64),
    Send(String),
    Reconnect,
    Disconnect,
    Logout,
    WhoAmI,
    History,
    Status,
    Help,
    Quit,
}

impl Input {
    fn parse(line: &str) -> std::result::Result<Option<Self>, String> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let (command, rest) = match line.split_once(char::is_whitespace) {
            Some((command, rest)) => (command, rest.trim()),
            None => (line, ""),
        };
        let input = match command {
            "login" => Self::Login,
            "token" if !rest.is_empty() => Self::Token(rest.to_string()),
            "token" => return Err("usage: token <redirect-url>".into()),
            "enter" => Self::Enter(
                rest.parse()
                    .map_err(|_| "usage: enter <user-id>".to_string())?,
            ),
            "send" => Self::Send(rest.to_string()),
            "reconnect" => Self::Reconnect,
            "disconnect" => Self::Disconnect,
            "logout" => Self::Logout,
            "whoami" => Self::WhoAmI,
            "history" => Self::History,
            "status" => Self::Status,
            "help" | "?" => Self::Help,
            "quit" | "exit" => Self::Quit,
            other => return Err(format!("unknown command '{other}', try 'help'")),
        };
        Ok(Some(input))
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Logs go to stderr so they never interleave with the conversation
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    info!("starting chat-client");

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    let base = config.base_url()?;
    let ws_url = config.ws_url()?;
    info!(
        base_url = %base,
        ws_url = %ws_url,
        persisted = config.session.access_token_path.is_some(),
        "configuration loaded"
    );

    if let Some(addr) = config.metrics.listen_addr {
        let handle = metrics::install_recorder().context("failed to install metrics recorder")?;
        metrics::serve(addr, handle)
            .await
            .with_context(|| format!("failed to bind metrics listener on {addr}"))?;
    }

    let jar = Arc::new(Jar::default());
    let store = match &config.session.access_token_path {
        Some(path) => CredentialStore::load(path.clone(), jar.clone(), base.clone())
            .await
            .with_context(|| format!("failed to load access credential from {}", path.display()))?,
        None => CredentialStore::ephemeral(jar.clone(), base.clone()),
    };
    let store = Arc::new(store);
    if let Some(token) = &config.session.refresh_token {
        store.seed_renewal_credential(token);
    }

    let client = chat_auth::build_client(jar, config.timeout())?;
    let connector = Arc::new(WsConnector::new(ws_url, config.heartbeat()));
    let (facade, events) = SessionFacade::new(
        base,
        client,
        store,
        connector,
        config.session_config()?,
    );

    facade.initialize(None).await?;
    match facade.identity().borrow().as_ref() {
        Some(identity) => println!("logged in as {}", describe(identity)),
        None => println!("not logged in; type 'login'"),
    }

    tokio::spawn(print_events(events, facade.identity()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("reading stdin")?,
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT, shutting down");
                None
            }
        };
        let Some(line) = line else { break };

        match Input::parse(&line) {
            Ok(Some(Input::Quit)) => break,
            Ok(Some(input)) => {
                if let Err(e) = run(&facade, input).await {
                    println!("error: {e}");
                    if e.needs_login() {
                        println!("session expired; type 'login'");
                    }
                }
            }
            Ok(None) => {}
            Err(usage) => println!("{usage}"),
        }
    }

    facade.disconnect().await;
    info!("shutdown complete");
    Ok(())
}

async fn run(facade: &SessionFacade, input: Input) -> std::result::Result<(), ClientError> {
    match input {
        Input::Login => {
            println!("open in a browser, then paste the redirect with 'token <url>':");
            println!("  {}", facade.login()?);
        }
        Input::Token(url) => {
            facade.initialize(Some(&url)).await?;
            match facade.identity().borrow().as_ref() {
                Some(identity) => println!("logged in as {}", describe(identity)),
                None => println!("no token in that URL"),
            }
        }
        Input::Enter(user_id) => {
            let conversation = facade.enter_conversation(user_id).await?;
            println!(
                "conversation {} with user {user_id} ({} earlier messages)",
                conversation.channel_id,
                conversation.messages.len()
            );
        }
        Input::Send(text) => facade.send_message(&text).await?,
        Input::Reconnect => facade.reconnect().await?,
        Input::Disconnect => facade.disconnect().await,
        Input::Logout => {
            facade.logout().await?;
            println!("logged out");
        }
        Input::WhoAmI => match facade.identity().borrow().as_ref() {
            Some(identity) => println!("{}", describe(identity)),
            None => println!("not logged in"),
        },
        Input::History => {
            let own = own_id(&facade.identity());
            for message in facade.messages().await {
                println!("{}", format_message(&message, own.as_deref()));
            }
        }
        Input::Status => {
            let conversation = facade.conversation().await;
            println!(
                "{} {}",
                *facade.connection_state().borrow(),
                conversation
                    .map(|c| format!("(conversation {})", c.channel_id))
                    .unwrap_or_default()
            );
        }
        Input::Help => println!("{HELP}"),
        Input::Quit => {}
    }
    Ok(())
}

/// Print channel events until the session goes away.
async fn print_events(
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    identity: watch::Receiver<Option<Identity>>,
) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Subscribed { channel_id } => println!("-- joined conversation {channel_id}"),
            SessionEvent::Message { message, .. } => {
                println!("{}", format_message(&message, own_id(&identity).as_deref()));
            }
            SessionEvent::AuthFailed => {
                warn!("channel authentication failed");
                println!("-- session expired; type 'login'");
            }
            SessionEvent::Disconnected => println!("-- connection lost"),
        }
    }
}

fn own_id(identity: &watch::Receiver<Option<Identity>>) -> Option<String> {
    identity.borrow().as_ref().and_then(|i| i.user_id.clone())
}

fn describe(identity: &Identity) -> String {
    let name = identity
        .nickname
        .as_deref()
        .or(identity.email.as_deref())
        .unwrap_or("unknown user");
    match &identity.user_id {
        Some(id) => format!("{name} (id {id})"),
        None => name.to_string(),
    }
}

/// `[time] sender: content`, with `me` for the user's own messages.
fn format_message(message: &Message, own_id: Option<&str>) -> String {
    let sender_id = message.sender_id.map(|id| id.to_string());
    let sender = if sender_id.is_some() && sender_id.as_deref() == own_id {
        "me".to_string()
    } else {
        match (&message.nickname, &sender_id) {
            (Some(nickname), _) => nickname.clone(),
            (None, Some(id)) => format!("user {id}"),
            (None, None) => "unknown".to_string(),
        }
    };
    match &message.created_at {
        Some(at) => format!("[{at}] {sender}: {}", message.content),
        None => format!("{sender}: {}", message.content),
    }
}
