use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use client_core::{
    load_settings, ChatClient, ClientEvent, ConversationView, NoticeLevel, PresenceSnapshot,
};
use shared::{
    domain::{ConversationKey, ServerId, UserId},
    protocol::ChatMessage,
};
use tokio::{sync::broadcast, time::timeout};
use tracing::info;
use tracing_subscriber::EnvFilter;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "chat-terminal", about = "Terminal front-end for the chat service")]
struct Cli {
    /// Overrides `server_url` from client.toml and the environment.
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long, env = "CHAT_EMAIL")]
    email: String,
    #[arg(long, env = "CHAT_PASSWORD", hide_env_values = true)]
    password: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct Target {
    /// Direct conversation with this user id.
    #[arg(long)]
    dm: Option<String>,
    /// Server conversation.
    #[arg(long)]
    server: Option<String>,
}

impl Target {
    fn key(&self) -> Result<ConversationKey> {
        match (&self.dm, &self.server) {
            (Some(peer), None) => Ok(ConversationKey::Direct {
                peer: UserId::new(peer.as_str()),
            }),
            (None, Some(server_id)) => Ok(ConversationKey::Server {
                server_id: ServerId::new(server_id.as_str()),
            }),
            _ => Err(anyhow!("exactly one of --dm or --server is required")),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    Whoami,
    Search {
        name: String,
    },
    AddFriend {
        user_id: String,
    },
    Accept {
        user_id: String,
    },
    History {
        #[command(flatten)]
        target: Target,
        #[arg(long, default_value_t = 1)]
        pages: u32,
    },
    Send {
        #[command(flatten)]
        target: Target,
        text: String,
    },
    CreateServer {
        name: String,
    },
    ServerInfo {
        server_id: String,
    },
    AddMember {
        server_id: String,
        user_id: String,
    },
    Promote {
        server_id: String,
        user_id: String,
    },
    Kick {
        server_id: String,
        user_id: String,
    },
    /// Prints messages, presence and notices until interrupted.
    Watch,
    ResendConfirmation,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();
    let cli = Cli::parse();

    let mut settings = load_settings();
    if let Some(server_url) = cli.server_url.clone() {
        settings = settings.with_server_url(server_url);
    }
    info!(server_url = %settings.server_url, "terminal: starting");
    let client = ChatClient::new(settings)?;

    let Cli {
        email,
        password,
        command,
        ..
    } = cli;
    let mut events = client.subscribe_events();
    if !matches!(command, Command::ResendConfirmation) {
        client.start().await;
        client.login(&email, &password).await?;
    }
    let result = run(&client, &mut events, (&email, &password), command).await;
    client.shutdown().await;
    result
}

async fn run(
    client: &ChatClient,
    events: &mut broadcast::Receiver<ClientEvent>,
    (email, password): (&str, &str),
    command: Command,
) -> Result<()> {
    match command {
        Command::Whoami => {
            let profile = client.refresh_profile().await?;
            println!("{} <{}> id={}", profile.display_name(), profile.email, profile.id);
            for friend in &profile.friends {
                println!("  friend {} <{}>", friend.name, friend.email);
            }
            for request in &profile.friend_requests {
                println!("  pending request from {} <{}>", request.name, request.email);
            }
            for server in &profile.servers {
                println!("  server {} id={}", server.server_name, server.id);
            }
        }
        Command::Search { name } => {
            let people = client.search_people(&name).await?;
            println!("{}", serde_json::to_string_pretty(&people)?);
        }
        Command::AddFriend { user_id } => {
            wait_for_realtime(events).await?;
            client.send_friend_request(&UserId::new(user_id)).await?;
            print_pending_notices(events);
        }
        Command::Accept { user_id } => {
            client.accept_friend_request(&UserId::new(user_id)).await?;
            print_pending_notices(events);
        }
        Command::History { target, pages } => {
            let mut view = open_view(client, &target).await?;
            for _ in 0..pages.max(1) {
                view.load_next_page().await?;
                if !view.has_more() {
                    break;
                }
            }
            for message in view.entries() {
                print_message(message);
            }
        }
        Command::Send { target, text } => {
            wait_for_realtime(events).await?;
            let mut view = open_view(client, &target).await?;
            let id = view.send(&text).await?;
            println!("sent ({id})");
        }
        Command::CreateServer { name } => {
            let response = client.create_server(&name).await?;
            if let Some(server) = response.server {
                println!("created {} id={}", server.server_name, server.id);
            }
        }
        Command::ServerInfo { server_id } => {
            let info = client.get_server_info(&ServerId::new(server_id)).await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        Command::AddMember { server_id, user_id } => {
            wait_for_realtime(events).await?;
            client
                .add_people_to_server(&ServerId::new(server_id), &UserId::new(user_id))
                .await?;
            print_pending_notices(events);
        }
        Command::Promote { server_id, user_id } => {
            client
                .promote_to_admin(&ServerId::new(server_id), &UserId::new(user_id))
                .await?;
            print_pending_notices(events);
        }
        Command::Kick { server_id, user_id } => {
            client
                .kick_people(&ServerId::new(server_id), &UserId::new(user_id))
                .await?;
            print_pending_notices(events);
        }
        Command::Watch => watch(events).await?,
        Command::ResendConfirmation => {
            let redirect = client
                .session()
                .resend_confirmation(email, password)
                .await?;
            print_pending_notices(events);
            if let Some(redirect) = redirect {
                println!("continue at {redirect}");
            }
        }
    }
    Ok(())
}

async fn open_view(client: &ChatClient, target: &Target) -> Result<ConversationView> {
    if client.profile().await.is_none() {
        client.refresh_profile().await?;
    }
    Ok(client.open_conversation(target.key()?).await?)
}

async fn wait_for_realtime(events: &mut broadcast::Receiver<ClientEvent>) -> Result<()> {
    timeout(CONNECT_TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(ClientEvent::RealtimeConnected) => return Ok(()),
                Ok(ClientEvent::Error(message)) => return Err(anyhow!(message)),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(anyhow!("client stopped before realtime connected"))
                }
            }
        }
    })
    .await
    .context("timed out waiting for the realtime connection")?
}

async fn watch(events: &mut broadcast::Receiver<ClientEvent>) -> Result<()> {
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            event = events.recv() => match event {
                Ok(event) => render_event(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    eprintln!("(skipped {skipped} events)");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            },
        }
    }
}

fn print_pending_notices(events: &mut broadcast::Receiver<ClientEvent>) {
    while let Ok(event) = events.try_recv() {
        if let ClientEvent::Notice(_) = event {
            render_event(&event);
        }
    }
}

fn render_event(event: &ClientEvent) {
    match event {
        ClientEvent::Notice(notice) => {
            let tag = match notice.level {
                NoticeLevel::Success => "ok",
                NoticeLevel::Info => "info",
                NoticeLevel::Error => "error",
            };
            println!("[{tag}] {}", notice.text);
        }
        ClientEvent::PrivateMessage(message) | ClientEvent::ServerMessage(message) => {
            print_message(message)
        }
        ClientEvent::PresenceChanged(snapshot) => print_presence(snapshot),
        ClientEvent::RealtimeConnected => println!("[realtime] connected"),
        ClientEvent::RealtimeDisconnected => println!("[realtime] disconnected"),
        ClientEvent::Error(message) => eprintln!("[error] {message}"),
        ClientEvent::Session(_) | ClientEvent::ProfileUpdated(_) => {}
    }
}

fn print_message(message: &ChatMessage) {
    let when = message
        .sort_time()
        .map(|time| time.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "N/A".to_string());
    let sender = message
        .sender_name
        .as_deref()
        .or(message.sender_id.as_ref().map(UserId::as_str))
        .unwrap_or("?");
    println!("{when} {sender}: {}", message.body);
}

fn print_presence(snapshot: &PresenceSnapshot) {
    let names = |friends: &[shared::protocol::Friend]| {
        friends
            .iter()
            .map(|friend| friend.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    };
    println!(
        "[presence] online: {} | offline: {}",
        names(&snapshot.online),
        names(&snapshot.offline)
    );
}
