use anyhow::Result;
use chat_core::{ChatEvent, ChatSession, HttpChatBackend};
use clap::Parser;
use shared::domain::UserId;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;

#[derive(Parser, Debug)]
struct Args {
    /// Backend base url; overrides chat.toml / CHAT_SERVER_URL.
    #[arg(long)]
    server_url: Option<String>,
    /// User to connect as; overrides chat.toml / CHAT_USER_ID.
    #[arg(long)]
    user_id: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let mut settings = config::load_settings();
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }
    if let Some(user_id) = args.user_id {
        settings.user_id = Some(user_id);
    }
    let Some(user_id) = settings.user_id else {
        anyhow::bail!("no user id: pass --user-id or set CHAT_USER_ID");
    };
    let user_id = UserId::new(user_id);

    let backend = HttpChatBackend::new(&settings.server_url)?;
    let session = ChatSession::new(backend);
    let mut events = session.subscribe_events();
    session.connect(&user_id).await?;
    info!(user_id = %user_id, "connected; watching conversations");

    for conversation in session.conversations().await {
        println!(
            "{}  unread={}  {}",
            conversation.conversation_id,
            conversation.unread_count,
            conversation.display_title(&user_id)
        );
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(ChatEvent::MessageAppended { message }) => {
                    println!(
                        "[{}] {}: {}",
                        message.message.conversation_id,
                        message.message.sender_name.as_deref().unwrap_or("?"),
                        message.message.content
                    );
                }
                Ok(ChatEvent::TypingChanged { conversation_id, typists }) if !typists.is_empty() => {
                    let names: Vec<&str> = typists
                        .iter()
                        .map(|typist| typist.user_name.as_str())
                        .collect();
                    println!("[{conversation_id}] typing: {}", names.join(", "));
                }
                Ok(ChatEvent::Error(message)) => eprintln!("backend error: {message}"),
                Ok(_) => {}
                Err(_) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.disconnect().await;
    Ok(())
}
