use quickchat::api::{LoginCredentials, ProfilePatch, SignupCredentials};
use quickchat::bus::{Event, NotificationLevel};
use quickchat::chat::{self, Message, MessageContent};
use quickchat::conversation::Phase;
use quickchat::entity::PeerId;
use quickchat::ChatClient;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error};

const HELP: &str = "\
Commands:
  /login <email> <password>          Sign in
  /signup <email> <password> <name>  Create an account
  /logout                            Sign out
  /whoami                            Show the signed-in profile
  /peers [query]                     List peers, optionally filtered by name
  /open <name or id>                 Open a conversation
  /close                             Back to the peer list
  /image <path>                      Send an image file
  /media                             Show recent images in this conversation
  /name <display name>               Change your display name
  /bio <text>                        Change your bio
  /avatar <path>                     Change your avatar
  /help                              Show this text
Anything else is sent as a message to the open conversation.";

#[derive(Debug, Clone, PartialEq)]
enum Command {
    Help,
    Login { email: String, password: String },
    Signup { email: String, password: String, name: String },
    Logout,
    Whoami,
    Peers(String),
    Open(String),
    Close,
    Image(PathBuf),
    Media,
    Name(String),
    Bio(String),
    Avatar(PathBuf),
    Say(String),
}

impl Command {
    /// `Ok(None)` for blank lines; `Err` carries a usage hint.
    fn parse(line: &str) -> Result<Option<Command>, String> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Ok(Some(Command::Say(line.to_string())));
        };

        let (name, args) = match rest.split_once(char::is_whitespace) {
            Some((name, args)) => (name, args.trim()),
            None => (rest, ""),
        };

        let command = match name.to_lowercase().as_str() {
            "help" => Command::Help,
            "login" => {
                let mut parts = args.split_whitespace();
                match (parts.next(), parts.next()) {
                    (Some(email), Some(password)) => Command::Login {
                        email: email.to_string(),
                        password: password.to_string(),
                    },
                    _ => return Err("Usage: /login <email> <password>".to_string()),
                }
            }
            "signup" => {
                let mut parts = args.splitn(3, char::is_whitespace);
                match (parts.next(), parts.next(), parts.next()) {
                    (Some(email), Some(password), Some(name)) if !name.trim().is_empty() => {
                        Command::Signup {
                            email: email.to_string(),
                            password: password.to_string(),
                            name: name.trim().to_string(),
                        }
                    }
                    _ => return Err("Usage: /signup <email> <password> <name>".to_string()),
                }
            }
            "logout" => Command::Logout,
            "whoami" => Command::Whoami,
            "peers" => Command::Peers(args.to_string()),
            "open" if !args.is_empty() => Command::Open(args.to_string()),
            "open" => return Err("Usage: /open <name or id>".to_string()),
            "close" => Command::Close,
            "image" if !args.is_empty() => Command::Image(PathBuf::from(args)),
            "image" => return Err("Usage: /image <path>".to_string()),
            "media" => Command::Media,
            "name" if !args.is_empty() => Command::Name(args.to_string()),
            "name" => return Err("Usage: /name <display name>".to_string()),
            "bio" => Command::Bio(args.to_string()),
            "avatar" if !args.is_empty() => Command::Avatar(PathBuf::from(args)),
            "avatar" => return Err("Usage: /avatar <path>".to_string()),
            other => return Err(format!("Unknown command /{}. Try /help", other)),
        };
        Ok(Some(command))
    }
}

/// Line-oriented front end on stdin/stdout.
pub struct ConsoleInterface {
    client: Arc<ChatClient>,
}

impl ConsoleInterface {
    pub fn new(client: Arc<ChatClient>) -> Self {
        Self { client }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let renderer = tokio::spawn(render_events(self.client.clone()));

        println!("Type /help for commands.");
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            match Command::parse(&line) {
                Ok(Some(command)) => self.execute(command).await,
                Ok(None) => {}
                Err(usage) => println!("{}", usage),
            }
        }

        renderer.abort();
        Ok(())
    }

    async fn execute(&self, command: Command) {
        let client = &self.client;
        debug!("Console command: {:?}", command);

        // Failures are reported through bus notifications; the results
        // here only decide what else to print.
        match command {
            Command::Help => println!("{}", HELP),
            Command::Login { email, password } => {
                let _ = client.login(&LoginCredentials { email, password }).await;
            }
            Command::Signup {
                email,
                password,
                name,
            } => {
                let credentials = SignupCredentials {
                    full_name: name,
                    email,
                    password,
                    bio: None,
                };
                let _ = client.signup(&credentials).await;
            }
            Command::Logout => client.logout().await,
            Command::Whoami => match client.session().identity().await {
                Some(identity) => {
                    println!("{} ({})", identity.display_name, identity.id);
                    if let Some(bio) = identity.bio {
                        println!("  {}", bio);
                    }
                }
                None => println!("Not signed in."),
            },
            Command::Peers(query) => {
                let unseen = client.directory().unseen_counts().await;
                let peers = client.peers(&query).await;
                if peers.is_empty() {
                    println!("No peers found.");
                }
                for view in peers {
                    let status = if view.online { "online" } else { "offline" };
                    match unseen.get(&view.peer.id) {
                        Some(count) => println!("  {} [{}] ({} new)", view.peer, status, count),
                        None => println!("  {} [{}]", view.peer, status),
                    }
                }
            }
            Command::Open(target) => self.open(&target).await,
            Command::Close => client.conversation().deselect().await,
            Command::Image(path) => match chat::image_data_url_from_file(&path).await {
                Ok(data_url) => {
                    let _ = client.conversation().send_image(data_url).await;
                }
                Err(e) => println!("{}", e.user_message()),
            },
            Command::Media => {
                let gallery = client.conversation().media_gallery().await;
                if gallery.is_empty() {
                    println!("No media yet.");
                }
                for (i, image) in gallery.iter().enumerate() {
                    println!("  {}. {}", i + 1, abbreviate(image));
                }
            }
            Command::Name(name) => {
                let patch = ProfilePatch {
                    full_name: Some(name),
                    ..ProfilePatch::default()
                };
                let _ = client.update_profile(&patch).await;
            }
            Command::Bio(bio) => {
                let patch = ProfilePatch {
                    bio: Some(bio),
                    ..ProfilePatch::default()
                };
                let _ = client.update_profile(&patch).await;
            }
            Command::Avatar(path) => match chat::image_data_url_from_file(&path).await {
                Ok(data_url) => {
                    let patch = ProfilePatch {
                        avatar: Some(data_url),
                        ..ProfilePatch::default()
                    };
                    let _ = client.update_profile(&patch).await;
                }
                Err(e) => println!("{}", e.user_message()),
            },
            Command::Say(text) => {
                if client.conversation().selected().await.is_none() {
                    println!("Open a conversation first: /open <name>");
                    return;
                }
                let _ = client.conversation().send_text(text).await;
            }
        }
    }

    async fn open(&self, target: &str) {
        let client = &self.client;
        let by_id = client.directory().peer(&PeerId::new(target)).await;
        let peer = match by_id {
            Some(peer) => peer,
            None => {
                let mut matches = client.peers(target).await;
                match matches.len() {
                    0 => {
                        println!("No peer matches '{}'.", target);
                        return;
                    }
                    1 => matches.remove(0).peer,
                    _ => {
                        println!("'{}' is ambiguous:", target);
                        for view in matches {
                            println!("  {}", view.peer);
                        }
                        return;
                    }
                }
            }
        };

        let online = client.session().is_online(&peer.id).await;
        println!(
            "--- {} ({}) ---",
            peer.display_name,
            if online { "online" } else { "offline" }
        );
        if let Some(bio) = &peer.bio {
            println!("    {}", bio);
        }
        let _ = client.conversation().select(peer).await;
    }
}

/// Print notifications and newly visible messages as they happen.
async fn render_events(client: Arc<ChatClient>) {
    let mut events = client.bus().subscribe();
    let mut shown = 0usize;

    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                debug!("Renderer skipped {} events", skipped);
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        match event {
            Event::Notification { level, message } => {
                let tag = match level {
                    NotificationLevel::Info => "info",
                    NotificationLevel::Warning => "warn",
                    NotificationLevel::Error => "error",
                    NotificationLevel::Success => "ok",
                };
                println!("[{}] {}", tag, message);
            }
            Event::UnseenChanged { peer, count } if count > 0 => {
                let name = client
                    .directory()
                    .peer(&peer)
                    .await
                    .map(|p| p.display_name)
                    .unwrap_or_else(|| peer.to_string());
                println!("* {} new message(s) from {}", count, name);
            }
            Event::ConversationChanged => {
                let conversation = client.conversation();
                if let Phase::LoadingHistory(_) = conversation.phase().await {
                    shown = 0;
                    continue;
                }
                let messages = conversation.messages().await;
                if messages.len() < shown {
                    shown = 0;
                }
                let me = client.session().identity().await.map(|i| i.id);
                for message in &messages[shown..] {
                    println!("{}", format_message(message, me.as_ref()));
                }
                shown = messages.len();
            }
            Event::ConnectionChanged { connected } => {
                if connected {
                    println!("[ok] Live updates restored");
                } else {
                    println!("[warn] Live updates interrupted, reconnecting...");
                }
            }
            Event::SessionChanged => {
                shown = 0;
            }
            _ => {}
        }
    }
    error!("Event bus closed, renderer stopped");
}

fn format_message(message: &Message, me: Option<&PeerId>) -> String {
    let who = if me == Some(&message.sender_id) {
        "you".to_string()
    } else {
        message.sender_id.to_string()
    };
    let body = match message.content() {
        MessageContent::Text(text) => text.to_string(),
        MessageContent::Image(image) => format!("[image {}]", abbreviate(image)),
        MessageContent::TextWithImage { text, image } => {
            format!("{} [image {}]", text, abbreviate(image))
        }
    };
    format!("[{}] {}: {}", message.time_label(), who, body)
}

/// Inline images are long; show the media type and size only.
fn abbreviate(image: &str) -> String {
    match image.strip_prefix("data:") {
        Some(rest) => {
            let mime = rest.split(';').next().unwrap_or("image");
            format!("{}, {} bytes inline", mime, image.len())
        }
        None => image.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_is_a_message() {
        assert_eq!(
            Command::parse("  hello there "),
            Ok(Some(Command::Say("hello there".to_string())))
        );
        assert_eq!(Command::parse("   "), Ok(None));
    }

    #[test]
    fn test_login_and_signup() {
        assert_eq!(
            Command::parse("/login a@b.c secret"),
            Ok(Some(Command::Login {
                email: "a@b.c".to_string(),
                password: "secret".to_string()
            }))
        );
        assert_eq!(
            Command::parse("/signup a@b.c secret Alison Martin"),
            Ok(Some(Command::Signup {
                email: "a@b.c".to_string(),
                password: "secret".to_string(),
                name: "Alison Martin".to_string()
            }))
        );
        assert!(Command::parse("/login a@b.c").is_err());
        assert!(Command::parse("/signup a@b.c secret").is_err());
    }

    #[test]
    fn test_arguments_and_usage() {
        assert_eq!(Command::parse("/peers"), Ok(Some(Command::Peers(String::new()))));
        assert_eq!(
            Command::parse("/OPEN Alison Martin"),
            Ok(Some(Command::Open("Alison Martin".to_string())))
        );
        assert!(Command::parse("/open").is_err());
        assert!(Command::parse("/dance").is_err());
        assert_eq!(
            Command::parse("/image ./cat.png"),
            Ok(Some(Command::Image(PathBuf::from("./cat.png"))))
        );
    }

    #[test]
    fn test_abbreviate_inline_image() {
        assert_eq!(abbreviate("data:image/png;base64,AAAA"), "image/png, 26 bytes inline");
        assert_eq!(abbreviate("https://cdn/x.png"), "https://cdn/x.png");
    }
}
