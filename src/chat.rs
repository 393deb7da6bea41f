use crate::entity::{non_empty, PeerId};
use crate::error::{ChatError, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Local, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Number of images shown in the shared-media strip.
pub const GALLERY_SIZE: usize = 6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub sender_id: PeerId,
    pub recipient_id: PeerId,
    pub text: Option<String>,
    /// Inline `data:` URL or a server-side media reference.
    pub image: Option<String>,
    pub created_at: DateTime<Utc>,
    pub seen: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageContent<'a> {
    Text(&'a str),
    Image(&'a str),
    TextWithImage { text: &'a str, image: &'a str },
}

impl Message {
    pub fn content(&self) -> MessageContent<'_> {
        match (self.text.as_deref(), self.image.as_deref()) {
            (Some(text), Some(image)) => MessageContent::TextWithImage { text, image },
            (None, Some(image)) => MessageContent::Image(image),
            (Some(text), None) => MessageContent::Text(text),
            // Construction goes through `TryFrom<MessageRecord>`, which
            // refuses records without content.
            (None, None) => MessageContent::Text(""),
        }
    }

    pub fn is_from(&self, peer: &PeerId) -> bool {
        &self.sender_id == peer
    }

    /// Whether this message belongs to the conversation with `peer`.
    pub fn involves(&self, peer: &PeerId) -> bool {
        &self.sender_id == peer || &self.recipient_id == peer
    }

    /// `HH:MM` in the local time zone.
    pub fn time_label(&self) -> String {
        self.time_label_in(&Local)
    }

    pub fn time_label_in<Tz: TimeZone>(&self, tz: &Tz) -> String
    where
        Tz::Offset: std::fmt::Display,
    {
        self.created_at.with_timezone(tz).format("%H:%M").to_string()
    }
}

/// Message record as exchanged with the server and the realtime channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    #[serde(rename = "_id", alias = "id")]
    pub id: String,
    pub sender_id: String,
    #[serde(alias = "recipientId")]
    pub receiver_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub seen: bool,
}

impl TryFrom<MessageRecord> for Message {
    type Error = ChatError;

    fn try_from(record: MessageRecord) -> Result<Self> {
        let text = non_empty(record.text);
        let image = non_empty(record.image);
        if text.is_none() && image.is_none() {
            return Err(ChatError::Validation(format!(
                "message {} has neither text nor image",
                record.id
            )));
        }

        Ok(Self {
            id: record.id,
            sender_id: PeerId::new(record.sender_id),
            recipient_id: PeerId::new(record.receiver_id),
            text,
            image,
            created_at: record.created_at.unwrap_or_else(Utc::now),
            seen: record.seen,
        })
    }
}

impl From<&Message> for MessageRecord {
    fn from(message: &Message) -> Self {
        Self {
            id: message.id.clone(),
            sender_id: message.sender_id.to_string(),
            receiver_id: message.recipient_id.to_string(),
            text: message.text.clone(),
            image: message.image.clone(),
            created_at: Some(message.created_at),
            seen: message.seen,
        }
    }
}

/// Validated payload for a send. Holds non-empty text, an image, or both.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutgoingMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl OutgoingMessage {
    pub fn new(text: Option<String>, image: Option<String>) -> Result<Self> {
        let text = non_empty(text);
        let image = non_empty(image);
        if text.is_none() && image.is_none() {
            return Err(ChatError::Validation(
                "Message must contain text or an image".to_string(),
            ));
        }
        Ok(Self { text, image })
    }

    pub fn text(text: impl Into<String>) -> Result<Self> {
        Self::new(Some(text.into()), None)
    }

    pub fn image(data_url: impl Into<String>) -> Result<Self> {
        Self::new(None, Some(data_url.into()))
    }
}

/// Encode raw bytes as an inline `data:` URL.
pub fn image_data_url(bytes: &[u8], mime: &str) -> String {
    format!("data:{};base64,{}", mime, STANDARD.encode(bytes))
}

/// Read an image file and encode it as an inline `data:` URL.
/// Size and format are not checked; the server accepts or rejects it.
pub async fn image_data_url_from_file(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    let bytes = tokio::fs::read(path).await.map_err(|e| {
        ChatError::Validation(format!("cannot read {}: {}", path.display(), e))
    })?;
    Ok(image_data_url(&bytes, guess_mime(path)))
}

pub fn guess_mime(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match ext.as_deref() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("svg") => "image/svg+xml",
        Some("bmp") => "image/bmp",
        _ => "application/octet-stream",
    }
}

/// Most recent image payloads of a conversation, newest first.
pub fn media_gallery(messages: &[Message]) -> Vec<&str> {
    messages
        .iter()
        .rev()
        .filter_map(|m| m.image.as_deref())
        .take(GALLERY_SIZE)
        .collect()
}
