use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque server-assigned user id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// The authenticated user. Replaced wholesale on login and profile update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: PeerId,
    pub display_name: String,
    pub avatar: Option<String>,
    pub bio: Option<String>,
    pub email: Option<String>,
}

/// Another user the current identity can exchange messages with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Peer {
    pub id: PeerId,
    pub display_name: String,
    pub avatar: Option<String>,
    pub bio: Option<String>,
    pub email: Option<String>,
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.display_name, self.id)
    }
}

/// A peer together with its presence, derived from the latest
/// online-peer snapshot. Presence is never stored on the peer itself.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerView {
    pub peer: Peer,
    pub online: bool,
}

/// User record as the server sends it. Field names differ between
/// endpoints, so every known spelling is accepted here and nowhere else.
#[derive(Debug, Clone, Deserialize)]
pub struct UserRecord {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(default, alias = "fullName", alias = "displayName")]
    pub name: Option<String>,
    #[serde(default, alias = "profilePic", alias = "profilePicture")]
    pub avatar: Option<String>,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

impl UserRecord {
    fn normalized(self) -> (PeerId, String, Option<String>, Option<String>, Option<String>) {
        let name = non_empty(self.name);
        let email = non_empty(self.email);
        let display_name = name
            .or_else(|| email.clone())
            .unwrap_or_else(|| self.id.clone());
        (
            PeerId::new(self.id),
            display_name,
            non_empty(self.avatar),
            non_empty(self.bio),
            email,
        )
    }
}

impl From<UserRecord> for Identity {
    fn from(record: UserRecord) -> Self {
        let (id, display_name, avatar, bio, email) = record.normalized();
        Self {
            id,
            display_name,
            avatar,
            bio,
            email,
        }
    }
}

impl From<UserRecord> for Peer {
    fn from(record: UserRecord) -> Self {
        let (id, display_name, avatar, bio, email) = record.normalized();
        Self {
            id,
            display_name,
            avatar,
            bio,
            email,
        }
    }
}

pub(crate) fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
