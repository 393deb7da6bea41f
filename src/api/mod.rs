//! Request/response collaborators.
//!
//! The stores only see the [`AuthApi`] and [`ChatApi`] traits. [`HttpApi`]
//! implements both against the REST backend; tests substitute fakes.

pub mod http;

pub use http::HttpApi;

use crate::chat::{Message, OutgoingMessage};
use crate::entity::{Identity, Peer, PeerId};
use crate::error::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize)]
pub struct LoginCredentials {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignupCredentials {
    pub full_name: String,
    pub email: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
}

/// Fields left as `None` are not sent and stay unchanged on the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfilePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
    /// Inline `data:` URL of the new avatar.
    #[serde(rename = "profilePicture", skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

impl ProfilePatch {
    pub fn is_empty(&self) -> bool {
        self.full_name.is_none() && self.bio.is_none() && self.avatar.is_none()
    }
}

/// Successful login or signup.
#[derive(Debug, Clone)]
pub struct AuthGrant {
    pub token: String,
    pub identity: Identity,
}

#[derive(Debug, Clone, Default)]
pub struct PeerListing {
    pub peers: Vec<Peer>,
    pub unseen: HashMap<PeerId, u32>,
}

#[async_trait]
pub trait AuthApi: Send + Sync {
    /// Token attached to every subsequent request. `None` signs out.
    async fn set_token(&self, token: Option<String>);

    async fn check(&self, token: &str) -> Result<Identity>;

    async fn login(&self, credentials: &LoginCredentials) -> Result<AuthGrant>;

    async fn signup(&self, credentials: &SignupCredentials) -> Result<AuthGrant>;

    async fn update_profile(&self, patch: &ProfilePatch) -> Result<Identity>;
}

#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn list_peers(&self) -> Result<PeerListing>;

    /// Full history with `peer`, in server order.
    async fn history(&self, peer: &PeerId) -> Result<Vec<Message>>;

    /// Returns the server's canonical copy of the stored message.
    async fn send(&self, peer: &PeerId, message: &OutgoingMessage) -> Result<Message>;

    async fn mark_seen(&self, message_id: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_profile_patch_uses_server_field_names() {
        let patch = ProfilePatch {
            full_name: Some("Alison".to_string()),
            bio: None,
            avatar: Some("data:image/png;base64,AAAA".to_string()),
        };

        assert_eq!(
            serde_json::to_value(&patch).unwrap(),
            json!({
                "fullName": "Alison",
                "profilePicture": "data:image/png;base64,AAAA",
            })
        );
    }
}
