use super::{
    AuthApi, AuthGrant, ChatApi, LoginCredentials, PeerListing, ProfilePatch, SignupCredentials,
};
use crate::chat::{Message, MessageRecord, OutgoingMessage};
use crate::config::Config;
use crate::entity::{Identity, Peer, PeerId, UserRecord};
use crate::error::{ChatError, Result};
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, warn};

const TOKEN_HEADER: &str = "token";

/// REST client for the chat backend. Every response is a JSON object with
/// a `success` flag and, on failure, a human-readable `message`.
pub struct HttpApi {
    client: reqwest::Client,
    base_url: String,
    token: RwLock<Option<String>>,
}

#[derive(Debug, Deserialize)]
struct AuthBody {
    #[serde(default)]
    token: Option<String>,
    #[serde(alias = "userData")]
    user: UserRecord,
}

#[derive(Debug, Deserialize)]
struct UsersBody {
    users: Vec<UserRecord>,
    #[serde(default, rename = "unseenMessagesCount", alias = "unseenMessages")]
    unseen: HashMap<String, u32>,
}

#[derive(Debug, Deserialize)]
struct MessagesBody {
    messages: Vec<MessageRecord>,
}

#[derive(Debug, Deserialize)]
struct SentBody {
    #[serde(alias = "newMessage")]
    message: MessageRecord,
}

impl HttpApi {
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            base_url: config.backend_url.trim_end_matches('/').to_string(),
            token: RwLock::new(None),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
    }

    async fn call<T: DeserializeOwned>(&self, request: RequestBuilder, auth_call: bool) -> Result<T> {
        let request = match self.token.read().await.as_deref() {
            Some(token) => request.header(TOKEN_HEADER, token),
            None => request,
        };

        let response = request.send().await?;
        let status = response.status().as_u16();
        let body: Value = response
            .json()
            .await
            .map_err(|e| ChatError::Network(format!("unreadable response ({}): {}", status, e)))?;

        parse_envelope(status, body, auth_call)
    }
}

/// Turn a backend response into either the typed body or the matching
/// error variant.
fn parse_envelope<T: DeserializeOwned>(status: u16, body: Value, auth_call: bool) -> Result<T> {
    let success = body.get("success").and_then(Value::as_bool).unwrap_or(false);
    let message = body
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string);

    if status == 401 || status == 403 {
        return Err(ChatError::Auth(
            message.unwrap_or_else(|| "Not authorized".to_string()),
        ));
    }

    if status >= 500 && message.is_none() {
        return Err(ChatError::Network(format!("server returned {}", status)));
    }

    if !success || !(200..300).contains(&status) {
        let message = message.unwrap_or_else(|| format!("request failed ({})", status));
        return Err(if auth_call {
            ChatError::Auth(message)
        } else {
            ChatError::Rejected(message)
        });
    }

    Ok(serde_json::from_value(body)?)
}

fn into_messages(records: Vec<MessageRecord>) -> Vec<Message> {
    records
        .into_iter()
        .filter_map(|record| match Message::try_from(record) {
            Ok(message) => Some(message),
            Err(e) => {
                warn!("Dropping malformed message: {}", e);
                None
            }
        })
        .collect()
}

#[async_trait]
impl AuthApi for HttpApi {
    async fn set_token(&self, token: Option<String>) {
        *self.token.write().await = token;
    }

    async fn check(&self, token: &str) -> Result<Identity> {
        self.set_token(Some(token.to_string())).await;
        let body: AuthBody = self
            .call(self.request(Method::GET, "/api/auth/check"), true)
            .await?;
        Ok(body.user.into())
    }

    async fn login(&self, credentials: &LoginCredentials) -> Result<AuthGrant> {
        debug!("POST /api/auth/login for {}", credentials.email);
        let request = self.request(Method::POST, "/api/auth/login").json(credentials);
        let body: AuthBody = self.call(request, true).await?;
        grant(body)
    }

    async fn signup(&self, credentials: &SignupCredentials) -> Result<AuthGrant> {
        debug!("POST /api/auth/signup for {}", credentials.email);
        let request = self.request(Method::POST, "/api/auth/signup").json(credentials);
        let body: AuthBody = self.call(request, true).await?;
        grant(body)
    }

    async fn update_profile(&self, patch: &ProfilePatch) -> Result<Identity> {
        let request = self
            .request(Method::PUT, "/api/auth/updateProfile")
            .json(patch);
        let body: AuthBody = self.call(request, false).await?;
        Ok(body.user.into())
    }
}

fn grant(body: AuthBody) -> Result<AuthGrant> {
    let token = body
        .token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ChatError::Auth("server did not issue a token".to_string()))?;
    Ok(AuthGrant {
        token,
        identity: body.user.into(),
    })
}

#[async_trait]
impl ChatApi for HttpApi {
    async fn list_peers(&self) -> Result<PeerListing> {
        let body: UsersBody = self
            .call(self.request(Method::GET, "/api/message/users"), false)
            .await?;

        Ok(PeerListing {
            peers: body.users.into_iter().map(Peer::from).collect(),
            unseen: body
                .unseen
                .into_iter()
                .map(|(id, count)| (PeerId::new(id), count))
                .collect(),
        })
    }

    async fn history(&self, peer: &PeerId) -> Result<Vec<Message>> {
        let path = format!("/api/message/{}", peer);
        let body: MessagesBody = self.call(self.request(Method::GET, &path), false).await?;
        Ok(into_messages(body.messages))
    }

    async fn send(&self, peer: &PeerId, message: &OutgoingMessage) -> Result<Message> {
        let path = format!("/api/message/send/{}", peer);
        let request = self.request(Method::POST, &path).json(message);
        let body: SentBody = self.call(request, false).await?;
        Message::try_from(body.message)
    }

    async fn mark_seen(&self, message_id: &str) -> Result<()> {
        let path = format!("/api/message/mark/{}", message_id);
        let _: Value = self.call(self.request(Method::PUT, &path), false).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_success_body_is_decoded() {
        let body = json!({
            "success": true,
            "users": [{ "_id": "a", "fullName": "Alison" }],
            "unseenMessagesCount": { "a": 2 }
        });

        let users: UsersBody = parse_envelope(200, body, false).unwrap();
        assert_eq!(users.users.len(), 1);
        assert_eq!(users.unseen.get("a"), Some(&2));
    }

    #[test]
    fn test_failure_on_auth_call_is_auth_error() {
        let body = json!({ "success": false, "message": "Invalid credentials" });
        let result: Result<AuthBody> = parse_envelope(200, body, true);
        match result {
            Err(ChatError::Auth(msg)) => assert_eq!(msg, "Invalid credentials"),
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_failure_on_chat_call_is_rejected() {
        let body = json!({ "success": false, "message": "Receiver not found" });
        let result: Result<SentBody> = parse_envelope(400, body, false);
        assert!(matches!(result, Err(ChatError::Rejected(msg)) if msg == "Receiver not found"));
    }

    #[test]
    fn test_unauthorized_status_is_auth_error() {
        let body = json!({ "success": false, "message": "jwt expired" });
        let result: Result<Value> = parse_envelope(401, body, false);
        assert!(matches!(result, Err(ChatError::Auth(msg)) if msg == "jwt expired"));
    }

    #[test]
    fn test_bare_server_error_is_network_error() {
        let result: Result<Value> = parse_envelope(502, json!({}), false);
        assert!(matches!(result, Err(ChatError::Network(_))));
    }

    #[test]
    fn test_sent_body_accepts_new_message_key() {
        let body = json!({
            "success": true,
            "newMessage": { "_id": "m1", "senderId": "me", "receiverId": "a", "text": "hi" }
        });
        let sent: SentBody = parse_envelope(201, body, false).unwrap();
        assert_eq!(sent.message.id, "m1");
    }

    #[test]
    fn test_grant_requires_token() {
        let body: AuthBody =
            serde_json::from_value(json!({ "user": { "_id": "me", "fullName": "Me" } })).unwrap();
        assert!(matches!(grant(body), Err(ChatError::Auth(_))));
    }

    #[test]
    fn test_malformed_messages_are_dropped() {
        let records: Vec<MessageRecord> = serde_json::from_value(json!([
            { "_id": "m1", "senderId": "a", "receiverId": "b", "text": "hi" },
            { "_id": "m2", "senderId": "a", "receiverId": "b" }
        ]))
        .unwrap();

        let messages = into_messages(records);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, "m1");
    }
}
