//! Wire protocol shared by the server and the client.
//!
//! JSON text frames over a single WebSocket. Every client frame is a
//! request carrying a correlation id; the server answers each with exactly
//! one `response` frame and may push `event` frames at any time.
//!
//! The server never sees plaintext: message bodies and chat keys cross the
//! wire only as base64 ciphertext.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::identity::KeyBundle;

/// Schema version carried in every client frame.
pub const PROTOCOL_VERSION: u32 = 1;

pub type UserId = i64;
pub type ChatId = i64;
pub type MessageId = i64;
pub type KeyVersion = i64;

// ── Client → Server ───────────────────────────────────────────────────────────

/// A request frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientFrame {
    /// Protocol version the client speaks
    pub v: u32,
    /// Correlation id echoed in the response
    pub id: u64,
    pub request: Request,
}

impl ClientFrame {
    pub fn new(id: u64, request: Request) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            id,
            request,
        }
    }
}

/// Operations a client can call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", content = "data", rename_all = "snake_case")]
pub enum Request {
    /// Authenticate the connection. Carrying `bootstrap` on the first login
    /// sets the account's key pair and replaces its password.
    Login {
        username: String,
        password: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bootstrap: Option<Bootstrap>,
    },

    /// Look up the private chat with `user_id` and subscribe to it, or to the
    /// pending pair group when no chat exists yet.
    OpenChat { user_id: UserId },

    /// Leave the groups joined by `OpenChat`.
    CloseChat {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<ChatId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<UserId>,
    },

    /// Find or create the private chat with `user_id`.
    CreatePrivateChat { user_id: UserId },

    /// Fetch the caller's wrapped chat key at `version`.
    GetChatKey { chat_id: ChatId, version: KeyVersion },

    /// Fetch history, oldest to newest.
    GetChatMessages {
        chat_id: ChatId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        before_id: Option<MessageId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<u32>,
    },

    /// Append an encrypted message under key `version`.
    SendMessage {
        chat_id: ChatId,
        version: KeyVersion,
        /// base64 AES-GCM ciphertext
        ciphertext: String,
        iv: Vec<u8>,
    },

    /// List the caller's chats with their latest message.
    GetHome,

    Ping,
}

/// First-login payload. All fields arrive together or not at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bootstrap {
    pub new_password: String,
    #[serde(flatten)]
    pub keys: KeyBundle,
}

impl Request {
    /// Operation name for logs.
    pub fn op_name(&self) -> &'static str {
        match self {
            Request::Login { .. } => "login",
            Request::OpenChat { .. } => "open_chat",
            Request::CloseChat { .. } => "close_chat",
            Request::CreatePrivateChat { .. } => "create_private_chat",
            Request::GetChatKey { .. } => "get_chat_key",
            Request::GetChatMessages { .. } => "get_chat_messages",
            Request::SendMessage { .. } => "send_message",
            Request::GetHome => "get_home",
            Request::Ping => "ping",
        }
    }

    /// Whether the connection must be authenticated to call this.
    pub fn requires_auth(&self) -> bool {
        !matches!(self, Request::Login { .. } | Request::Ping)
    }

    /// Shape checks applied before a request reaches storage.
    pub fn validate(&self) -> Result<()> {
        match self {
            Request::Login {
                username,
                password,
                bootstrap,
            } => {
                if username.trim().is_empty() || password.is_empty() {
                    return Err(Error::BadCredential);
                }
                if let Some(b) = bootstrap {
                    if b.new_password.is_empty() {
                        return Err(invalid("new_password must not be empty"));
                    }
                    if b.keys.public_key.is_empty() || b.keys.encrypted_private_key.is_empty() {
                        return Err(invalid("key material must not be empty"));
                    }
                    if b.keys.iv.len() != crate::crypto::NONCE_SIZE {
                        return Err(invalid("iv must be 12 bytes"));
                    }
                    if b.keys.salt.len() != crate::crypto::SALT_SIZE {
                        return Err(invalid("salt must be 16 bytes"));
                    }
                }
            }
            Request::OpenChat { user_id } | Request::CreatePrivateChat { user_id } => {
                check_id("user_id", *user_id)?;
            }
            Request::CloseChat { id, user_id } => {
                if id.is_none() && user_id.is_none() {
                    return Err(invalid("close_chat needs id or user_id"));
                }
            }
            Request::GetChatKey { chat_id, version } => {
                check_id("chat_id", *chat_id)?;
                check_id("version", *version)?;
            }
            Request::GetChatMessages { chat_id, limit, .. } => {
                check_id("chat_id", *chat_id)?;
                if *limit == Some(0) {
                    return Err(invalid("limit must be positive"));
                }
            }
            Request::SendMessage {
                chat_id,
                version,
                ciphertext,
                iv,
            } => {
                check_id("chat_id", *chat_id)?;
                check_id("version", *version)?;
                if iv.len() != crate::crypto::NONCE_SIZE {
                    return Err(invalid("iv must be 12 bytes"));
                }
                let raw = crate::crypto::encoding::decode(ciphertext)
                    .map_err(|_| invalid("ciphertext must be base64"))?;
                if raw.len() < crate::crypto::aead::TAG_SIZE {
                    return Err(invalid("ciphertext too short"));
                }
            }
            Request::GetHome | Request::Ping => {}
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> Error {
    Error::InvalidRequest(msg.to_string())
}

fn check_id(field: &str, value: i64) -> Result<()> {
    if value <= 0 {
        return Err(Error::InvalidRequest(format!("{} must be positive", field)));
    }
    Ok(())
}

// ── Server → Client ───────────────────────────────────────────────────────────

/// Frames sent by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Answer to the request with the same `id`.
    Response {
        id: u64,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorBody>,
    },

    /// Unsolicited push.
    Event { event: Event },
}

impl ServerFrame {
    /// Successful response carrying `data`.
    pub fn ok(id: u64, data: serde_json::Value) -> Self {
        ServerFrame::Response {
            id,
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    /// Failed response.
    pub fn err(id: u64, error: &Error) -> Self {
        ServerFrame::Response {
            id,
            ok: false,
            data: None,
            error: Some(ErrorBody::from(error)),
        }
    }
}

/// Error payload of a failed response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: i32,
    pub message: String,
}

impl From<&Error> for ErrorBody {
    fn from(error: &Error) -> Self {
        Self {
            code: error.code(),
            message: error.public_message(),
        }
    }
}

impl From<ErrorBody> for Error {
    fn from(body: ErrorBody) -> Self {
        Error::from_code(body.code, body.message)
    }
}

/// Server-push events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "data", rename_all = "snake_case")]
pub enum Event {
    /// A message was appended to a chat the connection has open.
    ChatMessage {
        chat_id: ChatId,
        message: MessageResource,
    },

    /// Something changed in one of the user's chats.
    Activity { update: ActivityUpdate },

    /// A private chat was created between a pending pair.
    ChatCreated {
        chat_id: ChatId,
        members: Vec<UserId>,
    },
}

/// Payload of an [`Event::Activity`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActivityUpdate {
    Message { message: MessageResource },
}

// ── Resources ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserResource {
    pub id: UserId,
    pub name: String,
    pub username: String,
}

/// Returned by `login`. Key fields are absent until the account is
/// bootstrapped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthInfo {
    pub id: UserId,
    pub name: String,
    pub username: String,
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default)]
    pub encrypted_private_key: Option<String>,
    #[serde(default)]
    pub iv: Option<Vec<u8>>,
    #[serde(default)]
    pub key_salt: Option<Vec<u8>>,
}

impl AuthInfo {
    /// The stored key bundle, if the account has one.
    pub fn key_bundle(&self) -> Option<KeyBundle> {
        Some(KeyBundle {
            public_key: self.public_key.clone()?,
            encrypted_private_key: self.encrypted_private_key.clone()?,
            iv: self.iv.clone()?,
            salt: self.key_salt.clone()?,
        })
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.public_key.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatKind {
    Private,
    Group,
    Channel,
}

impl ChatKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatKind::Private => "private",
            ChatKind::Group => "group",
            ChatKind::Channel => "channel",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "private" => Some(ChatKind::Private),
            "group" => Some(ChatKind::Group),
            "channel" => Some(ChatKind::Channel),
            _ => None,
        }
    }
}

/// A chat as seen by one member: their own wrapped key at the latest version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatResource {
    pub id: ChatId,
    #[serde(rename = "type")]
    pub kind: ChatKind,
    /// base64 RSA-OAEP wrapped chat key
    pub encrypted_chat_key: String,
    pub version: KeyVersion,
    /// The other member of a private chat
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserResource>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageResource {
    pub id: MessageId,
    pub sender: UserResource,
    pub chat_id: ChatId,
    /// base64 AES-GCM ciphertext
    pub ciphertext: String,
    pub iv: Vec<u8>,
    pub chat_key_version: KeyVersion,
    pub created_at: DateTime<Utc>,
}

/// Entry of the `get_home` chat list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HomeChatResource {
    #[serde(flatten)]
    pub chat: ChatResource,
    #[serde(default)]
    pub last_message: Option<MessageResource>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message() -> MessageResource {
        MessageResource {
            id: 9,
            sender: UserResource {
                id: 1,
                name: "Alice".into(),
                username: "alice".into(),
            },
            chat_id: 3,
            ciphertext: "AAAAAAAAAAAAAAAAAAAAAA==".into(),
            iv: vec![0; 12],
            chat_key_version: 1,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_client_frame_serialization() {
        let frame = ClientFrame::new(
            4,
            Request::GetChatKey {
                chat_id: 3,
                version: 1,
            },
        );
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"v\":1"));
        assert!(json.contains("\"op\":\"get_chat_key\""));

        let parsed: ClientFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, 4);
        match parsed.request {
            Request::GetChatKey { chat_id, version } => {
                assert_eq!(chat_id, 3);
                assert_eq!(version, 1);
            }
            _ => panic!("Wrong variant"),
        }
    }

    #[test]
    fn test_unit_requests_parse_without_data() {
        let parsed: ClientFrame =
            serde_json::from_str(r#"{"v":1,"id":1,"request":{"op":"ping"}}"#).unwrap();
        assert!(matches!(parsed.request, Request::Ping));
        assert!(!parsed.request.requires_auth());
    }

    #[test]
    fn test_unknown_op_rejected() {
        let result = serde_json::from_str::<ClientFrame>(
            r#"{"v":1,"id":1,"request":{"op":"drop_tables","data":{}}}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_login_with_bootstrap_flattens_keys() {
        let json = r#"{"op":"login","data":{"username":"a","password":"p","bootstrap":{
            "new_password":"q","public_key":"pk","encrypted_private_key":"epk",
            "iv":[0,0,0,0,0,0,0,0,0,0,0,0],"salt":[1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1]}}}"#;
        let request: Request = serde_json::from_str(json).unwrap();
        match &request {
            Request::Login { bootstrap: Some(b), .. } => {
                assert_eq!(b.new_password, "q");
                assert_eq!(b.keys.public_key, "pk");
                assert_eq!(b.keys.salt.len(), 16);
            }
            _ => panic!("Wrong variant"),
        }
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_shapes() {
        let short_iv = Request::SendMessage {
            chat_id: 1,
            version: 1,
            ciphertext: "AAAAAAAAAAAAAAAAAAAAAA==".into(),
            iv: vec![0; 5],
        };
        assert!(matches!(short_iv.validate(), Err(Error::InvalidRequest(_))));

        let not_base64 = Request::SendMessage {
            chat_id: 1,
            version: 1,
            ciphertext: "***".into(),
            iv: vec![0; 12],
        };
        assert!(not_base64.validate().is_err());

        assert!(Request::OpenChat { user_id: 0 }.validate().is_err());
        assert!(Request::CloseChat {
            id: None,
            user_id: None
        }
        .validate()
        .is_err());

        let empty_login = Request::Login {
            username: "".into(),
            password: "x".into(),
            bootstrap: None,
        };
        assert_eq!(empty_login.validate().unwrap_err(), Error::BadCredential);
    }

    #[test]
    fn test_error_response_serialization() {
        let frame = ServerFrame::err(7, &Error::StaleKey);
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"type\":\"response\""));
        assert!(json.contains("\"ok\":false"));
        assert!(json.contains("\"code\":301"));
        assert!(!json.contains("\"data\""));

        let parsed: ServerFrame = serde_json::from_str(&json).unwrap();
        match parsed {
            ServerFrame::Response { id, error, .. } => {
                assert_eq!(id, 7);
                assert_eq!(Error::from(error.unwrap()), Error::StaleKey);
            }
            _ => panic!("Wrong variant"),
        }
    }

    #[test]
    fn test_null_data_response() {
        let data = serde_json::to_value(Option::<ChatResource>::None).unwrap();
        let frame = ServerFrame::ok(2, data);
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"data\":null"));
    }

    #[test]
    fn test_event_serialization() {
        let frame = ServerFrame::Event {
            event: Event::ChatMessage {
                chat_id: 3,
                message: sample_message(),
            },
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"type\":\"event\""));
        assert!(json.contains("\"name\":\"chat_message\""));

        let parsed: ServerFrame = serde_json::from_str(&json).unwrap();
        match parsed {
            ServerFrame::Event {
                event: Event::ChatMessage { chat_id, message },
            } => {
                assert_eq!(chat_id, 3);
                assert_eq!(message.sender.username, "alice");
            }
            _ => panic!("Wrong variant"),
        }
    }

    #[test]
    fn test_activity_update_tagged_by_type() {
        let update = ActivityUpdate::Message {
            message: sample_message(),
        };
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["type"], "message");
        assert_eq!(json["message"]["chat_id"], 3);
    }

    #[test]
    fn test_chat_resource_kind_field_is_type() {
        let chat = ChatResource {
            id: 1,
            kind: ChatKind::Private,
            encrypted_chat_key: "k".into(),
            version: 1,
            user: None,
        };
        let json = serde_json::to_value(&chat).unwrap();
        assert_eq!(json["type"], "private");
        assert!(json.get("user").is_none());
    }

    #[test]
    fn test_auth_info_key_bundle() {
        let mut info = AuthInfo {
            id: 1,
            name: "A".into(),
            username: "a".into(),
            public_key: None,
            encrypted_private_key: None,
            iv: None,
            key_salt: None,
        };
        assert!(info.key_bundle().is_none());
        info.public_key = Some("pk".into());
        info.encrypted_private_key = Some("epk".into());
        info.iv = Some(vec![0; 12]);
        info.key_salt = Some(vec![0; 16]);
        let bundle = info.key_bundle().unwrap();
        assert_eq!(bundle.salt.len(), 16);
        assert!(info.is_bootstrapped());
    }
}
