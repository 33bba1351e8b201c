//! Message protocol definitions
//!
//! JSON-based protocol using Serde's internally tagged enum keyed on
//! `action`. Every variant carries exactly the fields its action requires,
//! so a request missing one of them fails to decode as a whole.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RelayError;

/// Account block carried by PRESENCE
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub account_name: String,
}

/// Direct text message between two identities
///
/// This is both the MESSAGE request body and the record forwarded to the
/// recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub time: f64,
    #[serde(rename = "from")]
    pub sender: String,
    #[serde(rename = "to")]
    pub destination: String,
    pub mess_text: String,
}

/// Client → Server message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Log in under a display name
    Presence { time: f64, user: Account },
    /// Send a direct message
    Message(ChatMessage),
    /// Log out and close the connection
    Exit { time: f64, account_name: String },
    /// Fetch the contact list of `user`
    GetContacts { time: f64, user: String },
    /// Add `account_name` to the contacts of `user`
    #[serde(rename = "add")]
    AddContact {
        time: f64,
        user: String,
        account_name: String,
    },
    /// Remove `account_name` from the contacts of `user`
    #[serde(rename = "remove")]
    RemoveContact {
        time: f64,
        user: String,
        account_name: String,
    },
    /// List every known username
    #[serde(rename = "get_users")]
    UsersRequest { time: f64, account_name: String },
}

impl ClientMessage {
    /// Validate a decoded JSON object against the action table
    pub fn from_value(value: Value) -> Result<Self, RelayError> {
        let msg: ClientMessage = serde_json::from_value(value).map_err(|_| RelayError::BadRequest)?;
        if msg.claimed_identity().is_empty() {
            return Err(RelayError::BadRequest);
        }
        Ok(msg)
    }

    /// Identity the request acts on behalf of
    pub fn claimed_identity(&self) -> &str {
        match self {
            ClientMessage::Presence { user, .. } => &user.account_name,
            ClientMessage::Message(msg) => &msg.sender,
            ClientMessage::Exit { account_name, .. } => account_name,
            ClientMessage::GetContacts { user, .. } => user,
            ClientMessage::AddContact { user, .. } => user,
            ClientMessage::RemoveContact { user, .. } => user,
            ClientMessage::UsersRequest { account_name, .. } => account_name,
        }
    }

    /// Action name as it appears on the wire, for logging
    pub fn action(&self) -> &'static str {
        match self {
            ClientMessage::Presence { .. } => "presence",
            ClientMessage::Message(_) => "message",
            ClientMessage::Exit { .. } => "exit",
            ClientMessage::GetContacts { .. } => "get_contacts",
            ClientMessage::AddContact { .. } => "add",
            ClientMessage::RemoveContact { .. } => "remove",
            ClientMessage::UsersRequest { .. } => "get_users",
        }
    }
}

/// Reply record: numeric status, optional reason and optional list payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub response: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_list: Option<Vec<String>>,
}

impl Response {
    pub const OK: u16 = 200;
    pub const ACCEPTED: u16 = 202;
    pub const BAD_REQUEST: u16 = 400;
    pub const SERVER_ERROR: u16 = 500;

    /// Plain success
    pub fn ok() -> Self {
        Self {
            response: Self::OK,
            error: None,
            data_list: None,
        }
    }

    /// Success carrying a list of names
    pub fn list(data: Vec<String>) -> Self {
        Self {
            response: Self::ACCEPTED,
            error: None,
            data_list: Some(data),
        }
    }

    /// Error with a human-readable reason
    pub fn error(code: u16, reason: impl Into<String>) -> Self {
        Self {
            response: code,
            error: Some(reason.into()),
            data_list: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.response < Self::BAD_REQUEST
    }
}

/// Server → Client frame
///
/// Either a reply, or a MESSAGE record being forwarded to its recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Response(Response),
    Relay(ClientMessage),
}

impl From<Response> for ServerMessage {
    fn from(response: Response) -> Self {
        ServerMessage::Response(response)
    }
}

impl From<ChatMessage> for ServerMessage {
    fn from(msg: ChatMessage) -> Self {
        ServerMessage::Relay(ClientMessage::Message(msg))
    }
}

/// Convert RelayError to Response for client notification
impl From<RelayError> for Response {
    fn from(err: RelayError) -> Self {
        match &err {
            RelayError::BadRequest => Response::error(Response::BAD_REQUEST, "Bad request"),
            RelayError::NameTaken(name) => {
                Response::error(Response::BAD_REQUEST, format!("Name '{}' is already taken", name))
            }
            RelayError::AlreadyAuthenticated => {
                Response::error(Response::BAD_REQUEST, "Connection is already logged in")
            }
            RelayError::NotOwner(_) => Response::error(Response::BAD_REQUEST, "Bad request"),
            RelayError::RecipientUnknown(name) => Response::error(
                Response::BAD_REQUEST,
                format!("User '{}' is not registered on the server", name),
            ),
            RelayError::RecipientGone(name) => Response::error(
                Response::BAD_REQUEST,
                format!("User '{}' disconnected before delivery", name),
            ),
            RelayError::BacklogFull(name) => Response::error(
                Response::BAD_REQUEST,
                format!("Too many undelivered messages for '{}'", name),
            ),
            RelayError::Storage(_) => Response::error(Response::SERVER_ERROR, "Internal error"),
        }
    }
}

impl From<RelayError> for ServerMessage {
    fn from(err: RelayError) -> Self {
        ServerMessage::Response(err.into())
    }
}
