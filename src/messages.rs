use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::validate;

/// Broker channel prefix; a room's traffic travels on `messages:<room id>`.
pub const CHANNEL_PREFIX: &str = "messages:";
/// The single standing subscription that receives every room's traffic.
pub const ROOM_PATTERN: &str = "messages:*";

pub const NEW_MEMBER: &str = "new_member";
pub const LOGOUT_MEMBER: &str = "logout_member";

pub fn room_channel(room_id: &str) -> String {
    format!("{CHANNEL_PREFIX}{room_id}")
}

/// Recovers the room ID from a channel name, `None` for foreign or empty
/// channels.
pub fn room_from_channel(channel: &str) -> Option<&str> {
    channel
        .strip_prefix(CHANNEL_PREFIX)
        .filter(|room_id| !room_id.is_empty())
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("invalid request id")]
    MissingId,
    #[error("invalid room id")]
    MissingRoomId,
    #[error("invalid request method: '{0}'")]
    UnknownMethod(String),
    #[error("invalid '{method}' request, param '{param}' {reason}")]
    InvalidParam {
        method: String,
        param: &'static str,
        reason: &'static str,
    },
}

/// A client request or server event as it travels on the wire.
///
/// Clients send `id`, `room_id`, `method` and `params`; the server stamps
/// `user_id`, `room_id` and `sent_at` before the message is relayed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_id: String,
    #[serde(default)]
    pub room_id: String,
    #[serde(default)]
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "nullable_map")]
    pub params: Map<String, Value>,
}

fn nullable_map<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Map<String, Value>>::deserialize(deserializer)?.unwrap_or_default())
}

impl Message {
    pub fn decode(frame: &str) -> Result<Self, ValidationError> {
        serde_json::from_str(frame).map_err(|e| ValidationError::Malformed(e.to_string()))
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Server-originated event for a room, e.g. a member joining.
    pub fn event(method: &str, user_id: &str, room_id: &str, params: Map<String, Value>) -> Self {
        Message {
            id: String::new(),
            user_id: user_id.to_string(),
            room_id: room_id.to_string(),
            method: method.to_string(),
            sent_at: Some(Utc::now()),
            params,
        }
    }

    pub fn stamp(&mut self, user_id: &str, room_id: &str, sent_at: DateTime<Utc>) {
        self.user_id = user_id.to_string();
        self.room_id = room_id.to_string();
        self.sent_at = Some(sent_at);
    }

    /// Checks the envelope and decodes `params` according to `method`.
    ///
    /// Only client methods are accepted; server events such as
    /// `new_member` are rejected like any unknown method.
    pub fn validate(&self) -> Result<Request, ValidationError> {
        if self.id.trim().is_empty() {
            return Err(ValidationError::MissingId);
        }
        if self.room_id.trim().is_empty() {
            return Err(ValidationError::MissingRoomId);
        }
        Request::parse(&self.method, &self.params)
    }
}

/// A validated client request with its typed parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    NewMessage { content: String },
    EditMessage { message_id: String, content: String },
    RemoveMessage { message_id: String },
    RenameMember { name: String },
    UpdateRoom { title: String, video_url: String },
    VideoPlay { second: Option<f64> },
    VideoPause { second: Option<f64> },
    VideoSync { second: Option<f64> },
    GetMembers,
    GetMe,
}

impl Request {
    pub fn parse(method: &str, params: &Map<String, Value>) -> Result<Self, ValidationError> {
        let p = Params { method, params };
        let request = match method {
            "new_message" => Request::NewMessage {
                content: p.content()?,
            },
            "edit_message" => Request::EditMessage {
                message_id: p.message_id()?,
                content: p.content()?,
            },
            "remove_message" => Request::RemoveMessage {
                message_id: p.message_id()?,
            },
            "rename_member" => {
                let name = p.string("name")?;
                if !validate::is_name_valid(&name) {
                    return Err(p.invalid("name", "must be a valid display name"));
                }
                Request::RenameMember { name }
            }
            "update_room" => {
                let title = p.string("title")?;
                if !validate::is_title_valid(&title) {
                    return Err(p.invalid("title", "must be 2 to 100 characters"));
                }
                let video_url = p.string("video_url")?;
                if !validate::is_url_valid(&video_url) {
                    return Err(p.invalid("video_url", "must be a valid url"));
                }
                Request::UpdateRoom { title, video_url }
            }
            "video_play" => Request::VideoPlay {
                second: p.second()?,
            },
            "video_pause" => Request::VideoPause {
                second: p.second()?,
            },
            "video_sync" => Request::VideoSync {
                second: p.second()?,
            },
            "get_members" => Request::GetMembers,
            "get_me" => Request::GetMe,
            other => return Err(ValidationError::UnknownMethod(other.to_string())),
        };
        Ok(request)
    }

    /// Requests answered to the sender only, never relayed to the room.
    pub fn is_private(&self) -> bool {
        matches!(self, Request::GetMembers | Request::GetMe)
    }
}

struct Params<'a> {
    method: &'a str,
    params: &'a Map<String, Value>,
}

impl Params<'_> {
    fn invalid(&self, param: &'static str, reason: &'static str) -> ValidationError {
        ValidationError::InvalidParam {
            method: self.method.to_string(),
            param,
            reason,
        }
    }

    fn string(&self, key: &'static str) -> Result<String, ValidationError> {
        match self.params.get(key) {
            Some(Value::String(s)) => Ok(s.clone()),
            _ => Err(self.invalid(key, "is required and must be string")),
        }
    }

    fn content(&self) -> Result<String, ValidationError> {
        let content = self.string("content")?;
        if content.trim().is_empty() {
            return Err(self.invalid("content", "is required and must be string"));
        }
        Ok(content)
    }

    // Message IDs are server-assigned strings; integer IDs are accepted too.
    fn message_id(&self) -> Result<String, ValidationError> {
        match self.params.get("message_id") {
            Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.clone()),
            Some(Value::Number(n)) if n.is_i64() || n.is_u64() => Ok(n.to_string()),
            _ => Err(self.invalid("message_id", "is required and must be string or int")),
        }
    }

    fn second(&self) -> Result<Option<f64>, ValidationError> {
        match self.params.get("second") {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => Ok(n.as_f64()),
            Some(_) => Err(self.invalid("second", "must be a number")),
        }
    }
}
