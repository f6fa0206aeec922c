use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use notify_limit::ChatId;

/// A single outbound bot API call.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum BotRequest {
    SendMessage(SendMessage),
    SendPhoto(SendPhoto),
    SendMediaGroup(SendMediaGroup),
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SendMessage {
    pub chat_id: ChatId,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_thread_id: Option<i32>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SendPhoto {
    pub chat_id: ChatId,
    /// A file id known to the endpoint or a URL it can fetch.
    pub photo: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_thread_id: Option<i32>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SendMediaGroup {
    pub chat_id: ChatId,
    pub media: Vec<InputMediaPhoto>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_thread_id: Option<i32>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct InputMediaPhoto {
    #[serde(rename = "type")]
    kind: &'static str,
    pub media: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
}

impl From<&MediaSpec> for InputMediaPhoto {
    fn from(spec: &MediaSpec) -> Self {
        Self {
            kind: "photo",
            media: spec.file_id_or_url.clone(),
            caption: spec.caption.clone(),
        }
    }
}

/// One album item handed to [`crate::NotifySender::send_media_group`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MediaSpec {
    pub file_id_or_url: String,
    pub caption: Option<String>,
}

impl MediaSpec {
    pub fn new(file_id_or_url: impl Into<String>) -> Self {
        Self {
            file_id_or_url: file_id_or_url.into(),
            caption: None,
        }
    }

    pub fn with_caption(mut self, caption: impl Into<String>) -> Self {
        self.caption = Some(caption.into());
        self
    }
}

impl BotRequest {
    pub fn message(chat_id: ChatId, text: impl Into<String>, thread_id: Option<i32>) -> Self {
        BotRequest::SendMessage(SendMessage {
            chat_id,
            text: text.into(),
            message_thread_id: thread_id,
        })
    }

    pub fn photo(
        chat_id: ChatId,
        photo: impl Into<String>,
        caption: Option<String>,
        thread_id: Option<i32>,
    ) -> Self {
        BotRequest::SendPhoto(SendPhoto {
            chat_id,
            photo: photo.into(),
            caption,
            message_thread_id: thread_id,
        })
    }

    pub fn media_group(chat_id: ChatId, media: &[MediaSpec], thread_id: Option<i32>) -> Self {
        BotRequest::SendMediaGroup(SendMediaGroup {
            chat_id,
            media: media.iter().map(InputMediaPhoto::from).collect(),
            message_thread_id: thread_id,
        })
    }

    /// Bot API method name.
    pub fn method(&self) -> &'static str {
        match self {
            BotRequest::SendMessage(_) => "sendMessage",
            BotRequest::SendPhoto(_) => "sendPhoto",
            BotRequest::SendMediaGroup(_) => "sendMediaGroup",
        }
    }

    pub fn chat_id(&self) -> ChatId {
        match self {
            BotRequest::SendMessage(r) => r.chat_id,
            BotRequest::SendPhoto(r) => r.chat_id,
            BotRequest::SendMediaGroup(r) => r.chat_id,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct ResponseParameters {
    /// Seconds the endpoint asks the client to wait.
    #[serde(default)]
    pub retry_after: Option<i64>,
}

/// The bot API response envelope.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct BotResponse {
    pub ok: bool,
    #[serde(default)]
    pub error_code: Option<u16>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: Option<ResponseParameters>,
    #[serde(default)]
    pub result: Option<Value>,
}

impl BotResponse {
    pub fn ok(result: Value) -> Self {
        Self {
            ok: true,
            result: Some(result),
            ..Default::default()
        }
    }

    pub fn error(code: u16, description: impl Into<String>) -> Self {
        Self {
            ok: false,
            error_code: Some(code),
            description: Some(description.into()),
            ..Default::default()
        }
    }

    pub fn with_retry_after(mut self, seconds: i64) -> Self {
        self.parameters = Some(ResponseParameters {
            retry_after: Some(seconds),
            ..Default::default()
        });
        self
    }

    pub fn retry_after_secs(&self) -> Option<i64> {
        self.parameters.as_ref().and_then(|p| p.retry_after)
    }

    /// Id of the delivered message; the first one for an album.
    pub fn message_id(&self) -> Option<i64> {
        let result = self.result.as_ref()?;
        let message = match result {
            Value::Array(messages) => messages.first()?,
            other => other,
        };
        message.get("message_id")?.as_i64()
    }
}
