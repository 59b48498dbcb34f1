use serde::{Deserialize, Serialize};

use crate::constants::MessageType;

/// Error carried by an [`Envelope`] reply, with an HTTP-equivalent code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: i32,
    pub message: String,
}

/// Text frame exchanged on the primary channel.
///
/// `payload` stays raw until the receiver knows which type to expect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Box<serde_json::value::RawValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Envelope {
    pub fn new<T: Serialize>(
        id: impl Into<String>,
        kind: MessageType,
        payload: Option<&T>,
    ) -> Result<Self, serde_json::Error> {
        let payload = payload
            .map(|p| serde_json::value::to_raw_value(p))
            .transpose()?;
        Ok(Self {
            id: id.into(),
            kind,
            payload,
            error: None,
        })
    }

    /// Deserializes the payload, `None` when the envelope carries none.
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(
        &self,
    ) -> Result<Option<T>, serde_json::Error> {
        self.payload
            .as_ref()
            .map(|raw| serde_json::from_str(raw.get()))
            .transpose()
    }

    pub fn error(id: impl Into<String>, code: i32, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: MessageType::Error,
            payload: None,
            error: Some(ErrorBody {
                code,
                message: message.into(),
            }),
        }
    }

    /// Builds a reply correlated to this envelope's id.
    pub fn reply<T: Serialize>(
        &self,
        kind: MessageType,
        payload: Option<&T>,
    ) -> Result<Self, serde_json::Error> {
        Envelope::new(&self.id, kind, payload)
    }

    pub fn reply_error(&self, code: i32, message: impl Into<String>) -> Self {
        Envelope::error(&self.id, code, message)
    }
}
