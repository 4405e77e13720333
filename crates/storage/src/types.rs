use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{MessageId, SessionId};

/// Persisted message role. System prompts are never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoredRole {
    User,
    Assistant,
}

/// Web citation attached to an assistant answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebSource {
    #[serde(default)]
    pub title: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: MessageId,
    pub role: StoredRole,
    pub content: String,
    #[serde(default)]
    pub sources: Vec<WebSource>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredChat {
    pub id: SessionId,
    pub model: String,
    pub messages: Vec<StoredMessage>,
    #[serde(with = "iso8601")]
    pub created_at: DateTime<Utc>,
}

impl StoredChat {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Whole-second RFC 3339 timestamps (`2026-01-29T10:15:00Z`); fractional input is accepted.
mod iso8601 {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.to_rfc3339_opts(SecondsFormat::Secs, true))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|value| value.with_timezone(&Utc))
            .map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    #[test]
    fn stored_chat_uses_camel_case_and_iso_dates() {
        let chat = StoredChat {
            id: SessionId::parse("00000000-0000-4000-8000-000000000001").expect("id"),
            model: "m1".to_string(),
            messages: vec![StoredMessage {
                id: MessageId::parse("00000000-0000-4000-8000-000000000002").expect("id"),
                role: StoredRole::User,
                content: "Hello".to_string(),
                sources: Vec::new(),
            }],
            created_at: Utc.with_ymd_and_hms(2026, 1, 29, 10, 15, 0).single().expect("date"),
        };

        let value = serde_json::to_value(&chat).expect("encode");
        assert_eq!(value["createdAt"], json!("2026-01-29T10:15:00Z"));
        assert_eq!(value["messages"][0]["role"], json!("user"));
        assert_eq!(value["id"], json!("00000000-0000-4000-8000-000000000001"));
    }

    #[test]
    fn missing_sources_default_to_empty() {
        let message: StoredMessage = serde_json::from_value(json!({
            "id": "00000000-0000-4000-8000-000000000002",
            "role": "assistant",
            "content": "Hi"
        }))
        .expect("decode");
        assert!(message.sources.is_empty());
    }

    #[test]
    fn fractional_timestamps_are_accepted() {
        let chat: StoredChat = serde_json::from_value(json!({
            "id": "00000000-0000-4000-8000-000000000001",
            "model": "m1",
            "messages": [],
            "createdAt": "2026-01-29T10:15:00.250+01:00"
        }))
        .expect("decode");
        assert_eq!(chat.created_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true), "2026-01-29T09:15:00Z");
        assert!(chat.is_empty());
    }
}
