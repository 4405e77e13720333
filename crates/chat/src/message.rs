use lama_llm::{ContentBlock as WireBlock, WireMessage, WireRole};
pub use lama_storage::{MessageId, SessionId, WebSource};

/// Chat speaker role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    System,
    User,
    Assistant,
}

impl From<Role> for WireRole {
    fn from(role: Role) -> Self {
        match role {
            Role::System => WireRole::System,
            Role::User => WireRole::User,
            Role::Assistant => WireRole::Assistant,
        }
    }
}

/// Image carried by a message: a `data:` URI or a remote URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentBlock {
    Text(String),
    Image(ImageRef),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl Default for MessageContent {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

impl MessageContent {
    /// Text projection used for history turns and persistence.
    pub fn text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Blocks(blocks) => blocks
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::Text(text) => Some(text.as_str()),
                    ContentBlock::Image(_) => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn images(&self) -> impl Iterator<Item = &ImageRef> {
        let blocks = match self {
            Self::Text(_) => &[][..],
            Self::Blocks(blocks) => blocks.as_slice(),
        };
        blocks.iter().filter_map(|block| match block {
            ContentBlock::Image(image) => Some(image),
            ContentBlock::Text(_) => None,
        })
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(text) => text.is_empty(),
            Self::Blocks(blocks) => blocks.iter().all(|block| match block {
                ContentBlock::Text(text) => text.is_empty(),
                ContentBlock::Image(_) => false,
            }),
        }
    }

    pub fn push_str(&mut self, chunk: &str) {
        match self {
            Self::Text(text) => text.push_str(chunk),
            Self::Blocks(blocks) => match blocks.last_mut() {
                Some(ContentBlock::Text(text)) => text.push_str(chunk),
                _ => blocks.push(ContentBlock::Text(chunk.to_string())),
            },
        }
    }

    fn to_wire_blocks(&self) -> Vec<WireBlock> {
        match self {
            Self::Text(text) => vec![WireBlock::text(text.clone())],
            Self::Blocks(blocks) => blocks
                .iter()
                .map(|block| match block {
                    ContentBlock::Text(text) => WireBlock::text(text.clone()),
                    ContentBlock::Image(image) => WireBlock::image_url(image.url.clone()),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: MessageContent,
    pub sources: Vec<WebSource>,
    pub reasoning: Option<String>,
}

impl Message {
    pub fn new(role: Role, content: MessageContent) -> Self {
        Self {
            id: MessageId::new_v4(),
            role,
            content,
            sources: Vec::new(),
            reasoning: None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, MessageContent::Text(text.into()))
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, MessageContent::Text(text.into()))
    }

    pub fn text(&self) -> String {
        self.content.text()
    }

    /// True for an assistant bubble that received neither content nor reasoning.
    pub fn is_empty_placeholder(&self) -> bool {
        self.role == Role::Assistant
            && self.content.is_empty()
            && self.reasoning.as_deref().is_none_or(str::is_empty)
    }

    /// Text-only wire form, used for every historical turn.
    pub fn to_wire_text(&self) -> WireMessage {
        WireMessage::text(self.role.into(), self.text())
    }

    /// Full wire form; image blocks survive only here.
    pub fn to_wire_multimodal(&self) -> WireMessage {
        match &self.content {
            MessageContent::Text(_) => self.to_wire_text(),
            MessageContent::Blocks(_) => {
                WireMessage::blocks(self.role.into(), self.content.to_wire_blocks())
            }
        }
    }
}

/// Raw attachment handed to `submit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attachment {
    /// Encoded image bytes (PNG, JPEG, ...); resized and re-encoded before sending.
    ImageData(Vec<u8>),
    /// Already-hosted image, forwarded as-is.
    ImageUrl(String),
}

#[cfg(test)]
mod tests {
    use lama_llm::WireContent;

    use super::*;

    #[test]
    fn block_content_flattens_to_text() {
        let content = MessageContent::Blocks(vec![
            ContentBlock::Text("look".to_string()),
            ContentBlock::Image(ImageRef {
                url: "https://example.com/a.png".to_string(),
            }),
        ]);
        assert_eq!(content.text(), "look");
        assert_eq!(content.images().count(), 1);
        assert!(!content.is_empty());
    }

    #[test]
    fn history_turns_are_text_only() {
        let mut message = Message::user("");
        message.content = MessageContent::Blocks(vec![
            ContentBlock::Text("describe".to_string()),
            ContentBlock::Image(ImageRef {
                url: "data:image/jpeg;base64,AAAA".to_string(),
            }),
        ]);

        assert_eq!(
            message.to_wire_text().content,
            WireContent::Text("describe".to_string())
        );
        assert_eq!(message.to_wire_multimodal().content.image_urls().len(), 1);
    }

    #[test]
    fn placeholder_detection_counts_reasoning() {
        let mut message = Message::assistant("");
        assert!(message.is_empty_placeholder());
        message.reasoning = Some("thinking".to_string());
        assert!(!message.is_empty_placeholder());
        assert!(!Message::user("").is_empty_placeholder());
    }
}
