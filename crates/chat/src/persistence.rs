use lama_storage::{StoredChat, StoredMessage, StoredRole};

use crate::message::{Message, MessageContent, Role};
use crate::session::ChatSession;

/// Text-only snapshot of a session for the chat store.
///
/// System turns and assistant bubbles that never received content are left out; image
/// blocks are reduced to their text.
pub fn to_stored(session: &ChatSession) -> StoredChat {
    let messages = session
        .transcript
        .iter()
        .filter(|message| !message.is_empty_placeholder())
        .filter_map(|message| {
            let role = match message.role {
                Role::User => StoredRole::User,
                Role::Assistant => StoredRole::Assistant,
                Role::System => return None,
            };
            Some(StoredMessage {
                id: message.id,
                role,
                content: message.text(),
                sources: message.sources.clone(),
            })
        })
        .collect();

    StoredChat {
        id: session.id,
        model: session.selected_model.clone(),
        messages,
        created_at: session.created_at,
    }
}

/// Idle session rebuilt from a stored chat. Its model list stays empty until a catalog
/// arrives.
pub fn from_stored(chat: StoredChat) -> ChatSession {
    let transcript = chat
        .messages
        .into_iter()
        .map(|stored| {
            let role = match stored.role {
                StoredRole::User => Role::User,
                StoredRole::Assistant => Role::Assistant,
            };
            Message {
                id: stored.id,
                role,
                content: MessageContent::Text(stored.content),
                sources: stored.sources,
                reasoning: None,
            }
        })
        .collect();

    ChatSession::restored(chat.id, chat.created_at, chat.model, transcript)
}

pub fn snapshot_to_stored(sessions: &[ChatSession]) -> Vec<StoredChat> {
    sessions
        .iter()
        .filter(|session| !session.is_empty())
        .map(to_stored)
        .collect()
}

#[cfg(test)]
mod tests {
    use lama_storage::WebSource;

    use super::*;
    use crate::message::{ContentBlock, ImageRef};

    #[test]
    fn stored_form_keeps_text_and_sources_only() {
        let mut session = ChatSession::new("gemma3:4b", vec!["gemma3:4b".to_string()]);
        session.transcript.push(Message::new(Role::System, MessageContent::Text("sys".into())));
        session.transcript.push(Message::new(
            Role::User,
            MessageContent::Blocks(vec![
                ContentBlock::Text("what is this".to_string()),
                ContentBlock::Image(ImageRef {
                    url: "data:image/jpeg;base64,AAAA".to_string(),
                }),
            ]),
        ));
        let mut answer = Message::assistant("a cat");
        answer.sources.push(WebSource {
            title: "Cats".to_string(),
            url: "https://example.org/cats".to_string(),
        });
        answer.reasoning = Some("looks furry".to_string());
        session.transcript.push(answer);
        session.transcript.push(Message::assistant(""));

        let stored = to_stored(&session);
        assert_eq!(stored.id, session.id);
        assert_eq!(stored.model, "gemma3:4b");
        assert_eq!(stored.created_at, session.created_at);
        assert_eq!(stored.messages.len(), 2);
        assert_eq!(stored.messages[0].role, StoredRole::User);
        assert_eq!(stored.messages[0].content, "what is this");
        assert_eq!(stored.messages[1].sources.len(), 1);
    }

    #[test]
    fn restored_session_is_idle_with_empty_catalog() {
        let mut session = ChatSession::new("m1", vec!["m1".to_string(), "m2".to_string()]);
        session.transcript.push(Message::user("hi"));
        session.transcript.push(Message::assistant("hello"));

        let restored = from_stored(to_stored(&session));
        assert_eq!(restored.id, session.id);
        assert_eq!(restored.selected_model, "m1");
        assert!(restored.available_models.is_empty());
        assert!(!restored.is_loading());
        assert_eq!(restored.transcript.len(), 2);
        assert_eq!(restored.transcript[0].id, session.transcript[0].id);
        assert_eq!(restored.transcript[1].text(), "hello");
    }

    #[test]
    fn snapshot_skips_empty_sessions() {
        let empty = ChatSession::new("m1", Vec::new());
        let mut used = ChatSession::new("m1", Vec::new());
        used.transcript.push(Message::user("hi"));

        let stored = snapshot_to_stored(&[empty, used.clone()]);
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, used.id);
    }
}
