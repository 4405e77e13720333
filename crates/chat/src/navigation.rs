use crate::message::SessionId;
use crate::session::ChatSession;

/// One entry of the navigation stack.
///
/// A chat frame holds its own copy of the session; the collection reconciles that copy
/// back into the durable set after every mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum NavigationFrame {
    Chat(ChatSession),
    Settings,
}

impl NavigationFrame {
    pub fn session(&self) -> Option<&ChatSession> {
        match self {
            Self::Chat(session) => Some(session),
            Self::Settings => None,
        }
    }

    pub fn session_mut(&mut self) -> Option<&mut ChatSession> {
        match self {
            Self::Chat(session) => Some(session),
            Self::Settings => None,
        }
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session().map(|session| session.id)
    }
}
