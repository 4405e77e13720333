use crate::message::SessionId;
use crate::navigation::NavigationFrame;
use crate::session::ChatSession;

/// Side effects the owner of a [`ChatCollection`] has to carry out after a mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionEffects {
    pub schedule_save: bool,
    /// Sessions whose in-flight stream was cancelled and whose task must be stopped.
    pub cancelled_streams: Vec<SessionId>,
}

/// Durable set of sessions plus the navigation stack.
///
/// Frames hold copies of sessions. Every method that can make a frame copy diverge from
/// its durable twin reconciles them (last writer wins, by id) before returning.
#[derive(Debug, Clone, Default)]
pub struct ChatCollection {
    sessions: Vec<ChatSession>,
    stack: Vec<NavigationFrame>,
    available_models: Vec<String>,
}

impl ChatCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sessions(&self) -> &[ChatSession] {
        &self.sessions
    }

    pub fn session(&self, id: SessionId) -> Option<&ChatSession> {
        self.sessions.iter().find(|session| session.id == id)
    }

    pub fn stack(&self) -> &[NavigationFrame] {
        &self.stack
    }

    pub fn available_models(&self) -> &[String] {
        &self.available_models
    }

    /// Session shown by the top frame, if that frame is a chat.
    pub fn navigated(&self) -> Option<&ChatSession> {
        self.stack.last().and_then(NavigationFrame::session)
    }

    pub fn navigated_id(&self) -> Option<SessionId> {
        self.navigated().map(|session| session.id)
    }

    /// Durable sessions, ready to be persisted.
    pub fn snapshot(&self) -> Vec<ChatSession> {
        self.sessions.clone()
    }

    /// True when every navigated copy equals its durable twin.
    pub fn is_consistent(&self) -> bool {
        self.stack
            .iter()
            .filter_map(NavigationFrame::session)
            .all(|copy| self.session(copy.id).is_none_or(|durable| durable == copy))
    }

    fn reconcile(&mut self) {
        for copy in self.stack.iter().filter_map(NavigationFrame::session) {
            if let Some(durable) = self.sessions.iter_mut().find(|session| session.id == copy.id) {
                *durable = copy.clone();
            }
        }
    }

    fn prune_empty(&mut self, keep: Option<SessionId>) -> bool {
        let before = self.sessions.len();
        self.sessions
            .retain(|session| !session.is_empty() || Some(session.id) == keep);
        let pruned = before - self.sessions.len();
        if pruned > 0 {
            tracing::debug!(pruned, "removed empty sessions");
        }
        pruned > 0
    }

    /// Cancels streams of every navigated session except `staying`, then reconciles.
    fn leave_frames(&mut self, staying: Option<SessionId>) -> Vec<SessionId> {
        let mut cancelled = Vec::new();
        for session in self.stack.iter_mut().filter_map(NavigationFrame::session_mut) {
            if Some(session.id) != staying && session.cancel().is_some() {
                cancelled.push(session.id);
            }
        }
        self.reconcile();
        cancelled
    }

    /// Starts a new session and makes it the only frame.
    pub fn create_session(&mut self, default_model: &str) -> (SessionId, CollectionEffects) {
        let cancelled_streams = self.leave_frames(None);
        let pruned = self.prune_empty(None);

        let session = ChatSession::new(default_model, self.available_models.clone());
        let session_id = session.id;
        self.sessions.insert(0, session.clone());
        self.stack = vec![NavigationFrame::Chat(session)];

        tracing::debug!(session_id = %session_id, model_id = %default_model, "created session");
        (
            session_id,
            CollectionEffects {
                schedule_save: pruned || !cancelled_streams.is_empty(),
                cancelled_streams,
            },
        )
    }

    /// Opens `session_id` as the only frame. Returns `None` for an unknown id.
    pub fn select_session(&mut self, session_id: SessionId) -> Option<CollectionEffects> {
        if self.session(session_id).is_none() {
            return None;
        }

        let cancelled_streams = self.leave_frames(Some(session_id));
        let pruned = self.prune_empty(Some(session_id));
        let session = self.session(session_id)?.clone();
        self.stack = vec![NavigationFrame::Chat(session)];

        Some(CollectionEffects {
            schedule_save: pruned || !cancelled_streams.is_empty(),
            cancelled_streams,
        })
    }

    pub fn open_settings(&mut self) -> CollectionEffects {
        let cancelled_streams = self.leave_frames(None);
        let pruned = self.prune_empty(None);
        self.stack = vec![NavigationFrame::Settings];

        CollectionEffects {
            schedule_save: pruned || !cancelled_streams.is_empty(),
            cancelled_streams,
        }
    }

    /// Pops the top frame; a popped chat is written back, or dropped when it is empty.
    pub fn pop(&mut self) -> CollectionEffects {
        let mut effects = CollectionEffects {
            schedule_save: true,
            cancelled_streams: Vec::new(),
        };

        let Some(NavigationFrame::Chat(mut session)) = self.stack.pop() else {
            return effects;
        };

        if session.cancel().is_some() {
            effects.cancelled_streams.push(session.id);
        }

        if session.is_empty() {
            self.sessions.retain(|durable| durable.id != session.id);
        } else if let Some(durable) = self
            .sessions
            .iter_mut()
            .find(|durable| durable.id == session.id)
        {
            *durable = session;
        }

        effects
    }

    pub fn delete_session(&mut self, session_id: SessionId) -> CollectionEffects {
        let streaming = self
            .stack
            .iter()
            .filter_map(NavigationFrame::session)
            .chain(self.sessions.iter())
            .any(|session| session.id == session_id && session.is_loading());

        self.sessions.retain(|session| session.id != session_id);
        self.stack
            .retain(|frame| frame.session_id() != Some(session_id));

        tracing::debug!(session_id = %session_id, streaming, "deleted session");
        CollectionEffects {
            schedule_save: true,
            cancelled_streams: if streaming { vec![session_id] } else { Vec::new() },
        }
    }

    /// Pushes a freshly loaded catalog into every durable and navigated session.
    pub fn apply_model_catalog(&mut self, models: Vec<String>) {
        for session in &mut self.sessions {
            session.available_models = models.clone();
        }
        for session in self.stack.iter_mut().filter_map(NavigationFrame::session_mut) {
            session.available_models = models.clone();
        }
        self.available_models = models;
    }

    /// Adds restored sessions whose ids are not already live.
    ///
    /// Creates a fresh session when the collection is still empty afterwards and returns
    /// its id together with the effects of creating it.
    pub fn merge_restored(
        &mut self,
        restored: Vec<ChatSession>,
        default_model: &str,
    ) -> Option<(SessionId, CollectionEffects)> {
        let mut merged = 0usize;
        for session in restored {
            if self.session(session.id).is_some() {
                continue;
            }
            self.sessions.push(session);
            merged += 1;
        }
        tracing::debug!(merged, total = self.sessions.len(), "merged restored sessions");

        if self.sessions.is_empty() {
            return Some(self.create_session(default_model));
        }
        None
    }

    /// Mutates one session (its navigated copy when there is one) and reconciles.
    pub fn update_session<R>(
        &mut self,
        session_id: SessionId,
        update: impl FnOnce(&mut ChatSession) -> R,
    ) -> Option<R> {
        let navigated = self
            .stack
            .iter_mut()
            .rev()
            .filter_map(NavigationFrame::session_mut)
            .find(|session| session.id == session_id);

        let result = match navigated {
            Some(session) => Some(update(session)),
            None => self
                .sessions
                .iter_mut()
                .find(|session| session.id == session_id)
                .map(update),
        };

        self.reconcile();
        result
    }
}
