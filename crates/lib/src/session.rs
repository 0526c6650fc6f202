//! Session identity: the user and the conversation stream they are attached to.

/// Opaque identifier of the authenticated actor. Not validated.
pub type UserId = String;

/// Unique session identifier (opaque string).
pub type SessionId = String;

/// A user bound to one session. A new user or an explicit reset mints a new session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub session_id: SessionId,
}

impl Identity {
    /// Bind `user_id` to a freshly generated session id. Returns `None` for a blank user.
    pub fn new(user_id: impl Into<UserId>) -> Option<Self> {
        let user_id = user_id.into();
        if user_id.trim().is_empty() {
            return None;
        }
        Some(Self {
            user_id,
            session_id: new_session_id(),
        })
    }

    /// Same user, new session.
    pub fn renewed(&self) -> Self {
        Self {
            user_id: self.user_id.clone(),
            session_id: new_session_id(),
        }
    }
}

pub fn new_session_id() -> SessionId {
    uuid::Uuid::new_v4().to_string()
}
