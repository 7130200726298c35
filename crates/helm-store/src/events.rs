use helm_core::ids::{MessageId, SessionId};

/// Change notification published after every successful write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreEvent {
    SessionCreated(SessionId),
    SessionUpdated(SessionId),
    SessionDeleted(SessionId),
    MessageCreated {
        session_id: SessionId,
        message_id: MessageId,
    },
    MessageUpdated {
        session_id: SessionId,
        message_id: MessageId,
    },
}

impl StoreEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::SessionCreated(id) | Self::SessionUpdated(id) | Self::SessionDeleted(id) => id,
            Self::MessageCreated { session_id, .. } | Self::MessageUpdated { session_id, .. } => {
                session_id
            }
        }
    }
}
