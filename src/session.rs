use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of one scheduled call, owned by the booking side.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

/// Identifier of one call participant; used as the signaling sender id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

macro_rules! string_id {
    ($name:ident) => {
        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self::new(id)
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(SessionId);
string_id!(ParticipantId);

/// Which half of the offer/answer exchange the local participant plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Caller,
    Callee,
}

/// A two-party session as seen from one participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: SessionId,
    pub caller: ParticipantId,
    pub callee: ParticipantId,
}

impl Session {
    pub fn new(
        id: impl Into<SessionId>,
        caller: impl Into<ParticipantId>,
        callee: impl Into<ParticipantId>,
    ) -> Self {
        Self {
            id: id.into(),
            caller: caller.into(),
            callee: callee.into(),
        }
    }

    /// Role of `participant`, or `None` if it is not a member of this session.
    pub fn role_of(&self, participant: &ParticipantId) -> Option<Role> {
        if *participant == self.caller {
            Some(Role::Caller)
        } else if *participant == self.callee {
            Some(Role::Callee)
        } else {
            None
        }
    }

    pub fn peer_of(&self, participant: &ParticipantId) -> Option<&ParticipantId> {
        match self.role_of(participant)? {
            Role::Caller => Some(&self.callee),
            Role::Callee => Some(&self.caller),
        }
    }
}
