use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::RegistryError;

pub const MAX_ACTOR_LEN: usize = 128;

/// Identity of whoever writes or reads a patient's records (a doctor, a session).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ActorId(String);

impl ActorId {
    pub fn new(raw: impl AsRef<str>) -> Result<Self, RegistryError> {
        let trimmed = raw.as_ref().trim();
        if trimmed.is_empty() {
            return Err(RegistryError::InvalidActor {
                reason: "actor id is empty",
            });
        }
        if trimmed.chars().count() > MAX_ACTOR_LEN {
            return Err(RegistryError::InvalidActor {
                reason: "actor id is too long",
            });
        }
        if trimmed.chars().any(char::is_control) {
            return Err(RegistryError::InvalidActor {
                reason: "actor id contains control characters",
            });
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ActorId {
    type Error = RegistryError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::new(raw)
    }
}

impl From<ActorId> for String {
    fn from(actor: ActorId) -> Self {
        actor.0
    }
}
