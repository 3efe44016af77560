use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

macro_rules! name_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
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
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

name_newtype!(StudyId);
name_newtype!(ParticipantId);
name_newtype!(ConditionName);
name_newtype!(StepId);

impl ParticipantId {
    /// Fresh random identifier for a participant who arrives without one.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// Stored index of a participant who has not opened the first step yet.
pub const NOT_STARTED: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionState {
    InProgress,
    Completed,
    Abandoned,
}

impl CompletionState {
    pub fn as_str(self) -> &'static str {
        match self {
            CompletionState::InProgress => "in_progress",
            CompletionState::Completed => "completed",
            CompletionState::Abandoned => "abandoned",
        }
    }

    /// `completed` and `abandoned` are never left once entered.
    pub fn is_terminal(self) -> bool {
        !matches!(self, CompletionState::InProgress)
    }
}

impl fmt::Display for CompletionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown completion state '{0}'")]
pub struct UnknownCompletionState(pub String);

impl FromStr for CompletionState {
    type Err = UnknownCompletionState;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "in_progress" => Ok(CompletionState::InProgress),
            "completed" => Ok(CompletionState::Completed),
            "abandoned" => Ok(CompletionState::Abandoned),
            other => Err(UnknownCompletionState(other.to_string())),
        }
    }
}

/// Persisted per-participant assignment and progress state.
///
/// The four fields are the stable record shape shared by every backend.
/// `current_step_index` is [`NOT_STARTED`] until the first step is opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantRecord {
    pub participant_id: ParticipantId,
    pub assigned_condition: ConditionName,
    pub current_step_index: i64,
    pub completion_state: CompletionState,
}

impl ParticipantRecord {
    pub fn new(participant_id: ParticipantId, assigned_condition: ConditionName) -> Self {
        Self {
            participant_id,
            assigned_condition,
            current_step_index: NOT_STARTED,
            completion_state: CompletionState::InProgress,
        }
    }

    pub fn has_started(&self) -> bool {
        self.current_step_index > NOT_STARTED
    }
}
