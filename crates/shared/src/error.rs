use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{CompletionState, ConditionName, StepId, StudyId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    Validation,
    Conflict,
    SpecInvalid,
    AssignmentUnavailable,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Malformed or ambiguous study specification.
///
/// Raised at study-load time by validation and by the flattener; never
/// recoverable by a participant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpecError {
    #[error("group at {path} has no children matching condition '{condition}'")]
    EmptyGroup {
        path: GroupPath,
        condition: ConditionName,
    },
    #[error("step '{0}' appears more than once")]
    DuplicateStep(StepId),
    #[error("condition '{0}' is declared more than once")]
    DuplicateCondition(ConditionName),
    #[error("group at {path} selects undeclared condition '{condition}'")]
    UnknownCondition {
        path: GroupPath,
        condition: ConditionName,
    },
    #[error("participant is assigned to undeclared condition '{0}'")]
    UnassignableCondition(ConditionName),
    #[error("study '{0}' is defined more than once")]
    DuplicateStudy(StudyId),
    #[error("study file {file} is not a valid study specification: {message}")]
    Unreadable { file: String, message: String },
}

/// Authored child indices from the root group down to a nested group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct GroupPath(pub Vec<usize>);

impl std::fmt::Display for GroupPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("root")?;
        for index in &self.0 {
            write!(f, "/{index}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum StudyError {
    #[error(transparent)]
    Spec(#[from] SpecError),
    #[error("study '{0}' declares no conditions to assign")]
    AssignmentUnavailable(StudyId),
    #[error("step {index} is the last of {len}; cannot advance further")]
    SequenceExhausted { index: usize, len: usize },
    #[error("completion requires the final step to be open")]
    NotAtFinalStep,
    #[error("participant session is already {0}")]
    SessionClosed(CompletionState),
    #[error("unknown study '{0}'")]
    UnknownStudy(StudyId),
    #[error("unknown participant '{0}'")]
    UnknownParticipant(String),
    #[error("storage backend failure: {0:#}")]
    Backend(#[source] anyhow::Error),
}

impl StudyError {
    pub fn code(&self) -> ErrorCode {
        match self {
            StudyError::Spec(_) => ErrorCode::SpecInvalid,
            StudyError::AssignmentUnavailable(_) => ErrorCode::AssignmentUnavailable,
            StudyError::SequenceExhausted { .. } | StudyError::NotAtFinalStep => {
                ErrorCode::Validation
            }
            StudyError::SessionClosed(_) => ErrorCode::Conflict,
            StudyError::UnknownStudy(_) | StudyError::UnknownParticipant(_) => ErrorCode::NotFound,
            StudyError::Backend(_) => ErrorCode::Internal,
        }
    }
}

impl From<StudyError> for ApiError {
    fn from(value: StudyError) -> Self {
        let code = value.code();
        // Backend detail stays in the logs.
        let message = match &value {
            StudyError::Backend(_) => "study storage is unavailable".to_string(),
            other => other.to_string(),
        };
        ApiError::new(code, message)
    }
}
