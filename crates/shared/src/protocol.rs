use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    CompletionState, ConditionName, ParticipantId, ParticipantRecord, StepId, StudyId,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudySummary {
    pub study_id: StudyId,
    pub title: String,
}

/// Pass-through presentation settings read by the study header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyHeader {
    pub study_id: StudyId,
    pub title: String,
    pub with_progress_bar: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo_path: Option<String>,
    pub help_text_available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_email: Option<String>,
}

/// Everything the presentation layer needs to render one participant's position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionView {
    pub study_id: StudyId,
    pub participant: ParticipantRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step_id: Option<StepId>,
    pub total_steps: usize,
    pub progress_fraction: f64,
    pub progress_percent: f64,
    pub is_first: bool,
    pub is_last: bool,
    pub is_complete: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartSessionRequest {
    #[serde(default)]
    pub participant_id: Option<ParticipantId>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NextParticipantRequest {
    #[serde(default)]
    pub current_participant_id: Option<ParticipantId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NextParticipantResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abandoned: Option<ParticipantId>,
    pub next_participant_id: ParticipantId,
    pub redirect_to: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionTally {
    pub in_progress: u64,
    pub completed: u64,
    pub abandoned: u64,
}

impl CompletionTally {
    pub fn record(&mut self, state: CompletionState, count: u64) {
        match state {
            CompletionState::InProgress => self.in_progress += count,
            CompletionState::Completed => self.completed += count,
            CompletionState::Abandoned => self.abandoned += count,
        }
    }

    pub fn total(&self) -> u64 {
        self.in_progress + self.completed + self.abandoned
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudyStats {
    pub study_id: StudyId,
    pub condition_counters: BTreeMap<ConditionName, i64>,
    pub participants: CompletionTally,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum StudyEvent {
    ParticipantAssigned {
        study_id: StudyId,
        participant_id: ParticipantId,
        condition: ConditionName,
        at: DateTime<Utc>,
    },
    ProgressUpdated {
        study_id: StudyId,
        participant_id: ParticipantId,
        current_step_index: i64,
        at: DateTime<Utc>,
    },
    ParticipantCompleted {
        study_id: StudyId,
        participant_id: ParticipantId,
        at: DateTime<Utc>,
    },
    ParticipantAbandoned {
        study_id: StudyId,
        participant_id: ParticipantId,
        at: DateTime<Utc>,
    },
}
