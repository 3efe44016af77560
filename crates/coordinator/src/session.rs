use sequence::ProgressTracker;
use shared::{
    domain::{CompletionState, ParticipantRecord, StepId, StudyId},
    error::StudyError,
    protocol::SessionView,
};

/// Transient in-memory view of one participant's run through a study.
#[derive(Debug, Clone)]
pub struct StudySession {
    pub(crate) study_id: StudyId,
    pub(crate) record: ParticipantRecord,
    pub(crate) tracker: ProgressTracker,
}

impl StudySession {
    pub(crate) fn new(study_id: StudyId, record: ParticipantRecord, tracker: ProgressTracker) -> Self {
        Self {
            study_id,
            record,
            tracker,
        }
    }

    pub fn study_id(&self) -> &StudyId {
        &self.study_id
    }

    pub fn record(&self) -> &ParticipantRecord {
        &self.record
    }

    pub fn tracker(&self) -> &ProgressTracker {
        &self.tracker
    }

    pub fn current_step_id(&self) -> Option<&StepId> {
        self.tracker.current_step_id()
    }

    pub fn current_index(&self) -> Option<usize> {
        self.tracker.current_index()
    }

    pub fn progress_fraction(&self) -> f64 {
        self.tracker.progress_fraction()
    }

    pub fn is_first(&self) -> bool {
        self.tracker.is_first()
    }

    pub fn is_last(&self) -> bool {
        self.tracker.is_last()
    }

    pub fn is_complete(&self) -> bool {
        self.record.completion_state == CompletionState::Completed
    }

    pub(crate) fn ensure_open(&self) -> Result<(), StudyError> {
        if self.record.completion_state.is_terminal() {
            return Err(StudyError::SessionClosed(self.record.completion_state));
        }
        Ok(())
    }

    pub fn view(&self) -> SessionView {
        SessionView {
            study_id: self.study_id.clone(),
            participant: self.record.clone(),
            current_step_id: self.tracker.current_step_id().cloned(),
            total_steps: self.tracker.sequence().len(),
            progress_fraction: self.tracker.progress_fraction(),
            progress_percent: self.tracker.progress_percent(),
            is_first: self.tracker.is_first(),
            is_last: self.tracker.is_last(),
            is_complete: self.is_complete(),
        }
    }
}
