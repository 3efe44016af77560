use sequence::{flatten, FlatSequence, ProgressTracker, StudySpec};
use shared::{
    domain::{CompletionState, ConditionName, ParticipantId, ParticipantRecord, StudyId, NOT_STARTED},
    error::{SpecError, StudyError},
};
use tracing::{debug, info, warn};

use crate::{
    session::StudySession,
    store::{CreateOutcome, ParticipantStore},
};

/// Result of [`AssignmentCoordinator::get_or_create_participant`].
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub record: ParticipantRecord,
    pub sequence: FlatSequence,
    /// `true` only for the call that actually created the record.
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextParticipant {
    pub abandoned: Option<ParticipantId>,
    pub next_participant_id: ParticipantId,
    pub redirect_to: String,
}

/// Stateless coordinator; all shared state lives behind the store, so any
/// number of coordinators may serve the same backend.
#[derive(Debug, Clone)]
pub struct AssignmentCoordinator<S: ParticipantStore> {
    store: S,
}

impl<S: ParticipantStore> AssignmentCoordinator<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Returns the participant's record, creating and assigning one on first
    /// access. Repeated calls never re-assign.
    pub async fn get_or_create_participant(
        &self,
        spec: &StudySpec,
        participant_id: &ParticipantId,
    ) -> Result<Assignment, StudyError> {
        let study_id = &spec.study_id;
        if let Some(record) = self
            .store
            .read_participant(study_id, participant_id)
            .await
            .map_err(StudyError::Backend)?
        {
            let sequence = sequence_for(spec, &record)?;
            return Ok(Assignment {
                record,
                sequence,
                created: false,
            });
        }

        if spec.conditions.is_empty() {
            return Err(StudyError::AssignmentUnavailable(study_id.clone()));
        }

        self.store
            .register_conditions(study_id, &spec.conditions)
            .await
            .map_err(StudyError::Backend)?;
        let (condition, count) = self
            .store
            .claim_least_assigned(study_id)
            .await
            .map_err(StudyError::Backend)?
            .ok_or_else(|| StudyError::AssignmentUnavailable(study_id.clone()))?;

        let sequence = match flatten(spec, &condition, participant_id) {
            Ok(sequence) => sequence,
            Err(err) => {
                self.release_claim(study_id, &condition).await;
                return Err(err.into());
            }
        };

        let outcome = match self
            .store
            .create_participant(study_id, participant_id, &condition, NOT_STARTED)
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                self.release_claim(study_id, &condition).await;
                return Err(StudyError::Backend(err));
            }
        };

        match outcome {
            CreateOutcome::Created(record) => {
                info!(
                    %study_id,
                    %participant_id,
                    %condition,
                    assigned_count = count,
                    "assigned participant"
                );
                Ok(Assignment {
                    record,
                    sequence,
                    created: true,
                })
            }
            CreateOutcome::Existing(record) => {
                debug!(
                    %study_id,
                    %participant_id,
                    "participant created concurrently; releasing duplicate claim"
                );
                self.release_claim(study_id, &condition).await;
                let sequence = sequence_for(spec, &record)?;
                Ok(Assignment {
                    record,
                    sequence,
                    created: false,
                })
            }
        }
    }

    pub async fn open_session(
        &self,
        spec: &StudySpec,
        participant_id: &ParticipantId,
    ) -> Result<StudySession, StudyError> {
        let assignment = self.get_or_create_participant(spec, participant_id).await?;
        Ok(session_from(spec.study_id.clone(), assignment))
    }

    /// Opens a session for an existing participant without assigning one.
    pub async fn resume_session(
        &self,
        spec: &StudySpec,
        participant_id: &ParticipantId,
    ) -> Result<StudySession, StudyError> {
        let record = self
            .store
            .read_participant(&spec.study_id, participant_id)
            .await
            .map_err(StudyError::Backend)?
            .ok_or_else(|| StudyError::UnknownParticipant(participant_id.to_string()))?;
        let sequence = sequence_for(spec, &record)?;
        Ok(session_from(
            spec.study_id.clone(),
            Assignment {
                record,
                sequence,
                created: false,
            },
        ))
    }

    /// Moves one step forward and persists the new index.
    ///
    /// Advancing past the end is logged and ignored. Persistence failures are
    /// logged; the in-memory move stands.
    pub async fn advance(&self, session: &mut StudySession) -> Result<Option<usize>, StudyError> {
        session.ensure_open()?;
        match session.tracker.advance() {
            Ok(_) => {}
            Err(StudyError::SequenceExhausted { index, len }) => {
                warn!(
                    study_id = %session.study_id,
                    participant_id = %session.record.participant_id,
                    index,
                    len,
                    "advance requested past the final step; ignoring"
                );
                return Ok(session.tracker.current_index());
            }
            Err(err) => return Err(err),
        }
        self.persist(session, CompletionState::InProgress).await;
        Ok(session.tracker.current_index())
    }

    /// Moves one step back (floored at the first step) and persists.
    pub async fn retreat(&self, session: &mut StudySession) -> Result<Option<usize>, StudyError> {
        session.ensure_open()?;
        let before = session.tracker.current_index();
        let after = session.tracker.retreat();
        if before != after {
            self.persist(session, CompletionState::InProgress).await;
        }
        Ok(after)
    }

    /// Records the participant's confirmation on the final step.
    pub async fn complete(&self, session: &mut StudySession) -> Result<(), StudyError> {
        session.ensure_open()?;
        session.tracker.confirm_completion()?;
        self.persist(session, CompletionState::Completed).await;
        info!(
            study_id = %session.study_id,
            participant_id = %session.record.participant_id,
            "participant completed study"
        );
        Ok(())
    }

    /// Explicit abandonment. Returns `false` when the record was already
    /// terminal.
    pub async fn abandon(
        &self,
        study_id: &StudyId,
        participant_id: &ParticipantId,
    ) -> Result<bool, StudyError> {
        let record = self
            .store
            .read_participant(study_id, participant_id)
            .await
            .map_err(StudyError::Backend)?
            .ok_or_else(|| StudyError::UnknownParticipant(participant_id.to_string()))?;
        if record.completion_state.is_terminal() {
            return Ok(false);
        }
        let changed = self
            .store
            .update_progress(
                study_id,
                participant_id,
                record.current_step_index,
                CompletionState::Abandoned,
            )
            .await
            .map_err(StudyError::Backend)?;
        if changed {
            info!(%study_id, %participant_id, "participant abandoned");
        }
        Ok(changed)
    }

    /// Operator "next participant": abandons the current session if it never
    /// completed, then hands back a fresh id and the study entry point.
    ///
    /// Backend failures while abandoning are logged and never block the
    /// hand-off.
    pub async fn assign_next_participant(
        &self,
        spec: &StudySpec,
        current: Option<&ParticipantId>,
    ) -> NextParticipant {
        let study_id = &spec.study_id;
        let mut abandoned = None;
        if let Some(participant_id) = current {
            match self.abandon(study_id, participant_id).await {
                Ok(true) => abandoned = Some(participant_id.clone()),
                Ok(false) => {}
                Err(StudyError::UnknownParticipant(_)) => {
                    debug!(%study_id, %participant_id, "no session to abandon");
                }
                Err(err) => {
                    warn!(%study_id, %participant_id, error = %err, "failed to abandon session");
                }
            }
        }

        NextParticipant {
            abandoned,
            next_participant_id: ParticipantId::generate(),
            redirect_to: format!("/{study_id}"),
        }
    }

    async fn persist(&self, session: &mut StudySession, state: CompletionState) {
        let index = session.tracker.stored_index();
        session.record.current_step_index = index;
        session.record.completion_state = state;
        match self
            .store
            .update_progress(
                &session.study_id,
                &session.record.participant_id,
                index,
                state,
            )
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!(
                study_id = %session.study_id,
                participant_id = %session.record.participant_id,
                "stored record is missing or already closed; progress not written"
            ),
            Err(error) => warn!(
                study_id = %session.study_id,
                participant_id = %session.record.participant_id,
                index,
                error = %error,
                "failed to persist progress; continuing"
            ),
        }
    }

    async fn release_claim(&self, study_id: &StudyId, condition: &ConditionName) {
        if let Err(error) = self.store.release_condition(study_id, condition).await {
            warn!(%study_id, %condition, error = %error, "failed to release condition claim");
        }
    }
}

fn sequence_for(spec: &StudySpec, record: &ParticipantRecord) -> Result<FlatSequence, StudyError> {
    if !spec.declares(&record.assigned_condition) {
        return Err(SpecError::UnassignableCondition(record.assigned_condition.clone()).into());
    }
    Ok(flatten(
        spec,
        &record.assigned_condition,
        &record.participant_id,
    )?)
}

fn session_from(study_id: StudyId, assignment: Assignment) -> StudySession {
    let Assignment {
        record, sequence, ..
    } = assignment;
    let tracker = ProgressTracker::resume(
        sequence,
        record.current_step_index,
        record.completion_state == CompletionState::Completed,
    );
    StudySession::new(study_id, record, tracker)
}
