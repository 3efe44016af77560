use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use shared::{
    domain::{CompletionState, ConditionName, ParticipantId, ParticipantRecord, StudyId},
    protocol::CompletionTally,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    Created(ParticipantRecord),
    /// Another caller created the record first; this is theirs, untouched.
    Existing(ParticipantRecord),
}

impl CreateOutcome {
    pub fn record(&self) -> &ParticipantRecord {
        match self {
            CreateOutcome::Created(record) | CreateOutcome::Existing(record) => record,
        }
    }

    pub fn into_record(self) -> ParticipantRecord {
        match self {
            CreateOutcome::Created(record) | CreateOutcome::Existing(record) => record,
        }
    }

    pub fn was_created(&self) -> bool {
        matches!(self, CreateOutcome::Created(_))
    }
}

/// Persistence for participant records and condition counters.
///
/// Every operation is scoped to one study. Implementations own the records;
/// callers only ever hold transient copies.
#[async_trait]
pub trait ParticipantStore: Send + Sync {
    async fn read_participant(
        &self,
        study_id: &StudyId,
        participant_id: &ParticipantId,
    ) -> Result<Option<ParticipantRecord>>;

    /// Inserts a fresh `in_progress` record unless one already exists for
    /// the id, atomically. Never overwrites.
    async fn create_participant(
        &self,
        study_id: &StudyId,
        participant_id: &ParticipantId,
        condition: &ConditionName,
        initial_index: i64,
    ) -> Result<CreateOutcome>;

    /// Writes index and state for a record that is still `in_progress`.
    /// Returns `false` when no such record exists or it is already terminal.
    async fn update_progress(
        &self,
        study_id: &StudyId,
        participant_id: &ParticipantId,
        index: i64,
        state: CompletionState,
    ) -> Result<bool>;

    async fn increment_condition_counter(
        &self,
        study_id: &StudyId,
        condition: &ConditionName,
    ) -> Result<i64>;

    async fn read_condition_counters(
        &self,
        study_id: &StudyId,
    ) -> Result<BTreeMap<ConditionName, i64>>;

    /// Marks exactly `conditions` as assignable, in declaration order.
    /// Counts of previously known conditions are kept.
    async fn register_conditions(
        &self,
        study_id: &StudyId,
        conditions: &[ConditionName],
    ) -> Result<()>;

    /// Selects the assignable condition with the lowest count (ties go to the
    /// earliest declared) and increments it, as one atomic step.
    async fn claim_least_assigned(
        &self,
        study_id: &StudyId,
    ) -> Result<Option<(ConditionName, i64)>>;

    /// Undoes one claim on `condition`.
    async fn release_condition(&self, study_id: &StudyId, condition: &ConditionName)
        -> Result<()>;

    async fn completion_tally(&self, study_id: &StudyId) -> Result<CompletionTally>;
}
