use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::{
    domain::{CompletionState, ConditionName, ParticipantId, ParticipantRecord, StudyId},
    protocol::CompletionTally,
};

use crate::store::{CreateOutcome, ParticipantStore};

#[derive(Debug, Clone)]
struct Counter {
    condition: ConditionName,
    assigned: i64,
    active: bool,
}

#[derive(Debug, Default)]
struct Inner {
    records: HashMap<(StudyId, ParticipantId), ParticipantRecord>,
    counters: HashMap<StudyId, Vec<Counter>>,
}

/// In-process store for coordinator tests. Reads yield to the scheduler so
/// concurrent callers interleave between read and create.
#[derive(Debug, Clone, Default)]
pub(crate) struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    fail_updates: Arc<AtomicBool>,
}

impl MemoryStore {
    pub(crate) fn fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn record(&self, study: &str, id: &str) -> Option<ParticipantRecord> {
        self.inner
            .lock()
            .expect("lock")
            .records
            .get(&(StudyId::from(study), ParticipantId::from(id)))
            .cloned()
    }

    pub(crate) fn record_count(&self) -> usize {
        self.inner.lock().expect("lock").records.len()
    }
}

#[async_trait]
impl ParticipantStore for MemoryStore {
    async fn read_participant(
        &self,
        study_id: &StudyId,
        participant_id: &ParticipantId,
    ) -> Result<Option<ParticipantRecord>> {
        let found = self
            .inner
            .lock()
            .expect("lock")
            .records
            .get(&(study_id.clone(), participant_id.clone()))
            .cloned();
        tokio::task::yield_now().await;
        Ok(found)
    }

    async fn create_participant(
        &self,
        study_id: &StudyId,
        participant_id: &ParticipantId,
        condition: &ConditionName,
        initial_index: i64,
    ) -> Result<CreateOutcome> {
        let mut inner = self.inner.lock().expect("lock");
        let key = (study_id.clone(), participant_id.clone());
        if let Some(existing) = inner.records.get(&key) {
            return Ok(CreateOutcome::Existing(existing.clone()));
        }
        let mut record = ParticipantRecord::new(participant_id.clone(), condition.clone());
        record.current_step_index = initial_index;
        inner.records.insert(key, record.clone());
        Ok(CreateOutcome::Created(record))
    }

    async fn update_progress(
        &self,
        study_id: &StudyId,
        participant_id: &ParticipantId,
        index: i64,
        state: CompletionState,
    ) -> Result<bool> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(anyhow!("injected update failure"));
        }
        let mut inner = self.inner.lock().expect("lock");
        match inner
            .records
            .get_mut(&(study_id.clone(), participant_id.clone()))
        {
            Some(record) if !record.completion_state.is_terminal() => {
                record.current_step_index = index;
                record.completion_state = state;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn increment_condition_counter(
        &self,
        study_id: &StudyId,
        condition: &ConditionName,
    ) -> Result<i64> {
        let mut inner = self.inner.lock().expect("lock");
        let counters = inner.counters.entry(study_id.clone()).or_default();
        let counter = match counters.iter_mut().position(|c| &c.condition == condition) {
            Some(i) => &mut counters[i],
            None => {
                counters.push(Counter {
                    condition: condition.clone(),
                    assigned: 0,
                    active: false,
                });
                counters.last_mut().expect("just pushed")
            }
        };
        counter.assigned += 1;
        Ok(counter.assigned)
    }

    async fn read_condition_counters(
        &self,
        study_id: &StudyId,
    ) -> Result<BTreeMap<ConditionName, i64>> {
        let inner = self.inner.lock().expect("lock");
        Ok(inner
            .counters
            .get(study_id)
            .map(|counters| {
                counters
                    .iter()
                    .map(|c| (c.condition.clone(), c.assigned))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn register_conditions(
        &self,
        study_id: &StudyId,
        conditions: &[ConditionName],
    ) -> Result<()> {
        let mut inner = self.inner.lock().expect("lock");
        let counters = inner.counters.entry(study_id.clone()).or_default();
        let mut ordered = Vec::with_capacity(conditions.len());
        for condition in conditions {
            let assigned = counters
                .iter()
                .find(|c| &c.condition == condition)
                .map_or(0, |c| c.assigned);
            ordered.push(Counter {
                condition: condition.clone(),
                assigned,
                active: true,
            });
        }
        for retired in counters.iter().filter(|c| !conditions.contains(&c.condition)) {
            ordered.push(Counter {
                active: false,
                ..retired.clone()
            });
        }
        *counters = ordered;
        Ok(())
    }

    async fn claim_least_assigned(
        &self,
        study_id: &StudyId,
    ) -> Result<Option<(ConditionName, i64)>> {
        let mut inner = self.inner.lock().expect("lock");
        let Some(counters) = inner.counters.get_mut(study_id) else {
            return Ok(None);
        };
        // min_by_key keeps the first of equal minima, i.e. declaration order.
        let Some(counter) = counters
            .iter_mut()
            .filter(|c| c.active)
            .min_by_key(|c| c.assigned)
        else {
            return Ok(None);
        };
        counter.assigned += 1;
        Ok(Some((counter.condition.clone(), counter.assigned)))
    }

    async fn release_condition(
        &self,
        study_id: &StudyId,
        condition: &ConditionName,
    ) -> Result<()> {
        let mut inner = self.inner.lock().expect("lock");
        if let Some(counter) = inner
            .counters
            .get_mut(study_id)
            .and_then(|counters| counters.iter_mut().find(|c| &c.condition == condition))
        {
            counter.assigned = (counter.assigned - 1).max(0);
        }
        Ok(())
    }

    async fn completion_tally(&self, study_id: &StudyId) -> Result<CompletionTally> {
        let inner = self.inner.lock().expect("lock");
        let mut tally = CompletionTally::default();
        for ((study, _), record) in &inner.records {
            if study == study_id {
                tally.record(record.completion_state, 1);
            }
        }
        Ok(tally)
    }
}
