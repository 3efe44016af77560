use shared::{
    domain::{StepId, NOT_STARTED},
    error::StudyError,
};

use crate::flatten::FlatSequence;

/// Position of one participant within their flattened sequence.
///
/// Pull-based: every query is computed on demand from the pointer, callers
/// cache derived values if they need to. Persisting the pointer is the
/// caller's job after each successful move.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressTracker {
    sequence: FlatSequence,
    current: Option<usize>,
    confirmed: bool,
}

impl ProgressTracker {
    pub fn new(sequence: FlatSequence) -> Self {
        Self {
            sequence,
            current: None,
            confirmed: false,
        }
    }

    /// Rebuilds a tracker from a stored index. Negative means not started,
    /// indexes past the end clamp to the last step.
    pub fn resume(sequence: FlatSequence, stored_index: i64, confirmed: bool) -> Self {
        let current = if stored_index < 0 || sequence.is_empty() {
            None
        } else {
            let last = sequence.len() - 1;
            Some(usize::try_from(stored_index).map_or(last, |i| i.min(last)))
        };
        let confirmed = confirmed && current.is_some_and(|i| i + 1 == sequence.len());
        Self {
            sequence,
            current,
            confirmed,
        }
    }

    pub fn sequence(&self) -> &FlatSequence {
        &self.sequence
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current
    }

    /// Index in the persisted form, `-1` before the first step.
    pub fn stored_index(&self) -> i64 {
        self.current
            .map_or(NOT_STARTED, |i| i64::try_from(i).unwrap_or(i64::MAX))
    }

    pub fn current_step_id(&self) -> Option<&StepId> {
        self.current.and_then(|i| self.sequence.get(i))
    }

    pub fn next_step_id(&self) -> Option<&StepId> {
        let next = self.current.map_or(0, |i| i + 1);
        self.sequence.get(next)
    }

    pub fn previous_step_id(&self) -> Option<&StepId> {
        self.current
            .and_then(|i| i.checked_sub(1))
            .and_then(|i| self.sequence.get(i))
    }

    pub fn is_first(&self) -> bool {
        self.current == Some(0)
    }

    pub fn is_last(&self) -> bool {
        matches!(self.current, Some(i) if i + 1 == self.sequence.len())
    }

    /// Last step reached *and* the participant confirmed it.
    pub fn is_complete(&self) -> bool {
        self.confirmed && self.is_last()
    }

    pub fn progress_fraction(&self) -> f64 {
        let Some(index) = self.current else {
            return 0.0;
        };
        let len = self.sequence.len();
        if len <= 1 {
            return if len == 1 { 1.0 } else { 0.0 };
        }
        index as f64 / (len - 1) as f64
    }

    pub fn progress_percent(&self) -> f64 {
        self.progress_fraction() * 100.0
    }

    pub fn advance(&mut self) -> Result<usize, StudyError> {
        let len = self.sequence.len();
        let next = self.current.map_or(0, |i| i + 1);
        if next >= len {
            return Err(StudyError::SequenceExhausted {
                index: self.current.unwrap_or(0),
                len,
            });
        }
        self.current = Some(next);
        Ok(next)
    }

    /// Steps back one; the first step is a floor and "not started" stays put.
    pub fn retreat(&mut self) -> Option<usize> {
        if let Some(index) = self.current {
            let previous = index.saturating_sub(1);
            if previous != index {
                self.confirmed = false;
            }
            self.current = Some(previous);
        }
        self.current
    }

    pub fn confirm_completion(&mut self) -> Result<(), StudyError> {
        if !self.is_last() {
            return Err(StudyError::NotAtFinalStep);
        }
        self.confirmed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq(n: usize) -> FlatSequence {
        FlatSequence::from(
            (0..n)
                .map(|i| StepId::new(format!("s{i}")))
                .collect::<Vec<_>>(),
        )
    }

    #[test]
    fn three_step_walkthrough() {
        let mut tracker = ProgressTracker::new(FlatSequence::from(vec![
            StepId::new("A"),
            StepId::new("B"),
            StepId::new("C"),
        ]));
        assert_eq!(tracker.stored_index(), -1);
        assert!(!tracker.is_last());

        assert_eq!(tracker.advance().expect("to A"), 0);
        assert!(tracker.is_first());
        assert!(!tracker.is_last());
        assert_eq!(tracker.advance().expect("to B"), 1);
        assert!(!tracker.is_last());
        assert_eq!(tracker.advance().expect("to C"), 2);
        assert!(tracker.is_last());
        assert_eq!(tracker.current_step_id().map(StepId::as_str), Some("C"));
    }

    #[test]
    fn fraction_spans_zero_to_one() {
        let mut tracker = ProgressTracker::new(seq(5));
        assert_eq!(tracker.progress_fraction(), 0.0);
        tracker.advance().expect("0");
        assert_eq!(tracker.progress_fraction(), 0.0);
        for _ in 0..4 {
            tracker.advance().expect("advance");
        }
        assert_eq!(tracker.current_index(), Some(4));
        assert_eq!(tracker.progress_fraction(), 1.0);
        assert_eq!(tracker.progress_percent(), 100.0);
    }

    #[test]
    fn single_step_sequence_is_full_once_started() {
        let mut tracker = ProgressTracker::new(seq(1));
        assert_eq!(tracker.progress_fraction(), 0.0);
        tracker.advance().expect("start");
        assert_eq!(tracker.progress_fraction(), 1.0);
        assert!(tracker.is_first() && tracker.is_last());
    }

    #[test]
    fn empty_sequence_never_divides_by_zero() {
        let mut tracker = ProgressTracker::new(FlatSequence::default());
        assert_eq!(tracker.progress_fraction(), 0.0);
        assert!(matches!(
            tracker.advance(),
            Err(StudyError::SequenceExhausted { len: 0, .. })
        ));
    }

    #[test]
    fn advancing_past_the_end_fails_without_moving() {
        let mut tracker = ProgressTracker::resume(seq(2), 1, false);
        let err = tracker.advance().expect_err("exhausted");
        assert!(matches!(
            err,
            StudyError::SequenceExhausted { index: 1, len: 2 }
        ));
        assert_eq!(tracker.current_index(), Some(1));
    }

    #[test]
    fn retreat_floors_at_first_step() {
        let mut tracker = ProgressTracker::new(seq(3));
        assert_eq!(tracker.retreat(), None);
        tracker.advance().expect("0");
        tracker.advance().expect("1");
        assert_eq!(tracker.retreat(), Some(0));
        assert_eq!(tracker.retreat(), Some(0));
        assert_eq!(tracker.previous_step_id(), None);
        assert_eq!(tracker.next_step_id().map(StepId::as_str), Some("s1"));
    }

    #[test]
    fn completion_needs_last_step_and_confirmation() {
        let mut tracker = ProgressTracker::resume(seq(3), 1, false);
        assert!(matches!(
            tracker.confirm_completion(),
            Err(StudyError::NotAtFinalStep)
        ));
        tracker.advance().expect("last");
        assert!(tracker.is_last());
        assert!(!tracker.is_complete());
        tracker.confirm_completion().expect("confirm");
        assert!(tracker.is_complete());
    }

    #[test]
    fn resume_clamps_and_reads_sentinel() {
        assert_eq!(ProgressTracker::resume(seq(3), -1, false).current_index(), None);
        assert_eq!(ProgressTracker::resume(seq(3), 9, false).current_index(), Some(2));
        assert!(ProgressTracker::resume(seq(3), 2, true).is_complete());
        assert!(!ProgressTracker::resume(seq(3), 1, true).is_complete());
    }
}
