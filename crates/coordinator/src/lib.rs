//! Participant assignment and per-session sequencing on top of a
//! [`ParticipantStore`].

mod assignment;
mod session;
mod store;

pub use assignment::{Assignment, AssignmentCoordinator, NextParticipant};
pub use session::StudySession;
pub use store::{CreateOutcome, ParticipantStore};

#[cfg(test)]
#[path = "tests/memory_store.rs"]
mod memory_store;

#[cfg(test)]
#[path = "tests/assignment_tests.rs"]
mod tests;
