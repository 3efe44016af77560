//! Seeded permutations for randomized groups.
//!
//! The seed for a group is SipHash-1-3 with fixed zero keys over the
//! participant identifier and the group's authored path. Re-flattening for the
//! same participant therefore reproduces every permutation, while distinct
//! participants or distinct groups draw independent orders.

use std::hash::Hasher;

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use shared::domain::ParticipantId;
use siphasher::sip::SipHasher13;

/// Derives the permutation seed for one randomized group.
pub fn group_seed(participant: &ParticipantId, path: &[usize]) -> u64 {
    let mut hasher = SipHasher13::new_with_keys(0, 0);
    let bytes = participant.as_str().as_bytes();
    hasher.write_u64(bytes.len() as u64);
    hasher.write(bytes);
    hasher.write_u64(path.len() as u64);
    for index in path {
        hasher.write_u64(*index as u64);
    }
    hasher.finish()
}

/// Shuffles `items` in place with the permutation keyed by `(participant, path)`.
pub fn permute<T>(items: &mut [T], participant: &ParticipantId, path: &[usize]) {
    let mut rng = StdRng::seed_from_u64(group_seed(participant, path));
    items.shuffle(&mut rng);
}
