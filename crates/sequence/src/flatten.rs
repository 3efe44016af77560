use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use shared::{
    domain::{ConditionName, ParticipantId, StepId},
    error::{GroupPath, SpecError},
};

use crate::{
    rng::permute,
    spec::{Block, Group, GroupOrder, StudySpec},
};

/// Ordered, pruned list of step identifiers for one participant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlatSequence {
    steps: Vec<StepId>,
}

impl FlatSequence {
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&StepId> {
        self.steps.get(index)
    }

    pub fn position(&self, step: &StepId) -> Option<usize> {
        self.steps.iter().position(|s| s == step)
    }

    pub fn iter(&self) -> impl Iterator<Item = &StepId> {
        self.steps.iter()
    }

    pub fn as_slice(&self) -> &[StepId] {
        &self.steps
    }
}

impl From<Vec<StepId>> for FlatSequence {
    fn from(steps: Vec<StepId>) -> Self {
        Self { steps }
    }
}

/// Flattens `spec` for a participant assigned to `condition`.
///
/// Depth-first over the pruned tree: each group keeps the children whose
/// selector matches (children without one always match), randomized groups
/// permute the survivors with a seed keyed by `(participant, group path)`,
/// and leaves are emitted in visiting order.
pub fn flatten(
    spec: &StudySpec,
    condition: &ConditionName,
    participant: &ParticipantId,
) -> Result<FlatSequence, SpecError> {
    let mut walker = Walker {
        condition,
        participant,
        seen: HashSet::new(),
        out: Vec::new(),
    };

    if let Some(selector) = spec.root.selector() {
        if !selector.matches(condition) {
            return Err(SpecError::EmptyGroup {
                path: GroupPath::default(),
                condition: condition.clone(),
            });
        }
    }

    walker.visit(&spec.root, &mut Vec::new())?;
    Ok(FlatSequence { steps: walker.out })
}

struct Walker<'a> {
    condition: &'a ConditionName,
    participant: &'a ParticipantId,
    seen: HashSet<StepId>,
    out: Vec<StepId>,
}

impl Walker<'_> {
    fn visit(&mut self, block: &Block, path: &mut Vec<usize>) -> Result<(), SpecError> {
        match block {
            Block::Leaf(leaf) => {
                if !self.seen.insert(leaf.id.clone()) {
                    return Err(SpecError::DuplicateStep(leaf.id.clone()));
                }
                self.out.push(leaf.id.clone());
                Ok(())
            }
            Block::Group(group) => self.visit_group(group, path),
        }
    }

    fn visit_group(&mut self, group: &Group, path: &mut Vec<usize>) -> Result<(), SpecError> {
        let mut children: Vec<(usize, &Block)> = group
            .children
            .iter()
            .enumerate()
            .filter(|(_, child)| {
                child
                    .selector()
                    .map_or(true, |selector| selector.matches(self.condition))
            })
            .collect();

        if children.is_empty() {
            return Err(SpecError::EmptyGroup {
                path: GroupPath(path.clone()),
                condition: self.condition.clone(),
            });
        }

        if group.order == GroupOrder::Random {
            permute(&mut children, self.participant, path);
        }

        for (index, child) in children {
            path.push(index);
            let visited = self.visit(child, path);
            path.pop();
            visited?;
        }
        Ok(())
    }
}
