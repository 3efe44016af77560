use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use shared::{
    domain::{ConditionName, ParticipantId, StepId, StudyId},
    error::{GroupPath, SpecError},
};

use crate::flatten::flatten;

/// Immutable study definition as authored by the operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudySpec {
    pub study_id: StudyId,
    #[serde(default)]
    pub metadata: StudyMetadata,
    #[serde(default)]
    pub ui: UiConfig,
    /// Declaration order is the assignment tie-break order.
    #[serde(default)]
    pub conditions: Vec<ConditionName>,
    pub root: Block,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StudyMetadata {
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiConfig {
    #[serde(default = "default_true")]
    pub with_progress_bar: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help_text_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_email: Option<String>,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            with_progress_bar: true,
            logo_path: None,
            help_text_path: None,
            contact_email: None,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Block {
    Leaf(Leaf),
    Group(Group),
}

/// One atomic step. The payload is opaque to sequencing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Leaf {
    pub id: StepId,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub order: GroupOrder,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<ConditionSelector>,
    pub children: Vec<Block>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupOrder {
    #[default]
    Fixed,
    Random,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionSelector {
    One(ConditionName),
    AnyOf(Vec<ConditionName>),
}

impl ConditionSelector {
    pub fn matches(&self, condition: &ConditionName) -> bool {
        match self {
            ConditionSelector::One(name) => name == condition,
            ConditionSelector::AnyOf(names) => names.iter().any(|name| name == condition),
        }
    }

    pub fn names(&self) -> &[ConditionName] {
        match self {
            ConditionSelector::One(name) => std::slice::from_ref(name),
            ConditionSelector::AnyOf(names) => names,
        }
    }
}

impl Block {
    pub fn leaf(id: impl Into<String>) -> Self {
        Block::Leaf(Leaf {
            id: StepId::new(id),
            payload: serde_json::Value::Null,
        })
    }

    pub fn group(children: Vec<Block>) -> Self {
        Block::Group(Group {
            label: None,
            order: GroupOrder::Fixed,
            condition: None,
            children,
        })
    }

    pub fn random_group(children: Vec<Block>) -> Self {
        Block::Group(Group {
            label: None,
            order: GroupOrder::Random,
            condition: None,
            children,
        })
    }

    pub fn conditional(selector: ConditionSelector, children: Vec<Block>) -> Self {
        Block::Group(Group {
            label: None,
            order: GroupOrder::Fixed,
            condition: Some(selector),
            children,
        })
    }

    /// Leaves never carry a selector; only groups can be pruned.
    pub fn selector(&self) -> Option<&ConditionSelector> {
        match self {
            Block::Leaf(_) => None,
            Block::Group(group) => group.condition.as_ref(),
        }
    }
}

impl StudySpec {
    pub fn new(study_id: impl Into<String>, conditions: &[&str], root: Block) -> Self {
        Self {
            study_id: StudyId::new(study_id),
            metadata: StudyMetadata::default(),
            ui: UiConfig::default(),
            conditions: conditions.iter().map(|c| ConditionName::from(*c)).collect(),
            root,
        }
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn declares(&self, condition: &ConditionName) -> bool {
        self.conditions.iter().any(|c| c == condition)
    }

    /// Every leaf in the tree, pruned or not, in authored order.
    pub fn leaf_ids(&self) -> Vec<&StepId> {
        let mut out = Vec::new();
        collect_leaves(&self.root, &mut out);
        out
    }

    /// Load-time checks. A spec that passes can be flattened for any
    /// declared condition and any participant.
    pub fn validate(&self) -> Result<(), SpecError> {
        let mut declared = HashSet::new();
        for condition in &self.conditions {
            if !declared.insert(condition) {
                return Err(SpecError::DuplicateCondition(condition.clone()));
            }
        }

        let mut seen = HashSet::new();
        for id in self.leaf_ids() {
            if !seen.insert(id) {
                return Err(SpecError::DuplicateStep(id.clone()));
            }
        }

        check_selectors(&self.root, &mut Vec::new(), &declared)?;

        // Pruning does not depend on the participant, so one probe per
        // condition finds every empty branch.
        let probe = ParticipantId::new("validation-probe");
        for condition in &self.conditions {
            flatten(self, condition, &probe)?;
        }
        Ok(())
    }
}

fn collect_leaves<'a>(block: &'a Block, out: &mut Vec<&'a StepId>) {
    match block {
        Block::Leaf(leaf) => out.push(&leaf.id),
        Block::Group(group) => {
            for child in &group.children {
                collect_leaves(child, out);
            }
        }
    }
}

fn check_selectors(
    block: &Block,
    path: &mut Vec<usize>,
    declared: &HashSet<&ConditionName>,
) -> Result<(), SpecError> {
    let Block::Group(group) = block else {
        return Ok(());
    };
    if let Some(selector) = &group.condition {
        if let Some(unknown) = selector.names().iter().find(|n| !declared.contains(n)) {
            return Err(SpecError::UnknownCondition {
                path: GroupPath(path.clone()),
                condition: unknown.clone(),
            });
        }
    }
    for (index, child) in group.children.iter().enumerate() {
        path.push(index);
        check_selectors(child, path, declared)?;
        path.pop();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "study_id": "color-judgement",
        "metadata": { "title": "Color Judgement" },
        "ui": { "help_text_path": "help.md", "contact_email": "lab@example.org" },
        "conditions": ["X", "Y"],
        "root": {
            "type": "group",
            "children": [
                { "type": "leaf", "id": "intro", "payload": { "kind": "markdown" } },
                { "type": "group", "condition": "X", "children": [ { "type": "leaf", "id": "trial-x" } ] },
                { "type": "group", "condition": ["X", "Y"], "order": "random", "children": [
                    { "type": "leaf", "id": "t1" },
                    { "type": "leaf", "id": "t2" }
                ] },
                { "type": "group", "condition": "Y", "children": [ { "type": "leaf", "id": "trial-y" } ] },
                { "type": "leaf", "id": "survey" }
            ]
        }
    }"#;

    #[test]
    fn parses_authored_json() {
        let spec = StudySpec::from_json(SAMPLE).expect("spec");
        assert_eq!(spec.metadata.title, "Color Judgement");
        assert!(spec.ui.with_progress_bar);
        assert_eq!(spec.ui.help_text_path.as_deref(), Some("help.md"));
        assert_eq!(spec.conditions.len(), 2);
        assert_eq!(spec.leaf_ids().len(), 6);
        spec.validate().expect("valid");
    }

    #[test]
    fn selector_list_matches_any_member() {
        let selector = ConditionSelector::AnyOf(vec!["X".into(), "Y".into()]);
        assert!(selector.matches(&"Y".into()));
        assert!(!selector.matches(&"Z".into()));
    }

    #[test]
    fn rejects_duplicate_leaf_even_across_exclusive_branches() {
        let spec = StudySpec::new(
            "dup",
            &["X", "Y"],
            Block::group(vec![
                Block::conditional(ConditionSelector::One("X".into()), vec![Block::leaf("a")]),
                Block::conditional(ConditionSelector::One("Y".into()), vec![Block::leaf("a")]),
            ]),
        );
        assert_eq!(
            spec.validate(),
            Err(SpecError::DuplicateStep(StepId::new("a")))
        );
    }

    #[test]
    fn rejects_selector_naming_undeclared_condition() {
        let spec = StudySpec::new(
            "typo",
            &["X"],
            Block::group(vec![
                Block::leaf("a"),
                Block::conditional(ConditionSelector::One("x".into()), vec![Block::leaf("b")]),
            ]),
        );
        assert_eq!(
            spec.validate(),
            Err(SpecError::UnknownCondition {
                path: GroupPath(vec![1]),
                condition: "x".into(),
            })
        );
    }

    #[test]
    fn rejects_duplicate_condition_names() {
        let spec = StudySpec::new("twice", &["X", "X"], Block::leaf("a"));
        assert_eq!(
            spec.validate(),
            Err(SpecError::DuplicateCondition("X".into()))
        );
    }

    #[test]
    fn validation_surfaces_empty_branch_for_some_condition() {
        let spec = StudySpec::new(
            "branchy",
            &["X", "Y"],
            Block::group(vec![
                Block::leaf("a"),
                Block::group(vec![Block::conditional(
                    ConditionSelector::One("X".into()),
                    vec![Block::leaf("d")],
                )]),
            ]),
        );
        assert!(matches!(
            spec.validate(),
            Err(SpecError::EmptyGroup { condition, .. }) if condition == ConditionName::from("Y")
        ));
    }

    #[test]
    fn spec_without_conditions_still_validates() {
        let spec = StudySpec::new("open", &[], Block::leaf("only"));
        spec.validate().expect("valid");
    }

    #[test]
    fn bundled_sample_study_is_valid() {
        let spec = StudySpec::from_json(include_str!("../../../studies/reading-study.json"))
            .expect("parse");
        spec.validate().expect("valid");
        assert_eq!(spec.conditions.len(), 2);
        assert_eq!(spec.leaf_ids().len(), 7);
        let sequence = flatten(&spec, &"plain".into(), &"p-1".into()).expect("flatten");
        assert_eq!(sequence.len(), 6);
        assert_eq!(sequence.as_slice().last(), Some(&StepId::new("debrief")));
    }
}
