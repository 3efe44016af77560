use std::{collections::BTreeMap, fs, path::Path, sync::Arc};

use anyhow::{Context, Result};
use shared::{
    domain::StudyId,
    error::SpecError,
    protocol::{StudyHeader, StudySummary},
};
use tracing::info;

use crate::spec::StudySpec;

/// Validated study specifications keyed by study id.
#[derive(Debug, Clone, Default)]
pub struct StudyCatalog {
    studies: BTreeMap<StudyId, Arc<StudySpec>>,
}

impl StudyCatalog {
    pub fn from_specs(specs: impl IntoIterator<Item = StudySpec>) -> Result<Self, SpecError> {
        let mut catalog = Self::default();
        for spec in specs {
            catalog.insert(spec)?;
        }
        Ok(catalog)
    }

    /// Loads and validates every `*.json` file in `dir`.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let mut paths = fs::read_dir(dir)
            .with_context(|| format!("failed to read studies directory '{}'", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect::<Vec<_>>();
        paths.sort();

        let mut catalog = Self::default();
        for path in paths {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("failed to read study file '{}'", path.display()))?;
            let spec = StudySpec::from_json(&raw).map_err(|e| SpecError::Unreadable {
                file: path.display().to_string(),
                message: e.to_string(),
            })?;
            let study_id = spec.study_id.clone();
            catalog
                .insert(spec)
                .with_context(|| format!("study file '{}' rejected", path.display()))?;
            info!(%study_id, file = %path.display(), "loaded study");
        }
        Ok(catalog)
    }

    pub fn insert(&mut self, spec: StudySpec) -> Result<(), SpecError> {
        spec.validate()?;
        if self.studies.contains_key(&spec.study_id) {
            return Err(SpecError::DuplicateStudy(spec.study_id));
        }
        self.studies.insert(spec.study_id.clone(), Arc::new(spec));
        Ok(())
    }

    pub fn get(&self, study_id: &StudyId) -> Option<Arc<StudySpec>> {
        self.studies.get(study_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.studies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.studies.is_empty()
    }

    pub fn summaries(&self) -> Vec<StudySummary> {
        self.studies
            .values()
            .map(|spec| StudySummary {
                study_id: spec.study_id.clone(),
                title: spec.metadata.title.clone(),
            })
            .collect()
    }
}

impl StudySpec {
    pub fn header(&self) -> StudyHeader {
        StudyHeader {
            study_id: self.study_id.clone(),
            title: self.metadata.title.clone(),
            with_progress_bar: self.ui.with_progress_bar,
            logo_path: self.ui.logo_path.clone(),
            help_text_available: self.ui.help_text_path.is_some(),
            contact_email: self.ui.contact_email.clone(),
        }
    }
}
