use std::sync::Arc;

use chrono::Utc;
use coordinator::{AssignmentCoordinator, ParticipantStore, StudySession};
use sequence::{StudyCatalog, StudySpec};
use shared::{
    domain::{ParticipantId, StudyId},
    error::{ApiError, ErrorCode, StudyError},
    protocol::{
        NextParticipantResponse, SessionView, StudyEvent, StudyHeader, StudyStats, StudySummary,
    },
};
use storage::Storage;
use tracing::error;

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub coordinator: AssignmentCoordinator<Storage>,
    pub catalog: Arc<StudyCatalog>,
}

impl ApiContext {
    pub fn new(storage: Storage, catalog: StudyCatalog) -> Self {
        Self {
            coordinator: AssignmentCoordinator::new(storage.clone()),
            storage,
            catalog: Arc::new(catalog),
        }
    }
}

/// A session view plus the event to publish, if the call changed anything.
pub type SessionUpdate = (SessionView, Option<StudyEvent>);

pub fn list_studies(ctx: &ApiContext) -> Vec<StudySummary> {
    ctx.catalog.summaries()
}

pub fn study_header(ctx: &ApiContext, study_id: &StudyId) -> Result<StudyHeader, ApiError> {
    Ok(spec_for(ctx, study_id)?.header())
}

pub async fn study_stats(ctx: &ApiContext, study_id: &StudyId) -> Result<StudyStats, ApiError> {
    spec_for(ctx, study_id)?;
    let condition_counters = ctx
        .storage
        .read_condition_counters(study_id)
        .await
        .map_err(|e| api_error(StudyError::Backend(e)))?;
    let participants = ctx
        .storage
        .completion_tally(study_id)
        .await
        .map_err(|e| api_error(StudyError::Backend(e)))?;
    Ok(StudyStats {
        study_id: study_id.clone(),
        condition_counters,
        participants,
    })
}

/// Opens (and on first access assigns) a participant. A missing id gets a
/// freshly generated one.
pub async fn start_session(
    ctx: &ApiContext,
    study_id: &StudyId,
    participant_id: Option<ParticipantId>,
) -> Result<SessionUpdate, ApiError> {
    let spec = spec_for(ctx, study_id)?;
    let participant_id = match participant_id {
        Some(id) if id.as_str().trim().is_empty() => {
            return Err(ApiError::new(
                ErrorCode::Validation,
                "participant_id must not be blank",
            ))
        }
        Some(id) => id,
        None => ParticipantId::generate(),
    };

    let assignment = ctx
        .coordinator
        .get_or_create_participant(&spec, &participant_id)
        .await
        .map_err(api_error)?;
    let event = assignment
        .created
        .then(|| StudyEvent::ParticipantAssigned {
            study_id: study_id.clone(),
            participant_id: participant_id.clone(),
            condition: assignment.record.assigned_condition.clone(),
            at: Utc::now(),
        });
    let session = ctx
        .coordinator
        .resume_session(&spec, &participant_id)
        .await
        .map_err(api_error)?;
    Ok((session.view(), event))
}

pub async fn session_view(
    ctx: &ApiContext,
    study_id: &StudyId,
    participant_id: &ParticipantId,
) -> Result<SessionView, ApiError> {
    let session = resume(ctx, study_id, participant_id).await?;
    Ok(session.view())
}

pub async fn advance(
    ctx: &ApiContext,
    study_id: &StudyId,
    participant_id: &ParticipantId,
) -> Result<SessionUpdate, ApiError> {
    let mut session = resume(ctx, study_id, participant_id).await?;
    let before = session.current_index();
    let after = ctx
        .coordinator
        .advance(&mut session)
        .await
        .map_err(api_error)?;
    Ok(progress_update(session, before != after))
}

pub async fn retreat(
    ctx: &ApiContext,
    study_id: &StudyId,
    participant_id: &ParticipantId,
) -> Result<SessionUpdate, ApiError> {
    let mut session = resume(ctx, study_id, participant_id).await?;
    let before = session.current_index();
    let after = ctx
        .coordinator
        .retreat(&mut session)
        .await
        .map_err(api_error)?;
    Ok(progress_update(session, before != after))
}

pub async fn complete(
    ctx: &ApiContext,
    study_id: &StudyId,
    participant_id: &ParticipantId,
) -> Result<SessionUpdate, ApiError> {
    let mut session = resume(ctx, study_id, participant_id).await?;
    ctx.coordinator
        .complete(&mut session)
        .await
        .map_err(api_error)?;
    let event = StudyEvent::ParticipantCompleted {
        study_id: study_id.clone(),
        participant_id: participant_id.clone(),
        at: Utc::now(),
    };
    Ok((session.view(), Some(event)))
}

pub async fn next_participant(
    ctx: &ApiContext,
    study_id: &StudyId,
    current: Option<&ParticipantId>,
) -> Result<(NextParticipantResponse, Option<StudyEvent>), ApiError> {
    let spec = spec_for(ctx, study_id)?;
    let next = ctx.coordinator.assign_next_participant(&spec, current).await;
    let event = next
        .abandoned
        .clone()
        .map(|participant_id| StudyEvent::ParticipantAbandoned {
            study_id: study_id.clone(),
            participant_id,
            at: Utc::now(),
        });
    Ok((
        NextParticipantResponse {
            abandoned: next.abandoned,
            next_participant_id: next.next_participant_id,
            redirect_to: next.redirect_to,
        },
        event,
    ))
}

fn spec_for(ctx: &ApiContext, study_id: &StudyId) -> Result<Arc<StudySpec>, ApiError> {
    ctx.catalog
        .get(study_id)
        .ok_or_else(|| StudyError::UnknownStudy(study_id.clone()).into())
}

async fn resume(
    ctx: &ApiContext,
    study_id: &StudyId,
    participant_id: &ParticipantId,
) -> Result<StudySession, ApiError> {
    let spec = spec_for(ctx, study_id)?;
    ctx.coordinator
        .resume_session(&spec, participant_id)
        .await
        .map_err(api_error)
}

fn progress_update(session: StudySession, moved: bool) -> SessionUpdate {
    let event = moved.then(|| StudyEvent::ProgressUpdated {
        study_id: session.study_id().clone(),
        participant_id: session.record().participant_id.clone(),
        current_step_index: session.record().current_step_index,
        at: Utc::now(),
    });
    (session.view(), event)
}

fn api_error(err: StudyError) -> ApiError {
    if let StudyError::Backend(source) = &err {
        error!(error = %source, "study storage request failed");
    }
    err.into()
}
