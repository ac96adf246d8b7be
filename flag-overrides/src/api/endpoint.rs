use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use uuid::Uuid;

use crate::api::actor::Actor;
use crate::api::errors::FlagError;
use crate::api::types::{
    CreateFlagRequest, CreateOverrideRequest, EffectiveQuery, MutationResponse, ScopeQuery,
    SetOverrideRequest, UpdateFlagRequest,
};
use crate::audit::audit_models::AuditLogEntry;
use crate::flags::flag_models::Flag;
use crate::flags::override_models::Override;
use crate::flags::resolver::EffectiveFlags;
use crate::router;

pub async fn create_flag(
    State(state): State<router::State>,
    Actor(actor): Actor,
    Json(request): Json<CreateFlagRequest>,
) -> Result<(StatusCode, Json<MutationResponse<Flag>>), FlagError> {
    let new_flag = request.into_new_flag()?;
    let outcome = state.service.create_flag(new_flag, actor).await?;
    Ok((StatusCode::CREATED, Json(outcome.into())))
}

/// Lists one owner's flags. With `key`, the list holds at most the flag with that key.
pub async fn list_flags(
    State(state): State<router::State>,
    Query(query): Query<ScopeQuery>,
) -> Result<Json<Vec<Flag>>, FlagError> {
    let owner = query.scope()?;
    let flags = match query.key.as_deref() {
        Some(key) => match state.service.get_flag_by_key(key, &owner).await {
            Ok(flag) => vec![flag],
            Err(FlagError::NotFound { .. }) => Vec::new(),
            Err(e) => return Err(e),
        },
        None => state.service.list_flags(&owner).await?,
    };
    Ok(Json(flags))
}

pub async fn get_flag(
    State(state): State<router::State>,
    Path(id): Path<Uuid>,
) -> Result<Json<Flag>, FlagError> {
    Ok(Json(state.service.get_flag(id).await?))
}

pub async fn update_flag(
    State(state): State<router::State>,
    Actor(actor): Actor,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateFlagRequest>,
) -> Result<Json<MutationResponse<Flag>>, FlagError> {
    let update = request.into_update()?;
    let outcome = state.service.update_flag(id, update, actor).await?;
    Ok(Json(outcome.into()))
}

pub async fn delete_flag(
    State(state): State<router::State>,
    Actor(actor): Actor,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, FlagError> {
    state.service.delete_flag(id, actor).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_overrides(
    State(state): State<router::State>,
    Path(flag_id): Path<Uuid>,
) -> Result<Json<Vec<Override>>, FlagError> {
    Ok(Json(state.service.list_overrides(flag_id).await?))
}

pub async fn create_override(
    State(state): State<router::State>,
    Actor(actor): Actor,
    Path(flag_id): Path<Uuid>,
    Json(request): Json<CreateOverrideRequest>,
) -> Result<(StatusCode, Json<MutationResponse<Override>>), FlagError> {
    let outcome = state
        .service
        .create_override(flag_id, request.user_id, request.value, actor)
        .await?;
    Ok((StatusCode::CREATED, Json(outcome.into())))
}

pub async fn set_override(
    State(state): State<router::State>,
    Actor(actor): Actor,
    Path((flag_id, user_id)): Path<(Uuid, Uuid)>,
    Json(request): Json<SetOverrideRequest>,
) -> Result<Json<MutationResponse<Override>>, FlagError> {
    let outcome = state
        .service
        .set_override(flag_id, user_id, request.value, actor)
        .await?;
    Ok(Json(outcome.into()))
}

pub async fn delete_override(
    State(state): State<router::State>,
    Actor(actor): Actor,
    Path((flag_id, user_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<MutationResponse<()>>, FlagError> {
    let outcome = state
        .service
        .delete_override(flag_id, user_id, actor)
        .await?;
    Ok(Json(outcome.into()))
}

pub async fn list_audit_entries(
    State(state): State<router::State>,
    Path(flag_id): Path<Uuid>,
) -> Result<Json<Vec<AuditLogEntry>>, FlagError> {
    Ok(Json(state.service.list_audit_entries(flag_id).await?))
}

pub async fn effective_flags(
    State(state): State<router::State>,
    Query(query): Query<EffectiveQuery>,
) -> Result<Json<EffectiveFlags>, FlagError> {
    let owner = query.scope()?;
    Ok(Json(
        state
            .service
            .get_effective_flags(query.user_id, &owner)
            .await?,
    ))
}
