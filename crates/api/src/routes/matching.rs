use axum::Json;
use axum::extract::{Extension, State};
use axum::response::Response;
use serde::{Deserialize, Serialize};
use serde_json::json;
use validator::Validate;

use temanjalan_domain::DomainResult;
use temanjalan_domain::error::DomainError;
use temanjalan_domain::identity::ActorIdentity;
use temanjalan_domain::matching::{
    CityScope, MatchCriteria, MatchOutcome, MatchPreferences, MatchService,
};
use temanjalan_domain::profiles::Gender;

use crate::envelope::respond;
use crate::error::ApiError;
use crate::middleware::AuthContext;
use crate::observability;
use crate::state::AppState;
use crate::validation;

#[derive(Serialize)]
struct MatchStatusBody {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    self_profile_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    other_profile_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    other_identity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    conversation_id: Option<String>,
}

impl From<MatchOutcome> for MatchStatusBody {
    fn from(outcome: MatchOutcome) -> Self {
        match outcome {
            MatchOutcome::Matched(party) => MatchStatusBody {
                status: "matched",
                session_id: Some(party.session_id),
                request_id: party.request_id,
                self_profile_id: Some(party.self_profile_id),
                other_profile_id: Some(party.other_profile_id),
                other_identity: Some(party.other_identity),
                conversation_id: party.conversation_id,
            },
            MatchOutcome::Waiting(waiting) => MatchStatusBody {
                status: "waiting",
                session_id: waiting.session_id,
                request_id: waiting.request_id,
                self_profile_id: waiting.self_profile_id,
                other_profile_id: None,
                other_identity: None,
                conversation_id: None,
            },
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub(crate) struct StartMatchRequest {
    #[validate(length(min = 1, max = 128))]
    trip_card_id: String,
    preferred_gender: Option<Gender>,
    #[validate(range(min = 17, max = 120))]
    preferred_age_min: Option<u8>,
    #[validate(range(min = 17, max = 120))]
    preferred_age_max: Option<u8>,
    #[serde(default)]
    #[validate(length(max = 10))]
    preferred_languages: Vec<String>,
    #[serde(default)]
    city_scope: CityScope,
}

#[derive(Debug, Deserialize, Validate)]
pub(crate) struct PollMatchRequest {
    #[validate(length(min = 1, max = 128))]
    request_id: String,
}

#[derive(Debug, Deserialize, Validate)]
pub(crate) struct CancelMatchRequest {
    #[validate(length(min = 1, max = 128))]
    request_id: String,
}

#[derive(Debug, Deserialize, Validate)]
pub(crate) struct PartnerRequest {
    #[validate(length(min = 1, max = 128))]
    session_id: String,
    #[validate(length(min = 1, max = 128))]
    self_profile_id: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub(crate) struct AttachConversationRequest {
    #[validate(length(min = 1, max = 128))]
    session_id: String,
    #[validate(length(min = 1, max = 128))]
    conversation_id: String,
    #[serde(default)]
    force: bool,
}

pub(crate) async fn start_match(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(payload): Json<StartMatchRequest>,
) -> Result<Response, ApiError> {
    validation::validate(&payload)?;
    let actor = traveler_actor(&auth)?;
    let criteria = MatchCriteria {
        trip_card_id: payload.trip_card_id,
        preferences: MatchPreferences {
            preferred_gender: payload.preferred_gender,
            preferred_age_min: payload.preferred_age_min,
            preferred_age_max: payload.preferred_age_max,
            preferred_languages: payload.preferred_languages,
            city_scope: payload.city_scope,
        },
    };
    let result = match_service(&state).submit(&actor, criteria).await;
    finish("start", result)
}

pub(crate) async fn poll_match(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(payload): Json<PollMatchRequest>,
) -> Result<Response, ApiError> {
    validation::validate(&payload)?;
    let actor = traveler_actor(&auth)?;
    let result = match_service(&state)
        .poll(&actor, &payload.request_id)
        .await;
    finish("poll", result)
}

pub(crate) async fn cancel_match(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(payload): Json<CancelMatchRequest>,
) -> Result<Response, ApiError> {
    validation::validate(&payload)?;
    let actor = traveler_actor(&auth)?;
    let result = match_service(&state)
        .cancel(&actor, &payload.request_id)
        .await;
    observability::register_match_outcome("cancel", if result.is_ok() { "ok" } else { "failed" });
    respond(result.map(|()| json!({})))
}

pub(crate) async fn get_partner(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(payload): Json<PartnerRequest>,
) -> Result<Response, ApiError> {
    validation::validate(&payload)?;
    let actor = traveler_actor(&auth)?;
    let result = match_service(&state)
        .partner(&actor, &payload.session_id, payload.self_profile_id.as_deref())
        .await;
    // Read-only view: the conversation id is never part of it.
    let result = result.map(|outcome| {
        let mut body = MatchStatusBody::from(outcome);
        body.conversation_id = None;
        body
    });
    match result {
        Ok(body) => {
            observability::register_match_outcome("partner", body.status);
            respond(Ok(body))
        }
        Err(err) => {
            observability::register_match_outcome("partner", outcome_label(&err));
            respond::<MatchStatusBody>(Err(err))
        }
    }
}

pub(crate) async fn attach_conversation(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(payload): Json<AttachConversationRequest>,
) -> Result<Response, ApiError> {
    validation::validate(&payload)?;
    let actor = traveler_actor(&auth)?;
    let result = match_service(&state)
        .attach_conversation(
            &actor,
            &payload.session_id,
            &payload.conversation_id,
            payload.force,
        )
        .await;
    observability::register_match_outcome("attach", if result.is_ok() { "ok" } else { "failed" });
    respond(result)
}

fn match_service(state: &AppState) -> MatchService {
    MatchService::new(
        state.match_store.clone(),
        state.profile_repo.clone(),
        state.conversations.clone(),
    )
}

fn traveler_actor(auth: &AuthContext) -> Result<ActorIdentity, ApiError> {
    let identity = auth
        .identity
        .as_ref()
        .filter(|identity| !identity.trim().is_empty())
        .ok_or(ApiError::Unauthorized)?;
    if !auth.role.can_match() {
        return Err(ApiError::Forbidden);
    }
    Ok(ActorIdentity {
        identity: identity.to_string(),
        username: auth.username.clone().unwrap_or_else(|| identity.to_string()),
    })
}

fn finish(
    operation: &'static str,
    result: DomainResult<MatchOutcome>,
) -> Result<Response, ApiError> {
    let outcome = match &result {
        Ok(MatchOutcome::Matched(_)) => "matched",
        Ok(MatchOutcome::Waiting(_)) => "waiting",
        Err(err) => outcome_label(err),
    };
    observability::register_match_outcome(operation, outcome);
    respond(result.map(MatchStatusBody::from))
}

fn outcome_label(err: &DomainError) -> &'static str {
    match err {
        DomainError::Rejected { .. } => "rejected",
        _ => "failed",
    }
}
