use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::DomainResult;
use crate::conversations::{ConversationProvisioner, Provisioned};
use crate::error::DomainError;
use crate::identity::ActorIdentity;
use crate::ports::conversations::ConversationClient;
use crate::ports::matching::MatchStore;
use crate::ports::profiles::ProfileRepository;
use crate::profiles::{Gender, Profile};

const MAX_PREFERRED_LANGUAGES: usize = 10;
const MIN_MATCH_AGE: u8 = 17;
const MAX_MATCH_AGE: u8 = 120;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MatchRequestStatus {
    Waiting,
    Matched,
    Cancelled,
    Failed,
}

impl MatchRequestStatus {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "waiting" => Some(MatchRequestStatus::Waiting),
            "matched" => Some(MatchRequestStatus::Matched),
            "cancelled" => Some(MatchRequestStatus::Cancelled),
            "failed" => Some(MatchRequestStatus::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MatchRequestStatus::Waiting => "waiting",
            MatchRequestStatus::Matched => "matched",
            MatchRequestStatus::Cancelled => "cancelled",
            MatchRequestStatus::Failed => "failed",
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Matched,
}

impl SessionStatus {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(SessionStatus::Pending),
            "matched" => Some(SessionStatus::Matched),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Matched => "matched",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CityScope {
    SameCity,
    #[default]
    AnyCity,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct MatchPreferences {
    pub preferred_gender: Option<Gender>,
    pub preferred_age_min: Option<u8>,
    pub preferred_age_max: Option<u8>,
    #[serde(default)]
    pub preferred_languages: Vec<String>,
    #[serde(default)]
    pub city_scope: CityScope,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MatchCriteria {
    pub trip_card_id: String,
    pub preferences: MatchPreferences,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MatchRequest {
    pub request_id: String,
    pub profile_id: String,
    pub trip_card_id: String,
    pub preferences: MatchPreferences,
    pub status: MatchRequestStatus,
    pub created_at_ms: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MatchSession {
    pub session_id: String,
    pub profile_a: String,
    pub profile_b: String,
    pub request_a: Option<String>,
    pub request_b: Option<String>,
    pub conversation_id: Option<String>,
    pub status: SessionStatus,
    pub created_at_ms: i64,
}

/// Tagged protocol outcome: callers cannot conflate "keep polling" with
/// "stop, something broke" — faults travel through `DomainError` instead.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub enum MatchOutcome {
    Matched(MatchedParty),
    Waiting(WaitingParty),
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct MatchedParty {
    pub session_id: String,
    pub request_id: Option<String>,
    pub self_profile_id: String,
    pub other_profile_id: String,
    pub other_identity: String,
    pub conversation_id: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct WaitingParty {
    pub request_id: Option<String>,
    pub session_id: Option<String>,
    pub self_profile_id: Option<String>,
}

/// Ordered recovery strategies run when `start_match` comes back
/// inconclusive. Evaluated left-to-right until one produces a session; the
/// start call and the eventual session may be separated by a concurrent call
/// from either profile, so an inconclusive start never proves "no session".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RecoveryStrategy {
    ByActiveRequest,
    ByProfileMembership,
}

const RECOVERY_CHAIN: [RecoveryStrategy; 2] = [
    RecoveryStrategy::ByActiveRequest,
    RecoveryStrategy::ByProfileMembership,
];

enum SlotResolution {
    Resolved {
        self_request_id: Option<String>,
        other_profile_id: String,
    },
    Unresolved,
}

#[derive(Clone)]
pub struct MatchService {
    store: Arc<dyn MatchStore>,
    profiles: Arc<dyn ProfileRepository>,
    provisioner: ConversationProvisioner,
}

impl MatchService {
    pub fn new(
        store: Arc<dyn MatchStore>,
        profiles: Arc<dyn ProfileRepository>,
        conversations: Arc<dyn ConversationClient>,
    ) -> Self {
        let provisioner = ConversationProvisioner::new(conversations, store.clone());
        Self {
            store,
            profiles,
            provisioner,
        }
    }

    /// Submit a fresh match desire. Cancels the profile's older waiting
    /// requests first so an abandoned request is never silently paired later,
    /// then starts the pairing primitive and, if that is inconclusive, runs
    /// the recovery chain before settling on `Waiting`.
    pub async fn submit(
        &self,
        actor: &ActorIdentity,
        criteria: MatchCriteria,
    ) -> DomainResult<MatchOutcome> {
        let criteria = validate_criteria(criteria)?;
        let profile = self.require_onboarded_profile(actor).await?;

        for stale in self.store.list_waiting_requests(&profile.profile_id).await? {
            self.store.cancel_match(&stale.request_id).await?;
        }

        if let Some(session) = self
            .store
            .start_match(&profile.profile_id, &criteria)
            .await?
        {
            return self.conclude(&profile, actor, session, true).await;
        }

        let (session, active_request_id) = self.recover_session(&profile.profile_id).await?;
        match session {
            Some(session) => self.conclude(&profile, actor, session, true).await,
            None => Ok(MatchOutcome::Waiting(WaitingParty {
                request_id: active_request_id,
                session_id: None,
                self_profile_id: Some(profile.profile_id),
            })),
        }
    }

    /// Poll one request. Ordered, first match wins; the short-circuit makes
    /// post-match polls idempotent and keeps the pairing primitive from ever
    /// being re-invoked for a consumed request.
    pub async fn poll(&self, actor: &ActorIdentity, request_id: &str) -> DomainResult<MatchOutcome> {
        match self.poll_inner(actor, request_id).await {
            Err(DomainError::Store(message)) => {
                // A broken request must never be silently reused by a later
                // call; best-effort, the fault is surfaced either way.
                if let Err(mark_err) = self.store.mark_request_failed(request_id).await {
                    tracing::warn!(error = %mark_err, request_id, "failed to mark request failed");
                }
                Err(DomainError::Store(message))
            }
            other => other,
        }
    }

    async fn poll_inner(
        &self,
        actor: &ActorIdentity,
        request_id: &str,
    ) -> DomainResult<MatchOutcome> {
        let profile = self.require_profile(actor).await?;

        if let Some(session) = self.store.find_session_by_request(request_id).await? {
            return self.conclude(&profile, actor, session, true).await;
        }

        let request = self
            .store
            .get_request(request_id)
            .await?
            .ok_or(DomainError::NotFound)?;
        if request.profile_id != profile.profile_id {
            return Err(DomainError::Forbidden);
        }

        match request.status {
            MatchRequestStatus::Waiting => {}
            MatchRequestStatus::Matched => {
                // The session row was not visible yet; the next poll will hit
                // the short-circuit.
                return Ok(MatchOutcome::Waiting(WaitingParty {
                    request_id: Some(request.request_id),
                    session_id: None,
                    self_profile_id: Some(profile.profile_id),
                }));
            }
            MatchRequestStatus::Cancelled => {
                return Err(DomainError::rejected(
                    "request_cancelled",
                    "match request was cancelled",
                ));
            }
            MatchRequestStatus::Failed => {
                return Err(DomainError::rejected(
                    "request_failed",
                    "match request previously failed",
                ));
            }
        }

        match self.store.try_match(request_id).await {
            Ok(Some(session)) => self.conclude(&profile, actor, session, true).await,
            Ok(None) => Ok(MatchOutcome::Waiting(WaitingParty {
                request_id: Some(request.request_id),
                session_id: None,
                self_profile_id: Some(profile.profile_id),
            })),
            // A store error out of the pairing primitive is a steady state of
            // the polling protocol: the request stays waiting and the client
            // keeps retrying.
            Err(DomainError::Store(message)) => {
                Err(DomainError::rejected("match_unavailable", message))
            }
            Err(other) => Err(other),
        }
    }

    /// Cancel an owned request. Cancelling an already-matched request is a
    /// no-op success that leaves the session intact.
    pub async fn cancel(&self, actor: &ActorIdentity, request_id: &str) -> DomainResult<()> {
        let profile = self.require_profile(actor).await?;
        let request = self
            .store
            .get_request(request_id)
            .await?
            .ok_or(DomainError::NotFound)?;
        if request.profile_id != profile.profile_id {
            return Err(DomainError::Forbidden);
        }

        match request.status {
            MatchRequestStatus::Waiting => self.store.cancel_match(&request.request_id).await,
            MatchRequestStatus::Matched
            | MatchRequestStatus::Cancelled
            | MatchRequestStatus::Failed => Ok(()),
        }
    }

    /// Read-only partner view of a session. Never provisions a conversation.
    pub async fn partner(
        &self,
        actor: &ActorIdentity,
        session_id: &str,
        self_profile_id: Option<&str>,
    ) -> DomainResult<MatchOutcome> {
        let profile = match self_profile_id {
            Some(profile_id) => {
                let profile = self
                    .profiles
                    .get(profile_id)
                    .await?
                    .ok_or(DomainError::NotFound)?;
                if let Some(linked) = &profile.identity {
                    if linked != &actor.identity {
                        return Err(DomainError::Forbidden);
                    }
                }
                profile
            }
            None => self.require_profile(actor).await?,
        };

        let session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or(DomainError::NotFound)?;
        self.conclude(&profile, actor, session, false).await
    }

    /// Explicit attach. The caller must be a member of the session; the
    /// attach primitive itself decides the write (no-op on same id, conflict
    /// on non-forced overwrite, last write wins under force).
    pub async fn attach_conversation(
        &self,
        actor: &ActorIdentity,
        session_id: &str,
        conversation_id: &str,
        force: bool,
    ) -> DomainResult<MatchSession> {
        let profile = self.require_profile(actor).await?;
        let session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or(DomainError::NotFound)?;

        match self.resolve_slot(&profile, actor, &session).await? {
            SlotResolution::Resolved { .. } => {
                self.store
                    .attach_conversation(session_id, conversation_id, force)
                    .await
            }
            SlotResolution::Unresolved => Err(DomainError::Forbidden),
        }
    }

    async fn recover_session(
        &self,
        profile_id: &str,
    ) -> DomainResult<(Option<MatchSession>, Option<String>)> {
        let active = self.store.get_active_request(profile_id).await?;

        for strategy in RECOVERY_CHAIN {
            let found = match strategy {
                RecoveryStrategy::ByActiveRequest => match &active {
                    Some(request) => {
                        self.store
                            .find_session_by_request(&request.request_id)
                            .await?
                    }
                    None => None,
                },
                RecoveryStrategy::ByProfileMembership => {
                    self.store.find_session_by_profile(profile_id).await?
                }
            };
            if let Some(session) = found {
                return Ok((Some(session), active.map(|request| request.request_id)));
            }
        }

        Ok((None, active.map(|request| request.request_id)))
    }

    /// Turn a located session into the caller's outcome: resolve the slot,
    /// require the counterpart's external identity, and (unless read-only)
    /// ensure the shared conversation. Every unresolved path reports
    /// `Waiting` — a mismatch is recoverable, never fatal.
    async fn conclude(
        &self,
        profile: &Profile,
        actor: &ActorIdentity,
        session: MatchSession,
        provision: bool,
    ) -> DomainResult<MatchOutcome> {
        if session.profile_a == session.profile_b {
            return Err(DomainError::Store(format!(
                "session {} pairs a profile with itself",
                session.session_id
            )));
        }

        let (self_request_id, other_profile_id) =
            match self.resolve_slot(profile, actor, &session).await? {
                SlotResolution::Resolved {
                    self_request_id,
                    other_profile_id,
                } => (self_request_id, other_profile_id),
                SlotResolution::Unresolved => {
                    return Ok(MatchOutcome::Waiting(WaitingParty {
                        request_id: None,
                        session_id: Some(session.session_id),
                        self_profile_id: Some(profile.profile_id.clone()),
                    }));
                }
            };

        let Some(other) = self.profiles.get(&other_profile_id).await? else {
            return Ok(MatchOutcome::Waiting(WaitingParty {
                request_id: self_request_id,
                session_id: Some(session.session_id),
                self_profile_id: Some(profile.profile_id.clone()),
            }));
        };
        let Some(other_identity) = other.identity.clone() else {
            // Counterpart exists but identity linking has not completed.
            return Ok(MatchOutcome::Waiting(WaitingParty {
                request_id: self_request_id,
                session_id: Some(session.session_id),
                self_profile_id: Some(profile.profile_id.clone()),
            }));
        };

        let conversation_id = if provision {
            match self
                .provisioner
                .ensure(&session, &actor.identity, Some(&other_identity))
                .await?
            {
                Provisioned::Ready(conversation_id) => Some(conversation_id),
                Provisioned::MissingIdentity => {
                    return Ok(MatchOutcome::Waiting(WaitingParty {
                        request_id: self_request_id,
                        session_id: Some(session.session_id),
                        self_profile_id: Some(profile.profile_id.clone()),
                    }));
                }
            }
        } else {
            session.conversation_id.clone()
        };

        Ok(MatchOutcome::Matched(MatchedParty {
            session_id: session.session_id,
            request_id: self_request_id,
            self_profile_id: profile.profile_id.clone(),
            other_profile_id: other.profile_id,
            other_identity,
            conversation_id,
        }))
    }

    /// Slot assignment. Primary rule is direct profile-id equality; the
    /// fallback re-derives the slot from the session profiles' linked
    /// external identities, which covers profile-id divergence caused by
    /// upstream identity-linking races.
    async fn resolve_slot(
        &self,
        profile: &Profile,
        actor: &ActorIdentity,
        session: &MatchSession,
    ) -> DomainResult<SlotResolution> {
        if profile.profile_id == session.profile_a {
            return Ok(SlotResolution::Resolved {
                self_request_id: session.request_a.clone(),
                other_profile_id: session.profile_b.clone(),
            });
        }
        if profile.profile_id == session.profile_b {
            return Ok(SlotResolution::Resolved {
                self_request_id: session.request_b.clone(),
                other_profile_id: session.profile_a.clone(),
            });
        }

        let slot_a = self.profiles.get(&session.profile_a).await?;
        if identity_matches(slot_a.as_ref(), &actor.identity) {
            return Ok(SlotResolution::Resolved {
                self_request_id: session.request_a.clone(),
                other_profile_id: session.profile_b.clone(),
            });
        }
        let slot_b = self.profiles.get(&session.profile_b).await?;
        if identity_matches(slot_b.as_ref(), &actor.identity) {
            return Ok(SlotResolution::Resolved {
                self_request_id: session.request_b.clone(),
                other_profile_id: session.profile_a.clone(),
            });
        }

        Ok(SlotResolution::Unresolved)
    }

    async fn require_profile(&self, actor: &ActorIdentity) -> DomainResult<Profile> {
        self.profiles
            .get_by_identity(&actor.identity)
            .await?
            .ok_or_else(|| {
                DomainError::rejected(
                    "onboarding_incomplete",
                    "no traveler profile exists for this identity",
                )
            })
    }

    async fn require_onboarded_profile(&self, actor: &ActorIdentity) -> DomainResult<Profile> {
        let profile = self.require_profile(actor).await?;
        if !profile.onboarded {
            return Err(DomainError::rejected(
                "onboarding_incomplete",
                "traveler onboarding is not complete",
            ));
        }
        Ok(profile)
    }
}

fn identity_matches(profile: Option<&Profile>, identity: &str) -> bool {
    profile
        .and_then(|profile| profile.identity.as_deref())
        .is_some_and(|linked| linked == identity)
}

pub fn validate_criteria(mut criteria: MatchCriteria) -> DomainResult<MatchCriteria> {
    criteria.trip_card_id = criteria.trip_card_id.trim().to_string();
    if criteria.trip_card_id.is_empty() {
        return Err(DomainError::Validation("trip_card_id is required".into()));
    }

    let preferences = &mut criteria.preferences;
    for bound in [preferences.preferred_age_min, preferences.preferred_age_max]
        .into_iter()
        .flatten()
    {
        if !(MIN_MATCH_AGE..=MAX_MATCH_AGE).contains(&bound) {
            return Err(DomainError::Validation(format!(
                "preferred age must be between {MIN_MATCH_AGE} and {MAX_MATCH_AGE}"
            )));
        }
    }
    if let (Some(min), Some(max)) = (preferences.preferred_age_min, preferences.preferred_age_max) {
        if min > max {
            return Err(DomainError::Validation(
                "preferred_age_min exceeds preferred_age_max".into(),
            ));
        }
    }

    if preferences.preferred_languages.len() > MAX_PREFERRED_LANGUAGES {
        return Err(DomainError::Validation(format!(
            "preferred_languages exceeds max of {MAX_PREFERRED_LANGUAGES}"
        )));
    }
    let mut languages: Vec<String> = preferences
        .preferred_languages
        .iter()
        .map(|language| language.trim().to_lowercase())
        .filter(|language| !language.is_empty())
        .collect();
    languages.sort();
    languages.dedup();
    preferences.preferred_languages = languages;

    Ok(criteria)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::BoxFuture;
    use crate::ports::conversations::ConversationCreate;
    use crate::util::{now_ms, uuid_v7_without_dashes};
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::RwLock;

    #[derive(Default)]
    struct MockMatchStore {
        requests: Arc<RwLock<HashMap<String, MatchRequest>>>,
        sessions: Arc<RwLock<HashMap<String, MatchSession>>>,
        // start_match creates the request but reports an inconclusive result,
        // mimicking the primitive's lack of a synchronous consistent view.
        start_inconclusive: AtomicBool,
        // like start_inconclusive, but the pairing still happens: the session
        // exists while the caller is told nothing.
        start_pairs_silently: AtomicBool,
        fail_try_match: AtomicBool,
        try_match_calls: AtomicUsize,
    }

    impl MockMatchStore {
        async fn insert_request(&self, request: MatchRequest) {
            self.requests
                .write()
                .await
                .insert(request.request_id.clone(), request);
        }

        async fn insert_session(&self, session: MatchSession) {
            self.sessions
                .write()
                .await
                .insert(session.session_id.clone(), session);
        }

        async fn request_status(&self, request_id: &str) -> Option<MatchRequestStatus> {
            self.requests
                .read()
                .await
                .get(request_id)
                .map(|request| request.status)
        }

        async fn session_for_request(&self, request_id: &str) -> Option<MatchSession> {
            self.sessions
                .read()
                .await
                .values()
                .find(|session| {
                    session.request_a.as_deref() == Some(request_id)
                        || session.request_b.as_deref() == Some(request_id)
                })
                .cloned()
        }

        async fn pair(&self, request_id: &str) -> Option<MatchSession> {
            let mut requests = self.requests.write().await;
            let me = requests.get(request_id).cloned()?;
            match me.status {
                MatchRequestStatus::Waiting => {}
                MatchRequestStatus::Matched => {
                    drop(requests);
                    return self.session_for_request(request_id).await;
                }
                _ => return None,
            }

            let partner = requests
                .values()
                .filter(|candidate| {
                    candidate.status == MatchRequestStatus::Waiting
                        && candidate.profile_id != me.profile_id
                })
                .min_by(|a, b| {
                    (a.created_at_ms, &a.request_id).cmp(&(b.created_at_ms, &b.request_id))
                })
                .cloned()?;

            let session = MatchSession {
                session_id: uuid_v7_without_dashes(),
                profile_a: partner.profile_id.clone(),
                profile_b: me.profile_id.clone(),
                request_a: Some(partner.request_id.clone()),
                request_b: Some(me.request_id.clone()),
                conversation_id: None,
                status: SessionStatus::Matched,
                created_at_ms: now_ms(),
            };
            for matched_id in [&partner.request_id, &me.request_id] {
                if let Some(request) = requests.get_mut(matched_id) {
                    request.status = MatchRequestStatus::Matched;
                }
            }
            drop(requests);
            self.sessions
                .write()
                .await
                .insert(session.session_id.clone(), session.clone());
            Some(session)
        }
    }

    impl MatchStore for MockMatchStore {
        fn start_match(
            &self,
            profile_id: &str,
            criteria: &MatchCriteria,
        ) -> BoxFuture<'_, DomainResult<Option<MatchSession>>> {
            let profile_id = profile_id.to_string();
            let criteria = criteria.clone();
            Box::pin(async move {
                let request = MatchRequest {
                    request_id: uuid_v7_without_dashes(),
                    profile_id,
                    trip_card_id: criteria.trip_card_id.clone(),
                    preferences: criteria.preferences.clone(),
                    status: MatchRequestStatus::Waiting,
                    created_at_ms: now_ms(),
                };
                let request_id = request.request_id.clone();
                self.insert_request(request).await;

                if self.start_pairs_silently.load(Ordering::SeqCst) {
                    let _ = self.pair(&request_id).await;
                    return Ok(None);
                }
                if self.start_inconclusive.load(Ordering::SeqCst) {
                    return Ok(None);
                }
                Ok(self.pair(&request_id).await)
            })
        }

        fn try_match(
            &self,
            request_id: &str,
        ) -> BoxFuture<'_, DomainResult<Option<MatchSession>>> {
            let request_id = request_id.to_string();
            Box::pin(async move {
                self.try_match_calls.fetch_add(1, Ordering::SeqCst);
                if self.fail_try_match.load(Ordering::SeqCst) {
                    return Err(DomainError::Store("pairing store unavailable".into()));
                }
                Ok(self.pair(&request_id).await)
            })
        }

        fn cancel_match(&self, request_id: &str) -> BoxFuture<'_, DomainResult<()>> {
            let request_id = request_id.to_string();
            Box::pin(async move {
                let mut requests = self.requests.write().await;
                if let Some(request) = requests.get_mut(&request_id) {
                    if request.status == MatchRequestStatus::Waiting {
                        request.status = MatchRequestStatus::Cancelled;
                    }
                }
                Ok(())
            })
        }

        fn get_active_request(
            &self,
            profile_id: &str,
        ) -> BoxFuture<'_, DomainResult<Option<MatchRequest>>> {
            let profile_id = profile_id.to_string();
            Box::pin(async move {
                let requests = self.requests.read().await;
                Ok(requests
                    .values()
                    .filter(|request| {
                        request.profile_id == profile_id
                            && matches!(
                                request.status,
                                MatchRequestStatus::Waiting | MatchRequestStatus::Matched
                            )
                    })
                    .max_by(|a, b| {
                        (a.created_at_ms, &a.request_id).cmp(&(b.created_at_ms, &b.request_id))
                    })
                    .cloned())
            })
        }

        fn get_request(
            &self,
            request_id: &str,
        ) -> BoxFuture<'_, DomainResult<Option<MatchRequest>>> {
            let request_id = request_id.to_string();
            Box::pin(async move { Ok(self.requests.read().await.get(&request_id).cloned()) })
        }

        fn list_waiting_requests(
            &self,
            profile_id: &str,
        ) -> BoxFuture<'_, DomainResult<Vec<MatchRequest>>> {
            let profile_id = profile_id.to_string();
            Box::pin(async move {
                Ok(self
                    .requests
                    .read()
                    .await
                    .values()
                    .filter(|request| {
                        request.profile_id == profile_id
                            && request.status == MatchRequestStatus::Waiting
                    })
                    .cloned()
                    .collect())
            })
        }

        fn mark_request_failed(&self, request_id: &str) -> BoxFuture<'_, DomainResult<()>> {
            let request_id = request_id.to_string();
            Box::pin(async move {
                if let Some(request) = self.requests.write().await.get_mut(&request_id) {
                    request.status = MatchRequestStatus::Failed;
                }
                Ok(())
            })
        }

        fn get_session(
            &self,
            session_id: &str,
        ) -> BoxFuture<'_, DomainResult<Option<MatchSession>>> {
            let session_id = session_id.to_string();
            Box::pin(async move { Ok(self.sessions.read().await.get(&session_id).cloned()) })
        }

        fn find_session_by_request(
            &self,
            request_id: &str,
        ) -> BoxFuture<'_, DomainResult<Option<MatchSession>>> {
            let request_id = request_id.to_string();
            Box::pin(async move { Ok(self.session_for_request(&request_id).await) })
        }

        fn find_session_by_profile(
            &self,
            profile_id: &str,
        ) -> BoxFuture<'_, DomainResult<Option<MatchSession>>> {
            let profile_id = profile_id.to_string();
            Box::pin(async move {
                Ok(self
                    .sessions
                    .read()
                    .await
                    .values()
                    .find(|session| {
                        session.profile_a == profile_id || session.profile_b == profile_id
                    })
                    .cloned())
            })
        }

        fn attach_conversation(
            &self,
            session_id: &str,
            conversation_id: &str,
            force: bool,
        ) -> BoxFuture<'_, DomainResult<MatchSession>> {
            let session_id = session_id.to_string();
            let conversation_id = conversation_id.to_string();
            Box::pin(async move {
                let mut sessions = self.sessions.write().await;
                let session = sessions.get_mut(&session_id).ok_or(DomainError::NotFound)?;
                if let Some(existing) = &session.conversation_id {
                    if !force && existing != &conversation_id {
                        return Err(DomainError::Conflict);
                    }
                }
                session.conversation_id = Some(conversation_id);
                session.status = SessionStatus::Matched;
                Ok(session.clone())
            })
        }
    }

    #[derive(Default)]
    struct MockProfileRepo {
        profiles: Arc<RwLock<HashMap<String, Profile>>>,
    }

    impl MockProfileRepo {
        async fn insert(&self, profile: Profile) {
            self.profiles
                .write()
                .await
                .insert(profile.profile_id.clone(), profile);
        }
    }

    impl ProfileRepository for MockProfileRepo {
        fn get(&self, profile_id: &str) -> BoxFuture<'_, DomainResult<Option<Profile>>> {
            let profile_id = profile_id.to_string();
            Box::pin(async move { Ok(self.profiles.read().await.get(&profile_id).cloned()) })
        }

        fn get_by_identity(&self, identity: &str) -> BoxFuture<'_, DomainResult<Option<Profile>>> {
            let identity = identity.to_string();
            Box::pin(async move {
                Ok(self
                    .profiles
                    .read()
                    .await
                    .values()
                    .find(|profile| profile.identity.as_deref() == Some(identity.as_str()))
                    .cloned())
            })
        }
    }

    #[derive(Default)]
    struct MockConversationClient {
        by_key: Arc<RwLock<HashMap<String, String>>>,
        creates: AtomicUsize,
    }

    impl ConversationClient for MockConversationClient {
        fn create_conversation(
            &self,
            input: &ConversationCreate,
        ) -> BoxFuture<'_, DomainResult<String>> {
            let key = input.uniqueness_key.clone();
            Box::pin(async move {
                self.creates.fetch_add(1, Ordering::SeqCst);
                let mut by_key = self.by_key.write().await;
                if let Some(existing) = by_key.get(&key) {
                    return Ok(existing.clone());
                }
                let conversation_id = uuid_v7_without_dashes();
                by_key.insert(key, conversation_id.clone());
                Ok(conversation_id)
            })
        }
    }

    struct Harness {
        store: Arc<MockMatchStore>,
        profiles: Arc<MockProfileRepo>,
        chat: Arc<MockConversationClient>,
        service: MatchService,
    }

    fn harness() -> Harness {
        let store = Arc::new(MockMatchStore::default());
        let profiles = Arc::new(MockProfileRepo::default());
        let chat = Arc::new(MockConversationClient::default());
        let service = MatchService::new(store.clone(), profiles.clone(), chat.clone());
        Harness {
            store,
            profiles,
            chat,
            service,
        }
    }

    fn traveler(profile_id: &str, identity: Option<&str>) -> Profile {
        Profile {
            profile_id: profile_id.to_string(),
            identity: identity.map(str::to_string),
            display_name: format!("{profile_id}-name"),
            gender: Some(Gender::Female),
            age: Some(28),
            home_city: Some("jakarta".to_string()),
            languages: vec!["id".to_string(), "en".to_string()],
            onboarded: true,
        }
    }

    fn actor(identity: &str) -> ActorIdentity {
        ActorIdentity::with_identity(identity)
    }

    fn criteria(trip_card_id: &str) -> MatchCriteria {
        MatchCriteria {
            trip_card_id: trip_card_id.to_string(),
            preferences: MatchPreferences::default(),
        }
    }

    async fn seed_travelers(h: &Harness) {
        h.profiles.insert(traveler("p1", Some("id-p1"))).await;
        h.profiles.insert(traveler("p2", Some("id-p2"))).await;
    }

    fn waiting_request_id(outcome: &MatchOutcome) -> String {
        match outcome {
            MatchOutcome::Waiting(waiting) => {
                waiting.request_id.clone().expect("waiting request id")
            }
            MatchOutcome::Matched(_) => panic!("expected waiting outcome"),
        }
    }

    fn matched(outcome: &MatchOutcome) -> &MatchedParty {
        match outcome {
            MatchOutcome::Matched(party) => party,
            MatchOutcome::Waiting(_) => panic!("expected matched outcome"),
        }
    }

    fn rejection_code(err: DomainError) -> &'static str {
        match err {
            DomainError::Rejected { code, .. } => code,
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn submit_waits_without_partner() {
        let h = harness();
        seed_travelers(&h).await;

        let outcome = h.service.submit(&actor("id-p1"), criteria("t1")).await.expect("submit");
        let request_id = waiting_request_id(&outcome);
        assert_eq!(
            h.store.request_status(&request_id).await,
            Some(MatchRequestStatus::Waiting)
        );
    }

    #[tokio::test]
    async fn resubmit_cancels_previous_waiting_request() {
        let h = harness();
        seed_travelers(&h).await;

        let first = h.service.submit(&actor("id-p1"), criteria("t1")).await.expect("first");
        let first_id = waiting_request_id(&first);
        let second = h.service.submit(&actor("id-p1"), criteria("t2")).await.expect("second");
        let second_id = waiting_request_id(&second);

        assert_ne!(first_id, second_id);
        assert_eq!(
            h.store.request_status(&first_id).await,
            Some(MatchRequestStatus::Cancelled)
        );
        let waiting = h
            .store
            .list_waiting_requests("p1")
            .await
            .expect("list waiting");
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].request_id, second_id);
    }

    #[tokio::test]
    async fn second_submit_matches_waiting_partner() {
        let h = harness();
        seed_travelers(&h).await;

        let first = h.service.submit(&actor("id-p1"), criteria("t1")).await.expect("p1 submit");
        let r1 = waiting_request_id(&first);

        let outcome = h.service.submit(&actor("id-p2"), criteria("t1")).await.expect("p2 submit");
        let p2_view = matched(&outcome).clone();
        assert_eq!(p2_view.other_profile_id, "p1");
        assert_eq!(p2_view.other_identity, "id-p1");
        let conversation_id = p2_view.conversation_id.clone().expect("conversation");

        let session = h
            .store
            .get_session(&p2_view.session_id)
            .await
            .expect("get session")
            .expect("session row");
        assert_ne!(session.profile_a, session.profile_b);

        let polled = h.service.poll(&actor("id-p1"), &r1).await.expect("p1 poll");
        let p1_view = matched(&polled).clone();
        assert_eq!(p1_view.session_id, p2_view.session_id);
        assert_eq!(p1_view.other_profile_id, "p2");
        assert_eq!(p1_view.conversation_id.as_deref(), Some(conversation_id.as_str()));
    }

    #[tokio::test]
    async fn poll_after_match_short_circuits_pairing() {
        let h = harness();
        seed_travelers(&h).await;

        let first = h.service.submit(&actor("id-p1"), criteria("t1")).await.expect("p1 submit");
        let r1 = waiting_request_id(&first);
        h.service.submit(&actor("id-p2"), criteria("t1")).await.expect("p2 submit");

        let before = h.store.try_match_calls.load(Ordering::SeqCst);
        let again = h.service.poll(&actor("id-p1"), &r1).await.expect("poll");
        let once_more = h.service.poll(&actor("id-p1"), &r1).await.expect("poll again");
        assert_eq!(matched(&again).session_id, matched(&once_more).session_id);
        assert_eq!(h.store.try_match_calls.load(Ordering::SeqCst), before);
    }

    #[tokio::test]
    async fn poll_unknown_request_is_not_found() {
        let h = harness();
        seed_travelers(&h).await;
        let err = h.service.poll(&actor("id-p1"), "missing").await.unwrap_err();
        assert!(matches!(err, DomainError::NotFound));
    }

    #[tokio::test]
    async fn poll_foreign_request_is_forbidden() {
        let h = harness();
        seed_travelers(&h).await;
        let first = h.service.submit(&actor("id-p1"), criteria("t1")).await.expect("submit");
        let r1 = waiting_request_id(&first);

        let err = h.service.poll(&actor("id-p2"), &r1).await.unwrap_err();
        assert!(matches!(err, DomainError::Forbidden));
        assert_eq!(
            h.store.request_status(&r1).await,
            Some(MatchRequestStatus::Waiting)
        );
    }

    #[tokio::test]
    async fn cancel_foreign_request_is_forbidden() {
        let h = harness();
        seed_travelers(&h).await;
        let first = h.service.submit(&actor("id-p1"), criteria("t1")).await.expect("submit");
        let r1 = waiting_request_id(&first);

        let err = h.service.cancel(&actor("id-p2"), &r1).await.unwrap_err();
        assert!(matches!(err, DomainError::Forbidden));
        assert_eq!(
            h.store.request_status(&r1).await,
            Some(MatchRequestStatus::Waiting)
        );
    }

    #[tokio::test]
    async fn poll_cancelled_request_reports_rejection() {
        let h = harness();
        seed_travelers(&h).await;
        let first = h.service.submit(&actor("id-p1"), criteria("t1")).await.expect("submit");
        let r1 = waiting_request_id(&first);

        h.service.cancel(&actor("id-p1"), &r1).await.expect("cancel");
        let err = h.service.poll(&actor("id-p1"), &r1).await.unwrap_err();
        assert_eq!(rejection_code(err), "request_cancelled");
    }

    #[tokio::test]
    async fn try_match_store_error_is_recoverable() {
        let h = harness();
        seed_travelers(&h).await;
        let first = h.service.submit(&actor("id-p1"), criteria("t1")).await.expect("submit");
        let r1 = waiting_request_id(&first);

        h.store.fail_try_match.store(true, Ordering::SeqCst);
        let err = h.service.poll(&actor("id-p1"), &r1).await.unwrap_err();
        assert_eq!(rejection_code(err), "match_unavailable");
        // The request stays waiting so the client can keep polling.
        assert_eq!(
            h.store.request_status(&r1).await,
            Some(MatchRequestStatus::Waiting)
        );

        h.store.fail_try_match.store(false, Ordering::SeqCst);
        let outcome = h.service.poll(&actor("id-p1"), &r1).await.expect("poll");
        assert!(matches!(outcome, MatchOutcome::Waiting(_)));
    }

    #[tokio::test]
    async fn concurrent_polls_converge_on_one_conversation() {
        let h = harness();
        seed_travelers(&h).await;

        h.store
            .insert_request(MatchRequest {
                request_id: "r1".to_string(),
                profile_id: "p1".to_string(),
                trip_card_id: "t1".to_string(),
                preferences: MatchPreferences::default(),
                status: MatchRequestStatus::Matched,
                created_at_ms: now_ms(),
            })
            .await;
        h.store
            .insert_request(MatchRequest {
                request_id: "r2".to_string(),
                profile_id: "p2".to_string(),
                trip_card_id: "t1".to_string(),
                preferences: MatchPreferences::default(),
                status: MatchRequestStatus::Matched,
                created_at_ms: now_ms(),
            })
            .await;
        h.store
            .insert_session(MatchSession {
                session_id: "s1".to_string(),
                profile_a: "p1".to_string(),
                profile_b: "p2".to_string(),
                request_a: Some("r1".to_string()),
                request_b: Some("r2".to_string()),
                conversation_id: None,
                status: SessionStatus::Matched,
                created_at_ms: now_ms(),
            })
            .await;

        let actor_p1 = actor("id-p1");
        let actor_p2 = actor("id-p2");
        let (left, right) = tokio::join!(
            h.service.poll(&actor_p1, "r1"),
            h.service.poll(&actor_p2, "r2"),
        );
        let left = left.expect("p1 poll");
        let right = right.expect("p2 poll");
        let left_conversation = matched(&left).conversation_id.clone().expect("left id");
        let right_conversation = matched(&right).conversation_id.clone().expect("right id");
        assert_eq!(left_conversation, right_conversation);

        let session = h
            .store
            .get_session("s1")
            .await
            .expect("get")
            .expect("session");
        assert_eq!(session.conversation_id.as_deref(), Some(left_conversation.as_str()));

        // Re-polling never changes the attached id.
        let replay = h.service.poll(&actor("id-p1"), "r1").await.expect("replay");
        assert_eq!(
            matched(&replay).conversation_id.as_deref(),
            Some(left_conversation.as_str())
        );
    }

    #[tokio::test]
    async fn identity_fallback_resolves_partner() {
        let h = harness();
        seed_travelers(&h).await;
        // The session carries a stale profile id for p1's slot; only the
        // linked identity proves the slot is the caller's.
        h.profiles.insert(traveler("p1-old", Some("id-p1"))).await;
        h.store
            .insert_session(MatchSession {
                session_id: "s1".to_string(),
                profile_a: "p1-old".to_string(),
                profile_b: "p2".to_string(),
                request_a: Some("r1".to_string()),
                request_b: Some("r2".to_string()),
                conversation_id: None,
                status: SessionStatus::Matched,
                created_at_ms: now_ms(),
            })
            .await;

        let outcome = h
            .service
            .partner(&actor("id-p1"), "s1", None)
            .await
            .expect("partner");
        let view = matched(&outcome);
        assert_eq!(view.other_profile_id, "p2");
        assert_eq!(view.other_identity, "id-p2");
    }

    #[tokio::test]
    async fn partner_is_read_only() {
        let h = harness();
        seed_travelers(&h).await;
        h.store
            .insert_session(MatchSession {
                session_id: "s1".to_string(),
                profile_a: "p1".to_string(),
                profile_b: "p2".to_string(),
                request_a: None,
                request_b: None,
                conversation_id: None,
                status: SessionStatus::Matched,
                created_at_ms: now_ms(),
            })
            .await;

        let outcome = h
            .service
            .partner(&actor("id-p1"), "s1", None)
            .await
            .expect("partner");
        assert!(matched(&outcome).conversation_id.is_none());
        assert_eq!(h.chat.creates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn hard_slot_mismatch_reports_waiting() {
        let h = harness();
        seed_travelers(&h).await;
        h.profiles.insert(traveler("p3", Some("id-p3"))).await;
        h.store
            .insert_session(MatchSession {
                session_id: "s1".to_string(),
                profile_a: "p2".to_string(),
                profile_b: "p3".to_string(),
                request_a: None,
                request_b: None,
                conversation_id: None,
                status: SessionStatus::Matched,
                created_at_ms: now_ms(),
            })
            .await;

        let outcome = h
            .service
            .partner(&actor("id-p1"), "s1", None)
            .await
            .expect("partner");
        match outcome {
            MatchOutcome::Waiting(waiting) => {
                assert_eq!(waiting.session_id.as_deref(), Some("s1"));
            }
            MatchOutcome::Matched(_) => panic!("mismatched caller must not resolve"),
        }
    }

    #[tokio::test]
    async fn missing_partner_identity_reports_waiting() {
        let h = harness();
        h.profiles.insert(traveler("p1", Some("id-p1"))).await;
        h.profiles.insert(traveler("p2", None)).await;
        h.store
            .insert_request(MatchRequest {
                request_id: "r1".to_string(),
                profile_id: "p1".to_string(),
                trip_card_id: "t1".to_string(),
                preferences: MatchPreferences::default(),
                status: MatchRequestStatus::Matched,
                created_at_ms: now_ms(),
            })
            .await;
        h.store
            .insert_session(MatchSession {
                session_id: "s1".to_string(),
                profile_a: "p1".to_string(),
                profile_b: "p2".to_string(),
                request_a: Some("r1".to_string()),
                request_b: None,
                conversation_id: None,
                status: SessionStatus::Matched,
                created_at_ms: now_ms(),
            })
            .await;

        let outcome = h.service.poll(&actor("id-p1"), "r1").await.expect("poll");
        assert!(matches!(outcome, MatchOutcome::Waiting(_)));
        assert_eq!(h.chat.creates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn recovery_chain_finds_silently_paired_session() {
        let h = harness();
        seed_travelers(&h).await;

        h.service.submit(&actor("id-p2"), criteria("t1")).await.expect("p2 submit");
        // The primitive pairs during start but reports nothing back.
        h.store.start_pairs_silently.store(true, Ordering::SeqCst);
        let outcome = h.service.submit(&actor("id-p1"), criteria("t1")).await.expect("p1 submit");
        let view = matched(&outcome);
        assert_eq!(view.other_profile_id, "p2");
        assert!(view.conversation_id.is_some());
    }

    #[tokio::test]
    async fn recovery_chain_falls_back_to_profile_membership() {
        let h = harness();
        seed_travelers(&h).await;
        h.store
            .insert_session(MatchSession {
                session_id: "s1".to_string(),
                profile_a: "p1".to_string(),
                profile_b: "p2".to_string(),
                // Linkage not yet visible: the session references no request.
                request_a: None,
                request_b: None,
                conversation_id: None,
                status: SessionStatus::Pending,
                created_at_ms: now_ms(),
            })
            .await;

        h.store.start_inconclusive.store(true, Ordering::SeqCst);
        let outcome = h.service.submit(&actor("id-p1"), criteria("t1")).await.expect("submit");
        assert_eq!(matched(&outcome).session_id, "s1");
    }

    #[tokio::test]
    async fn inconclusive_start_reports_waiting_with_active_request() {
        let h = harness();
        seed_travelers(&h).await;

        h.store.start_inconclusive.store(true, Ordering::SeqCst);
        let outcome = h.service.submit(&actor("id-p1"), criteria("t1")).await.expect("submit");
        let request_id = waiting_request_id(&outcome);
        assert_eq!(
            h.store.request_status(&request_id).await,
            Some(MatchRequestStatus::Waiting)
        );
    }

    #[tokio::test]
    async fn cancel_after_match_is_a_noop() {
        let h = harness();
        seed_travelers(&h).await;

        let first = h.service.submit(&actor("id-p1"), criteria("t1")).await.expect("p1 submit");
        let r1 = waiting_request_id(&first);
        let outcome = h.service.submit(&actor("id-p2"), criteria("t1")).await.expect("p2 submit");
        let session_id = matched(&outcome).session_id.clone();

        h.service.cancel(&actor("id-p1"), &r1).await.expect("cancel");
        assert_eq!(
            h.store.request_status(&r1).await,
            Some(MatchRequestStatus::Matched)
        );
        assert!(h.store.get_session(&session_id).await.expect("get").is_some());

        let polled = h.service.poll(&actor("id-p1"), &r1).await.expect("poll");
        assert_eq!(matched(&polled).session_id, session_id);
    }

    #[tokio::test]
    async fn submit_requires_onboarded_profile() {
        let h = harness();
        let mut profile = traveler("p1", Some("id-p1"));
        profile.onboarded = false;
        h.profiles.insert(profile).await;

        let err = h.service.submit(&actor("id-p1"), criteria("t1")).await.unwrap_err();
        assert_eq!(rejection_code(err), "onboarding_incomplete");

        let err = h.service.submit(&actor("id-unknown"), criteria("t1")).await.unwrap_err();
        assert_eq!(rejection_code(err), "onboarding_incomplete");
    }

    #[tokio::test]
    async fn attach_requires_session_membership() {
        let h = harness();
        seed_travelers(&h).await;
        h.profiles.insert(traveler("p3", Some("id-p3"))).await;
        h.store
            .insert_session(MatchSession {
                session_id: "s1".to_string(),
                profile_a: "p1".to_string(),
                profile_b: "p2".to_string(),
                request_a: None,
                request_b: None,
                conversation_id: None,
                status: SessionStatus::Matched,
                created_at_ms: now_ms(),
            })
            .await;

        let err = h
            .service
            .attach_conversation(&actor("id-p3"), "s1", "c1", false)
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::Forbidden));

        let session = h
            .service
            .attach_conversation(&actor("id-p1"), "s1", "c1", false)
            .await
            .expect("attach");
        assert_eq!(session.conversation_id.as_deref(), Some("c1"));

        // Same id again is a no-op; a different id without force conflicts.
        h.service
            .attach_conversation(&actor("id-p1"), "s1", "c1", false)
            .await
            .expect("re-attach same id");
        let err = h
            .service
            .attach_conversation(&actor("id-p2"), "s1", "c2", false)
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::Conflict));

        // Forced attach wins.
        let session = h
            .service
            .attach_conversation(&actor("id-p2"), "s1", "c2", true)
            .await
            .expect("forced attach");
        assert_eq!(session.conversation_id.as_deref(), Some("c2"));
    }

    #[test]
    fn criteria_validation_rejects_bad_input() {
        let err = validate_criteria(MatchCriteria {
            trip_card_id: "   ".to_string(),
            preferences: MatchPreferences::default(),
        })
        .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));

        let err = validate_criteria(MatchCriteria {
            trip_card_id: "t1".to_string(),
            preferences: MatchPreferences {
                preferred_age_min: Some(40),
                preferred_age_max: Some(30),
                ..MatchPreferences::default()
            },
        })
        .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));

        let err = validate_criteria(MatchCriteria {
            trip_card_id: "t1".to_string(),
            preferences: MatchPreferences {
                preferred_age_min: Some(12),
                ..MatchPreferences::default()
            },
        })
        .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn criteria_validation_normalizes_languages() {
        let criteria = validate_criteria(MatchCriteria {
            trip_card_id: " t1 ".to_string(),
            preferences: MatchPreferences {
                preferred_languages: vec![
                    " EN ".to_string(),
                    "id".to_string(),
                    "en".to_string(),
                    "  ".to_string(),
                ],
                ..MatchPreferences::default()
            },
        })
        .expect("valid criteria");
        assert_eq!(criteria.trip_card_id, "t1");
        assert_eq!(
            criteria.preferences.preferred_languages,
            vec!["en".to_string(), "id".to_string()]
        );
    }
}
