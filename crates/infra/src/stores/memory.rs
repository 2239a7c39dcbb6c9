use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use temanjalan_domain::DomainResult;
use temanjalan_domain::error::DomainError;
use temanjalan_domain::matching::{
    MatchCriteria, MatchRequest, MatchRequestStatus, MatchSession, SessionStatus,
};
use temanjalan_domain::ports::BoxFuture;
use temanjalan_domain::ports::conversations::{ConversationClient, ConversationCreate};
use temanjalan_domain::ports::matching::MatchStore;
use temanjalan_domain::ports::profiles::ProfileRepository;
use temanjalan_domain::profiles::Profile;
use temanjalan_domain::util::{now_ms, uuid_v7_without_dashes};

/// Memory-backed pairing store for `data_backend = "memory"` and tests.
/// Candidate selection by preference/city/age belongs to the real store's
/// functions; this one pairs the oldest waiting request from any other
/// profile, which is enough to exercise the reconciliation protocol.
#[derive(Default)]
pub struct InMemoryMatchStore {
    requests: Arc<RwLock<HashMap<String, MatchRequest>>>,
    sessions: Arc<RwLock<HashMap<String, MatchSession>>>,
}

impl InMemoryMatchStore {
    pub fn new() -> Self {
        Self::default()
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
            .min_by(|a, b| (a.created_at_ms, &a.request_id).cmp(&(b.created_at_ms, &b.request_id)))
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

impl MatchStore for InMemoryMatchStore {
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
            self.requests
                .write()
                .await
                .insert(request_id.clone(), request);
            Ok(self.pair(&request_id).await)
        })
    }

    fn try_match(&self, request_id: &str) -> BoxFuture<'_, DomainResult<Option<MatchSession>>> {
        let request_id = request_id.to_string();
        Box::pin(async move { Ok(self.pair(&request_id).await) })
    }

    fn cancel_match(&self, request_id: &str) -> BoxFuture<'_, DomainResult<()>> {
        let request_id = request_id.to_string();
        Box::pin(async move {
            let mut requests = self.requests.write().await;
            if let Some(request) = requests.get_mut(&request_id) {
                // A request consumed by a session must never un-match.
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

    fn get_request(&self, request_id: &str) -> BoxFuture<'_, DomainResult<Option<MatchRequest>>> {
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
            let mut requests = self.requests.write().await;
            if let Some(request) = requests.get_mut(&request_id) {
                if request.status == MatchRequestStatus::Waiting {
                    request.status = MatchRequestStatus::Failed;
                }
            }
            Ok(())
        })
    }

    fn get_session(&self, session_id: &str) -> BoxFuture<'_, DomainResult<Option<MatchSession>>> {
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
            let sessions = self.sessions.read().await;
            Ok(sessions
                .values()
                .filter(|session| {
                    session.profile_a == profile_id || session.profile_b == profile_id
                })
                .max_by(|a, b| {
                    (a.created_at_ms, &a.session_id).cmp(&(b.created_at_ms, &b.session_id))
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
pub struct InMemoryProfileRepository {
    profiles: Arc<RwLock<HashMap<String, Profile>>>,
}

impl InMemoryProfileRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert(&self, profile: Profile) {
        self.profiles
            .write()
            .await
            .insert(profile.profile_id.clone(), profile);
    }
}

impl ProfileRepository for InMemoryProfileRepository {
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

/// Conversation client honouring the exactly-once-per-uniqueness-key
/// contract in process memory. Backs the memory data backend and the API
/// tests, where it doubles as the convergence check for racing provisioners.
#[derive(Default)]
pub struct LocalConversationClient {
    by_key: Arc<RwLock<HashMap<String, String>>>,
}

impl LocalConversationClient {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConversationClient for LocalConversationClient {
    fn create_conversation(
        &self,
        input: &ConversationCreate,
    ) -> BoxFuture<'_, DomainResult<String>> {
        let key = input.uniqueness_key.clone();
        Box::pin(async move {
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
