use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Value, to_value};
use surrealdb::{
    Surreal,
    engine::remote::ws::{Client, Ws},
    opt::auth::Root,
};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};

use temanjalan_domain::DomainResult;
use temanjalan_domain::error::DomainError;
use temanjalan_domain::matching::{
    MatchCriteria, MatchPreferences, MatchRequest, MatchRequestStatus, MatchSession, SessionStatus,
};
use temanjalan_domain::ports::BoxFuture;
use temanjalan_domain::ports::matching::MatchStore;
use temanjalan_domain::ports::profiles::ProfileRepository;
use temanjalan_domain::profiles::{Gender, Profile};

use crate::db::DbConfig;

const SESSION_FIELDS: &str = "session_id, profile_a, profile_b, request_a, request_b, \
     conversation_id, status, <string>created_at AS created_at";
const REQUEST_FIELDS: &str =
    "request_id, profile_id, trip_card_id, preferences, status, <string>created_at AS created_at";

/// Pairing primitive adapter. The pairing decision itself lives in the
/// store's functions (`fn::start_match`, `fn::try_match`,
/// `fn::cancel_match`, `fn::get_active_match_request`), which are assumed
/// transactional and project their row results with `<string>` timestamp
/// casts; this adapter only invokes them and reads the tables they maintain.
pub struct SurrealMatchStore {
    client: Arc<Surreal<Client>>,
}

impl SurrealMatchStore {
    pub fn with_client(client: Arc<Surreal<Client>>) -> Self {
        Self { client }
    }

    pub async fn new(db_config: &DbConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: connect(db_config).await?,
        })
    }

    fn map_surreal_error(err: surrealdb::Error) -> DomainError {
        map_surreal_error(err)
    }

    async fn select_session(
        client: &Surreal<Client>,
        where_clause: &str,
        bindings: Vec<(&'static str, Value)>,
    ) -> DomainResult<Option<MatchSession>> {
        let query = format!(
            "SELECT {SESSION_FIELDS} FROM match_session WHERE {where_clause} \
             ORDER BY created_at DESC LIMIT 1"
        );
        let mut pending = client.query(&query);
        for (key, value) in bindings {
            pending = pending.bind((key, value));
        }
        let mut response = pending.await.map_err(Self::map_surreal_error)?;
        let rows: Vec<Value> = response
            .take(0)
            .map_err(|err| DomainError::Store(format!("invalid query result: {err}")))?;
        let mut sessions = decode_session_rows(rows)?;
        Ok(sessions.pop())
    }
}

impl MatchStore for SurrealMatchStore {
    fn start_match(
        &self,
        profile_id: &str,
        criteria: &MatchCriteria,
    ) -> BoxFuture<'_, DomainResult<Option<MatchSession>>> {
        let profile_id = profile_id.to_string();
        let trip_card_id = criteria.trip_card_id.clone();
        let preferences = to_value(&criteria.preferences).unwrap_or(Value::Null);
        let client = self.client.clone();
        Box::pin(async move {
            let mut response = client
                .query("RETURN fn::start_match($profile_id, $trip_card_id, $preferences)")
                .bind(("profile_id", profile_id))
                .bind(("trip_card_id", trip_card_id))
                .bind(("preferences", preferences))
                .await
                .map_err(Self::map_surreal_error)?;
            let value: Option<Value> = response
                .take(0)
                .map_err(|err| DomainError::Store(format!("invalid query result: {err}")))?;
            decode_optional_session(value)
        })
    }

    fn try_match(&self, request_id: &str) -> BoxFuture<'_, DomainResult<Option<MatchSession>>> {
        let request_id = request_id.to_string();
        let client = self.client.clone();
        Box::pin(async move {
            let mut response = client
                .query("RETURN fn::try_match($request_id)")
                .bind(("request_id", request_id))
                .await
                .map_err(Self::map_surreal_error)?;
            let value: Option<Value> = response
                .take(0)
                .map_err(|err| DomainError::Store(format!("invalid query result: {err}")))?;
            decode_optional_session(value)
        })
    }

    fn cancel_match(&self, request_id: &str) -> BoxFuture<'_, DomainResult<()>> {
        let request_id = request_id.to_string();
        let client = self.client.clone();
        Box::pin(async move {
            client
                .query("RETURN fn::cancel_match($request_id)")
                .bind(("request_id", request_id))
                .await
                .map_err(Self::map_surreal_error)?;
            Ok(())
        })
    }

    fn get_active_request(
        &self,
        profile_id: &str,
    ) -> BoxFuture<'_, DomainResult<Option<MatchRequest>>> {
        let profile_id = profile_id.to_string();
        let client = self.client.clone();
        Box::pin(async move {
            let mut response = client
                .query("RETURN fn::get_active_match_request($profile_id)")
                .bind(("profile_id", profile_id))
                .await
                .map_err(Self::map_surreal_error)?;
            let value: Option<Value> = response
                .take(0)
                .map_err(|err| DomainError::Store(format!("invalid query result: {err}")))?;
            match value {
                None | Some(Value::Null) => Ok(None),
                Some(row) => Ok(Some(decode_request_row(row)?)),
            }
        })
    }

    fn get_request(&self, request_id: &str) -> BoxFuture<'_, DomainResult<Option<MatchRequest>>> {
        let request_id = request_id.to_string();
        let client = self.client.clone();
        Box::pin(async move {
            let mut response = client
                .query(format!(
                    "SELECT {REQUEST_FIELDS} FROM match_request \
                     WHERE request_id = $request_id LIMIT 1"
                ))
                .bind(("request_id", request_id))
                .await
                .map_err(Self::map_surreal_error)?;
            let rows: Vec<Value> = response
                .take(0)
                .map_err(|err| DomainError::Store(format!("invalid query result: {err}")))?;
            let mut requests = decode_request_rows(rows)?;
            Ok(requests.pop())
        })
    }

    fn list_waiting_requests(
        &self,
        profile_id: &str,
    ) -> BoxFuture<'_, DomainResult<Vec<MatchRequest>>> {
        let profile_id = profile_id.to_string();
        let client = self.client.clone();
        Box::pin(async move {
            let mut response = client
                .query(format!(
                    "SELECT {REQUEST_FIELDS} FROM match_request \
                     WHERE profile_id = $profile_id AND status = 'waiting' \
                     ORDER BY created_at ASC"
                ))
                .bind(("profile_id", profile_id))
                .await
                .map_err(Self::map_surreal_error)?;
            let rows: Vec<Value> = response
                .take(0)
                .map_err(|err| DomainError::Store(format!("invalid query result: {err}")))?;
            decode_request_rows(rows)
        })
    }

    fn mark_request_failed(&self, request_id: &str) -> BoxFuture<'_, DomainResult<()>> {
        let request_id = request_id.to_string();
        let client = self.client.clone();
        Box::pin(async move {
            client
                .query(
                    "UPDATE match_request SET status = 'failed' \
                     WHERE request_id = $request_id AND status = 'waiting'",
                )
                .bind(("request_id", request_id))
                .await
                .map_err(Self::map_surreal_error)?;
            Ok(())
        })
    }

    fn get_session(&self, session_id: &str) -> BoxFuture<'_, DomainResult<Option<MatchSession>>> {
        let session_id = session_id.to_string();
        let client = self.client.clone();
        Box::pin(async move {
            Self::select_session(
                &client,
                "session_id = $session_id",
                vec![("session_id", Value::String(session_id))],
            )
            .await
        })
    }

    fn find_session_by_request(
        &self,
        request_id: &str,
    ) -> BoxFuture<'_, DomainResult<Option<MatchSession>>> {
        let request_id = request_id.to_string();
        let client = self.client.clone();
        Box::pin(async move {
            Self::select_session(
                &client,
                "(request_a = $request_id OR request_b = $request_id)",
                vec![("request_id", Value::String(request_id))],
            )
            .await
        })
    }

    fn find_session_by_profile(
        &self,
        profile_id: &str,
    ) -> BoxFuture<'_, DomainResult<Option<MatchSession>>> {
        let profile_id = profile_id.to_string();
        let client = self.client.clone();
        Box::pin(async move {
            Self::select_session(
                &client,
                "(profile_a = $profile_id OR profile_b = $profile_id) \
                 AND status IN ['pending', 'matched']",
                vec![("profile_id", Value::String(profile_id))],
            )
            .await
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
        let client = self.client.clone();
        Box::pin(async move {
            let query = if force {
                "UPDATE match_session SET conversation_id = $conversation_id, \
                 status = 'matched' WHERE session_id = $session_id"
            } else {
                "UPDATE match_session SET conversation_id = $conversation_id, \
                 status = 'matched' WHERE session_id = $session_id \
                 AND (conversation_id = NONE OR conversation_id = $conversation_id)"
            };
            client
                .query(query)
                .bind(("session_id", session_id.clone()))
                .bind(("conversation_id", conversation_id.clone()))
                .await
                .map_err(Self::map_surreal_error)?;

            let session = Self::select_session(
                &client,
                "session_id = $session_id",
                vec![("session_id", Value::String(session_id))],
            )
            .await?
            .ok_or(DomainError::NotFound)?;

            if !force && session.conversation_id.as_deref() != Some(conversation_id.as_str()) {
                return Err(DomainError::Conflict);
            }
            Ok(session)
        })
    }
}

pub struct SurrealProfileRepository {
    client: Arc<Surreal<Client>>,
}

impl SurrealProfileRepository {
    pub fn with_client(client: Arc<Surreal<Client>>) -> Self {
        Self { client }
    }

    pub async fn new(db_config: &DbConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: connect(db_config).await?,
        })
    }

    async fn select_profile(
        client: &Surreal<Client>,
        where_clause: &str,
        binding: (&'static str, Value),
    ) -> DomainResult<Option<Profile>> {
        let query = format!(
            "SELECT profile_id, identity, display_name, gender, age, home_city, \
             languages, onboarded FROM traveler_profile WHERE {where_clause} LIMIT 1"
        );
        let mut response = client
            .query(&query)
            .bind(binding)
            .await
            .map_err(map_surreal_error)?;
        let rows: Vec<Value> = response
            .take(0)
            .map_err(|err| DomainError::Store(format!("invalid query result: {err}")))?;
        rows.into_iter().next().map(decode_profile_row).transpose()
    }
}

impl ProfileRepository for SurrealProfileRepository {
    fn get(&self, profile_id: &str) -> BoxFuture<'_, DomainResult<Option<Profile>>> {
        let profile_id = profile_id.to_string();
        let client = self.client.clone();
        Box::pin(async move {
            Self::select_profile(
                &client,
                "profile_id = $profile_id",
                ("profile_id", Value::String(profile_id)),
            )
            .await
        })
    }

    fn get_by_identity(&self, identity: &str) -> BoxFuture<'_, DomainResult<Option<Profile>>> {
        let identity = identity.to_string();
        let client = self.client.clone();
        Box::pin(async move {
            Self::select_profile(
                &client,
                "identity = $identity",
                ("identity", Value::String(identity)),
            )
            .await
        })
    }
}

async fn connect(db_config: &DbConfig) -> anyhow::Result<Arc<Surreal<Client>>> {
    let db = Surreal::<Client>::init();
    db.connect::<Ws>(db_config.endpoint.as_str()).await?;
    db.signin(Root {
        username: db_config.username.as_str(),
        password: db_config.password.as_str(),
    })
    .await?;
    db.use_ns(db_config.namespace.as_str())
        .use_db(db_config.database.as_str())
        .await?;
    Ok(Arc::new(db))
}

fn map_surreal_error(err: surrealdb::Error) -> DomainError {
    let error_message = err.to_string().to_lowercase();
    if error_message.contains("already exists")
        || error_message.contains("duplicate")
        || error_message.contains("unique")
        || error_message.contains("conflict")
    {
        return DomainError::Conflict;
    }
    DomainError::Store(format!("surreal query failed: {error_message}"))
}

fn parse_rfc3339(value: &str) -> DomainResult<i64> {
    let dt = OffsetDateTime::parse(value, &Rfc3339)
        .map_err(|err| DomainError::Store(format!("invalid timestamp: {err}")))?;
    Ok((dt.unix_timestamp_nanos() / 1_000_000) as i64)
}

#[derive(Debug, Deserialize)]
struct SurrealRequestRow {
    request_id: String,
    profile_id: String,
    trip_card_id: String,
    preferences: Option<Value>,
    status: String,
    created_at: String,
}

#[derive(Debug, Deserialize)]
struct SurrealSessionRow {
    session_id: String,
    profile_a: String,
    profile_b: String,
    request_a: Option<String>,
    request_b: Option<String>,
    conversation_id: Option<String>,
    status: String,
    created_at: String,
}

#[derive(Debug, Deserialize)]
struct SurrealProfileRow {
    profile_id: String,
    identity: Option<String>,
    display_name: Option<String>,
    gender: Option<String>,
    age: Option<u8>,
    home_city: Option<String>,
    languages: Option<Vec<String>>,
    onboarded: Option<bool>,
}

fn decode_optional_session(value: Option<Value>) -> DomainResult<Option<MatchSession>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(row) => Ok(Some(decode_session_row(row)?)),
    }
}

fn decode_session_rows(rows: Vec<Value>) -> DomainResult<Vec<MatchSession>> {
    rows.into_iter().map(decode_session_row).collect()
}

fn decode_session_row(row: Value) -> DomainResult<MatchSession> {
    let row: SurrealSessionRow = serde_json::from_value(row)
        .map_err(|err| DomainError::Store(format!("invalid match session row: {err}")))?;
    let status = SessionStatus::parse(&row.status)
        .ok_or_else(|| DomainError::Store(format!("invalid session status '{}'", row.status)))?;
    Ok(MatchSession {
        session_id: row.session_id,
        profile_a: row.profile_a,
        profile_b: row.profile_b,
        request_a: row.request_a,
        request_b: row.request_b,
        conversation_id: row.conversation_id,
        status,
        created_at_ms: parse_rfc3339(&row.created_at)?,
    })
}

fn decode_request_rows(rows: Vec<Value>) -> DomainResult<Vec<MatchRequest>> {
    rows.into_iter().map(decode_request_row).collect()
}

fn decode_request_row(row: Value) -> DomainResult<MatchRequest> {
    let row: SurrealRequestRow = serde_json::from_value(row)
        .map_err(|err| DomainError::Store(format!("invalid match request row: {err}")))?;
    let status = MatchRequestStatus::parse(&row.status)
        .ok_or_else(|| DomainError::Store(format!("invalid request status '{}'", row.status)))?;
    let preferences = match row.preferences {
        None | Some(Value::Null) => MatchPreferences::default(),
        Some(value) => serde_json::from_value(value)
            .map_err(|err| DomainError::Store(format!("invalid match preferences: {err}")))?,
    };
    Ok(MatchRequest {
        request_id: row.request_id,
        profile_id: row.profile_id,
        trip_card_id: row.trip_card_id,
        preferences,
        status,
        created_at_ms: parse_rfc3339(&row.created_at)?,
    })
}

fn decode_profile_row(row: Value) -> DomainResult<Profile> {
    let row: SurrealProfileRow = serde_json::from_value(row)
        .map_err(|err| DomainError::Store(format!("invalid traveler profile row: {err}")))?;
    let gender = match row.gender.as_deref() {
        None => None,
        Some("female") => Some(Gender::Female),
        Some("male") => Some(Gender::Male),
        Some(_) => Some(Gender::Other),
    };
    Ok(Profile {
        display_name: row.display_name.unwrap_or_else(|| row.profile_id.clone()),
        profile_id: row.profile_id,
        identity: row.identity,
        gender,
        age: row.age,
        home_city: row.home_city,
        languages: row.languages.unwrap_or_default(),
        onboarded: row.onboarded.unwrap_or(false),
    })
}
