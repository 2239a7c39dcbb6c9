use std::sync::Arc;

use serde_json::{Map, Value, json};

use crate::DomainResult;
use crate::error::DomainError;
use crate::matching::MatchSession;
use crate::ports::conversations::{ConversationClient, ConversationCreate};
use crate::ports::matching::MatchStore;
use crate::util::member_set_digest;

const CONVERSATION_NAME: &str = "Teman jalan";
const CONVERSATION_KIND: &str = "travel_buddy";
const MEMBER_ROLE: &str = "traveler";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Provisioned {
    Ready(String),
    MissingIdentity,
}

/// Idempotent conversation provisioning for a matched session. Exactly-once
/// creation is delegated to the conversation service's uniqueness-key
/// contract; the attach step is safe to run twice, so two callers racing
/// through here converge on the same conversation id.
#[derive(Clone)]
pub struct ConversationProvisioner {
    client: Arc<dyn ConversationClient>,
    store: Arc<dyn MatchStore>,
}

impl ConversationProvisioner {
    pub fn new(client: Arc<dyn ConversationClient>, store: Arc<dyn MatchStore>) -> Self {
        Self { client, store }
    }

    pub async fn ensure(
        &self,
        session: &MatchSession,
        self_identity: &str,
        other_identity: Option<&str>,
    ) -> DomainResult<Provisioned> {
        if let Some(existing) = &session.conversation_id {
            return Ok(Provisioned::Ready(existing.clone()));
        }

        let Some(other_identity) = other_identity else {
            return Ok(Provisioned::MissingIdentity);
        };
        if self_identity.trim().is_empty() || other_identity.trim().is_empty() {
            return Ok(Provisioned::MissingIdentity);
        }

        let mut members = vec![self_identity.to_string(), other_identity.to_string()];
        members.sort();
        members.dedup();
        let uniqueness_key = member_set_digest(&members);

        let input = ConversationCreate {
            members: members.clone(),
            name: CONVERSATION_NAME.to_string(),
            attributes: conversation_attributes(&session.session_id, &members),
            uniqueness_key,
        };

        let conversation_id = self
            .client
            .create_conversation(&input)
            .await
            .map_err(|err| match err {
                rejection @ DomainError::Rejected { .. } => rejection,
                other => DomainError::rejected("conversation_unavailable", other.to_string()),
            })?;

        // Last successful forced attach wins; racing provisioners derived the
        // same id from the uniqueness key, so the winner is indistinguishable.
        let updated = self
            .store
            .attach_conversation(&session.session_id, &conversation_id, true)
            .await?;

        Ok(Provisioned::Ready(
            updated.conversation_id.unwrap_or(conversation_id),
        ))
    }
}

fn conversation_attributes(session_id: &str, members: &[String]) -> Value {
    let mut member_roles = Map::new();
    for member in members {
        member_roles.insert(member.clone(), Value::String(MEMBER_ROLE.to_string()));
    }
    json!({
        "kind": CONVERSATION_KIND,
        "category": "match",
        "session_id": session_id,
        "member_roles": Value::Object(member_roles),
    })
}
