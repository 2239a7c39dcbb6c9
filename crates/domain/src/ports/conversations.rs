use serde_json::Value;

use crate::DomainResult;

#[derive(Clone, Debug)]
pub struct ConversationCreate {
    pub members: Vec<String>,
    pub name: String,
    pub attributes: Value,
    pub uniqueness_key: String,
}

/// External chat service. Creation is idempotent per uniqueness key:
/// concurrent creates with the same key must resolve to the same
/// conversation id. The provisioning protocol relies on that contract, it
/// does not enforce it.
pub trait ConversationClient: Send + Sync {
    fn create_conversation(
        &self,
        input: &ConversationCreate,
    ) -> crate::ports::BoxFuture<'_, DomainResult<String>>;
}
