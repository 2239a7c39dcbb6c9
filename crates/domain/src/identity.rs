use serde::{Deserialize, Serialize};

/// The caller as asserted by the identity service. `identity` is the
/// external identity from the bearer token, distinct from the internal
/// profile id it may be linked to.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActorIdentity {
    pub identity: String,
    pub username: String,
}

impl ActorIdentity {
    pub fn with_identity(identity: impl Into<String>) -> Self {
        let identity = identity.into();
        Self {
            identity: identity.clone(),
            username: identity,
        }
    }
}
