use crate::DomainResult;
use crate::profiles::Profile;

pub trait ProfileRepository: Send + Sync {
    fn get(&self, profile_id: &str) -> crate::ports::BoxFuture<'_, DomainResult<Option<Profile>>>;

    fn get_by_identity(
        &self,
        identity: &str,
    ) -> crate::ports::BoxFuture<'_, DomainResult<Option<Profile>>>;
}
