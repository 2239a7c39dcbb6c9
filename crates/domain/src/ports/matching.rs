use crate::DomainResult;
use crate::matching::{MatchCriteria, MatchRequest, MatchSession};

/// The opaque pairing primitive plus the session/request reads the
/// reconciliation protocol needs. `start_match` and `try_match` are assumed
/// internally transactional: either they produce a two-party session or they
/// leave the request waiting, and a request already consumed by a session is
/// never paired again. The protocol layers its own recovery on top because
/// neither call is guaranteed to return a consistent view synchronously to
/// the caller that triggered the pairing.
pub trait MatchStore: Send + Sync {
    fn start_match(
        &self,
        profile_id: &str,
        criteria: &MatchCriteria,
    ) -> crate::ports::BoxFuture<'_, DomainResult<Option<MatchSession>>>;

    fn try_match(
        &self,
        request_id: &str,
    ) -> crate::ports::BoxFuture<'_, DomainResult<Option<MatchSession>>>;

    fn cancel_match(&self, request_id: &str) -> crate::ports::BoxFuture<'_, DomainResult<()>>;

    fn get_active_request(
        &self,
        profile_id: &str,
    ) -> crate::ports::BoxFuture<'_, DomainResult<Option<MatchRequest>>>;

    fn get_request(
        &self,
        request_id: &str,
    ) -> crate::ports::BoxFuture<'_, DomainResult<Option<MatchRequest>>>;

    fn list_waiting_requests(
        &self,
        profile_id: &str,
    ) -> crate::ports::BoxFuture<'_, DomainResult<Vec<MatchRequest>>>;

    fn mark_request_failed(
        &self,
        request_id: &str,
    ) -> crate::ports::BoxFuture<'_, DomainResult<()>>;

    fn get_session(
        &self,
        session_id: &str,
    ) -> crate::ports::BoxFuture<'_, DomainResult<Option<MatchSession>>>;

    fn find_session_by_request(
        &self,
        request_id: &str,
    ) -> crate::ports::BoxFuture<'_, DomainResult<Option<MatchSession>>>;

    fn find_session_by_profile(
        &self,
        profile_id: &str,
    ) -> crate::ports::BoxFuture<'_, DomainResult<Option<MatchSession>>>;

    fn attach_conversation(
        &self,
        session_id: &str,
        conversation_id: &str,
        force: bool,
    ) -> crate::ports::BoxFuture<'_, DomainResult<MatchSession>>;
}
