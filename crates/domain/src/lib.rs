pub mod auth;
pub mod conversations;
pub mod error;
pub mod identity;
pub mod matching;
pub mod ports;
pub mod profiles;
pub mod util;

pub type DomainResult<T> = Result<T, error::DomainError>;
