use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Gender {
    Female,
    Male,
    Other,
}

/// A durable traveler record. `identity` is the linked external identity;
/// it may still be absent right after signup while identity linking is in
/// flight, which is exactly the window the partner-resolution fallback
/// exists for.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Profile {
    pub profile_id: String,
    pub identity: Option<String>,
    pub display_name: String,
    pub gender: Option<Gender>,
    pub age: Option<u8>,
    pub home_city: Option<String>,
    pub languages: Vec<String>,
    pub onboarded: bool,
}
