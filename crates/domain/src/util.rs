use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use uuid::Uuid;

pub fn uuid_v7_without_dashes() -> String {
    Uuid::now_v7().simple().to_string()
}

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

pub fn format_ms_rfc3339(epoch_ms: i64) -> String {
    let fallback = OffsetDateTime::from_unix_timestamp(0).unwrap_or(OffsetDateTime::UNIX_EPOCH);
    let value =
        OffsetDateTime::from_unix_timestamp_nanos(epoch_ms as i128 * 1_000_000).unwrap_or(fallback);
    value
        .format(&Rfc3339)
        .unwrap_or("1970-01-01T00:00:00Z".to_string())
}

/// Stable digest over a canonical member set. Both sides of a session derive
/// the same digest regardless of call order, so the conversation service can
/// collapse concurrent creations onto one conversation.
pub fn member_set_digest(members: &[String]) -> String {
    let mut canonical: Vec<&str> = members.iter().map(String::as_str).collect();
    canonical.sort_unstable();
    canonical.dedup();
    let mut hasher = Sha256::new();
    for member in canonical {
        hasher.update(member.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}
