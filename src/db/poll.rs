use super::string_id;
use chrono::{DateTime, SecondsFormat, Utc};

string_id!(PollId);
string_id!(
    /// Owner of a poll, as issued by the identity provider.
    UserId
);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InternalPoll {
    pub id: PollId,
    pub owner_id: UserId,
    pub prompt: String,
    pub created_at: DateTime<Utc>,
    /// Seconds after `created_at` during which votes are accepted.
    pub duration: i64,
    pub archived: bool,
}

impl InternalPoll {
    /// Expiration as epoch milliseconds. Sub-millisecond precision of
    /// `created_at` is dropped, matching how it is advertised to clients.
    pub fn expires_at_millis(&self) -> i64 {
        self.created_at
            .timestamp_millis()
            .saturating_add(self.duration.saturating_mul(1000))
    }
}

/// RFC 3339 with millisecond precision, the format every timestamp is
/// advertised in.
pub fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}
