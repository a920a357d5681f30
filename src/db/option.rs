use super::{poll::PollId, string_id};
use chrono::{DateTime, Utc};

string_id!(OptionId);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InternalOption {
    pub id: OptionId,
    pub poll_id: PollId,
    /// Position within the poll, assigned at creation.
    pub index: i32,
    pub text: String,
    pub votes: i64,
    pub updated_at: DateTime<Utc>,
}
