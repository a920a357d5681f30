//! Committed-mutation change log of the poll store.
//!
//! Records carry storage-level images whose keys are namespaced
//! (`poll|<id>`, `option|<id>`, `user|<id>`). Consumers must strip the
//! prefixes before handing identifiers to anyone outside the store.

use super::{
    option::InternalOption,
    poll::{format_timestamp, InternalPoll},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const POLL_PREFIX: &str = "poll|";
pub const OPTION_PREFIX: &str = "option|";
pub const USER_PREFIX: &str = "user|";

pub const OPTION_CHANGE_SOURCE: &str = "pollstore.options";
pub const OPTION_UPDATED: &str = "OptionUpdated";
pub const POLL_CHANGE_SOURCE: &str = "pollstore.polls";
pub const POLL_UPDATED: &str = "PollUpdated";

pub fn storage_key(prefix: &str, id: &str) -> String {
    format!("{}{}", prefix, id)
}

/// Removes `prefix` from `key`. Keys that are not longer than the prefix
/// are returned unchanged.
pub fn strip_prefix<'a>(key: &'a str, prefix: &str) -> &'a str {
    if key.len() > prefix.len() && key.starts_with(prefix) {
        &key[prefix.len()..]
    } else {
        key
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    pub source: String,
    pub detail_type: String,
    pub detail: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", bound(deserialize = "T: Deserialize<'de>"))]
pub struct ChangeDetail<T> {
    #[serde(default)]
    pub old_image: Option<T>,
    #[serde(default)]
    pub new_image: Option<T>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionImage {
    pub pk: String,
    pub poll_key: String,
    pub index: i32,
    pub text: String,
    pub votes: i64,
    pub updated_at: String,
}

impl From<&InternalOption> for OptionImage {
    fn from(option: &InternalOption) -> Self {
        Self {
            pk: storage_key(OPTION_PREFIX, option.id.as_str()),
            poll_key: storage_key(POLL_PREFIX, option.poll_id.as_str()),
            index: option.index,
            text: option.text.clone(),
            votes: option.votes,
            updated_at: format_timestamp(&option.updated_at),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollImage {
    pub pk: String,
    pub owner_key: String,
    pub prompt: String,
    pub created_at: String,
    pub duration: i64,
    pub archived: bool,
}

impl From<&InternalPoll> for PollImage {
    fn from(poll: &InternalPoll) -> Self {
        Self {
            pk: storage_key(POLL_PREFIX, poll.id.as_str()),
            owner_key: storage_key(USER_PREFIX, poll.owner_id.as_str()),
            prompt: poll.prompt.clone(),
            created_at: format_timestamp(&poll.created_at),
            duration: poll.duration,
            archived: poll.archived,
        }
    }
}

impl ChangeRecord {
    pub fn new<T: Serialize>(
        source: &str,
        detail_type: &str,
        detail: &ChangeDetail<T>,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            source: source.to_owned(),
            detail_type: detail_type.to_owned(),
            detail: serde_json::to_value(detail)?,
        })
    }

    pub fn option_updated(
        old: &InternalOption,
        new: &InternalOption,
    ) -> Result<Self, serde_json::Error> {
        Self::new(
            OPTION_CHANGE_SOURCE,
            OPTION_UPDATED,
            &ChangeDetail {
                old_image: Some(OptionImage::from(old)),
                new_image: Some(OptionImage::from(new)),
            },
        )
    }

    pub fn poll_updated(old: &InternalPoll, new: &InternalPoll) -> Result<Self, serde_json::Error> {
        Self::new(
            POLL_CHANGE_SOURCE,
            POLL_UPDATED,
            &ChangeDetail {
                old_image: Some(PollImage::from(old)),
                new_image: Some(PollImage::from(new)),
            },
        )
    }
}
