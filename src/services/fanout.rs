use super::broadcast::Publisher;
use crate::db::changes::{
    strip_prefix, ChangeDetail, ChangeRecord, OptionImage, PollImage, OPTION_CHANGE_SOURCE,
    OPTION_PREFIX, OPTION_UPDATED, POLL_CHANGE_SOURCE, POLL_PREFIX, POLL_UPDATED, USER_PREFIX,
};
use crate::db::poll::PollId;
use crate::events::{FanoutEvent, Notification, Topic};
use futures::{Stream, StreamExt};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Selects change records by `(source, detailType)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeFilter {
    pub source: String,
    pub detail_type: String,
}

impl ChangeFilter {
    pub fn new(source: impl Into<String>, detail_type: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            detail_type: detail_type.into(),
        }
    }

    pub fn matches(&self, record: &ChangeRecord) -> bool {
        record.source == self.source && record.detail_type == self.detail_type
    }
}

#[derive(Clone, Debug)]
pub struct FanoutSettings {
    pub options: ChangeFilter,
    pub polls: ChangeFilter,
    /// Emit `pollArchived` for archive-only transitions.
    pub notify_archive: bool,
}

impl Default for FanoutSettings {
    fn default() -> Self {
        Self {
            options: ChangeFilter::new(OPTION_CHANGE_SOURCE, OPTION_UPDATED),
            polls: ChangeFilter::new(POLL_CHANGE_SOURCE, POLL_UPDATED),
            notify_archive: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("record does not match any configured change source")]
    Unrecognized,
    #[error("undecodable change detail: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("change detail carries no new image")]
    MissingImage,
}

/// Turns store change records into poll-scoped notifications.
pub struct FanoutRouter {
    settings: FanoutSettings,
    publisher: Arc<dyn Publisher>,
}

impl FanoutRouter {
    pub fn new(settings: FanoutSettings, publisher: Arc<dyn Publisher>) -> Self {
        Self {
            settings,
            publisher,
        }
    }

    /// `Ok(None)` means the record was understood but needs no notification.
    pub fn route(&self, record: &ChangeRecord) -> Result<Option<(Topic, FanoutEvent)>, RouteError> {
        let event = if self.settings.options.matches(record) {
            let detail: ChangeDetail<OptionImage> = serde_json::from_value(record.detail.clone())?;
            option_changed(detail)?
        } else if self.settings.polls.matches(record) {
            let detail: ChangeDetail<PollImage> = serde_json::from_value(record.detail.clone())?;
            self.poll_changed(detail)?
        } else {
            return Err(RouteError::Unrecognized);
        };
        Ok(event.map(|event| (Topic::poll(event.poll_id()), event)))
    }

    fn poll_changed(
        &self,
        detail: ChangeDetail<PollImage>,
    ) -> Result<Option<FanoutEvent>, RouteError> {
        let new = detail.new_image.ok_or(RouteError::MissingImage)?;
        let poll_id: PollId = strip_prefix(&new.pk, POLL_PREFIX).into();
        let old = detail.old_image;

        let duration_changed = old.as_ref().map_or(true, |old| old.duration != new.duration);
        if duration_changed {
            return Ok(Some(FanoutEvent::PollModified {
                poll_id,
                user_id: strip_prefix(&new.owner_key, USER_PREFIX).into(),
                prompt: new.prompt,
                created_at: new.created_at,
                duration: new.duration,
                archived: new.archived,
            }));
        }

        let archive_changed = old.map_or(false, |old| old.archived != new.archived);
        if archive_changed && self.settings.notify_archive {
            return Ok(Some(FanoutEvent::PollArchived {
                poll_id,
                archived: new.archived,
            }));
        }
        debug!(poll_id = poll_id.as_str(), "Duration unchanged");
        Ok(None)
    }

    pub async fn handle(&self, record: &ChangeRecord) {
        match self.route(record) {
            Ok(Some((topic, event))) => {
                if let Err(err) = self
                    .publisher
                    .publish(topic.clone(), Notification::Fanout(event))
                    .await
                {
                    warn!(topic = topic.as_str(), "Failed to publish change: {}", err);
                }
            }
            Ok(None) => {}
            Err(err) => warn!(
                source = record.source.as_str(),
                detail_type = record.detail_type.as_str(),
                "Skipping change record: {}",
                err
            ),
        }
    }

    /// Consumes the change log until it ends.
    pub async fn run<S>(self, changes: S)
    where
        S: Stream<Item = ChangeRecord>,
    {
        info!("Change fanout router started");
        futures::pin_mut!(changes);
        while let Some(record) = changes.next().await {
            self.handle(&record).await;
        }
        info!("Change log closed, fanout router stopped");
    }
}

fn option_changed(detail: ChangeDetail<OptionImage>) -> Result<Option<FanoutEvent>, RouteError> {
    let new = detail.new_image.ok_or(RouteError::MissingImage)?;
    if let Some(old) = detail.old_image {
        if old.votes == new.votes {
            return Ok(None);
        }
    }
    Ok(Some(FanoutEvent::VoteCounted {
        option_id: strip_prefix(&new.pk, OPTION_PREFIX).into(),
        poll_id: strip_prefix(&new.poll_key, POLL_PREFIX).into(),
        updated_at: new.updated_at,
        votes: new.votes,
    }))
}
