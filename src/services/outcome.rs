use super::admission::Rejection;
use super::broadcast::Publisher;
use crate::db::vote::InternalVote;
use crate::events::{InboundVoteMessage, Notification, OutcomeEvent};
use std::sync::Arc;
use tracing::{debug, warn};

pub fn succeeded(vote: &InternalVote) -> OutcomeEvent {
    OutcomeEvent::VoteSucceeded {
        voter_id: vote.voter_id.clone(),
        poll_id: vote.poll_id.clone(),
        option_id: vote.option_id.clone(),
        vote_id: vote.vote_id.clone(),
    }
}

pub fn failed(message: &InboundVoteMessage, rejection: &Rejection) -> OutcomeEvent {
    OutcomeEvent::VoteFailed {
        request_id: message.request_id.clone(),
        poll_id: message.poll_id.clone(),
        option_id: message.option_id.clone(),
        reason: rejection.reason,
        error: rejection.message.clone(),
    }
}

/// Sends outcome events to the requester's `vote/{requestId}` topic.
#[derive(Clone)]
pub struct OutcomePublisher {
    publisher: Arc<dyn Publisher>,
}

impl OutcomePublisher {
    pub fn new(publisher: Arc<dyn Publisher>) -> Self {
        Self { publisher }
    }

    /// Best effort. The vote is already settled, so a failed publish is
    /// only logged.
    pub async fn publish(&self, event: OutcomeEvent) {
        let topic = event.topic();
        match self
            .publisher
            .publish(topic.clone(), Notification::Outcome(event))
            .await
        {
            Ok(()) => debug!(topic = topic.as_str(), "Outcome published"),
            Err(err) => warn!(topic = topic.as_str(), "Failed to publish outcome: {}", err),
        }
    }
}
