use super::admission::{admit, VoteError, VoteRequest};
use super::outcome::{self, OutcomePublisher};
use super::queue::Delivery;
use super::recorder::record;
use crate::db::{PollStore, StoreError};
use crate::events::{InboundVoteMessage, OutcomeEvent};
use actix::prelude::*;
use std::sync::Arc;
use tracing::{debug, info, info_span};
use tracing_futures::Instrument;

/// Runs one inbound vote through admission and recording.
///
/// Every rejection is turned into a `voteFailed` outcome. Only store errors
/// are returned, and those mean the message must be redelivered. A recorded
/// vote is settled before its `voteSucceeded` outcome is built, so later
/// redeliveries of the same request report `DuplicateVote`.
pub async fn process(
    store: &dyn PollStore,
    message: &InboundVoteMessage,
) -> Result<OutcomeEvent, StoreError> {
    let request = match VoteRequest::from_message(message) {
        Ok(request) => request,
        Err(rejection) => return Ok(outcome::failed(message, &rejection)),
    };

    let result = match admit(store, &request).await {
        Ok(_poll) => record(store, &request).await,
        Err(err) => Err(err),
    };
    match result {
        Ok(vote) => {
            store
                .settle_vote(&vote.voter_id, &vote.poll_id, &vote.vote_id)
                .await?;
            Ok(outcome::succeeded(&vote))
        }
        Err(VoteError::Rejected(rejection)) => {
            debug!(reason = ?rejection.reason, "Vote rejected: {}", rejection);
            Ok(outcome::failed(message, &rejection))
        }
        Err(VoteError::Transient(err)) => Err(err),
    }
}

/// Stateless vote worker. The queue hands it one delivery at a time.
pub struct VoteWorker {
    store: Arc<dyn PollStore>,
    outcomes: OutcomePublisher,
}

impl VoteWorker {
    pub fn new(store: Arc<dyn PollStore>, outcomes: OutcomePublisher) -> Self {
        Self { store, outcomes }
    }
}

impl Actor for VoteWorker {
    type Context = Context<Self>;

    fn started(&mut self, _ctx: &mut Self::Context) {
        info!("Vote worker started");
    }
}

impl Handler<Delivery> for VoteWorker {
    type Result = ResponseFuture<Result<(), StoreError>>;

    fn handle(&mut self, msg: Delivery, _ctx: &mut Context<Self>) -> Self::Result {
        let span = info_span!(
            "vote",
            request_id = msg.message.request_id.as_str(),
            poll_id = msg.message.poll_id.as_str(),
            attempt = msg.attempt
        );
        let store = self.store.clone();
        let outcomes = self.outcomes.clone();
        Box::pin(
            async move {
                debug!("Processing vote");
                let event = process(store.as_ref(), &msg.message).await?;
                outcomes.publish(event).await;
                Ok(())
            }
            .instrument(span),
        )
    }
}
