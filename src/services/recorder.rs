use super::admission::{Rejection, VoteError, VoteRequest};
use crate::db::{vote::InternalVote, PollStore, Precondition, RecordVoteError};
use crate::events::RejectReason;
use tracing::{debug, warn};

/// Writes an admitted vote with exactly-once effect.
///
/// The vote id comes from the request id, so a redelivered message produces
/// the same vote. When the duplicate guard trips on a vote with the same id
/// that was never settled, an earlier attempt committed but its outcome was
/// lost, and the stored vote is returned as a success. Any other tripped
/// guard is reported as `DuplicateVote`. Store errors are left to the caller:
/// the write may have committed, and the retry must come back through here.
pub async fn record(store: &dyn PollStore, request: &VoteRequest) -> Result<InternalVote, VoteError> {
    let vote = InternalVote {
        voter_id: request.voter_id.clone(),
        poll_id: request.poll_id.clone(),
        option_id: request.option_id.clone(),
        vote_id: request.vote_id.clone(),
    };

    match store.record_vote(&vote, request.observed_at).await {
        Ok(()) => {
            debug!(vote_id = vote.vote_id.as_str(), "Vote recorded");
            Ok(vote)
        }
        Err(RecordVoteError::Store(err)) => Err(VoteError::Transient(err)),
        Err(RecordVoteError::Conflict)
        | Err(RecordVoteError::PreconditionFailed(Precondition::VoteExists)) => {
            match store.get_vote(&vote.voter_id, &vote.poll_id).await? {
                Some(stored) if stored.vote.vote_id == vote.vote_id && !stored.settled => {
                    debug!(
                        vote_id = vote.vote_id.as_str(),
                        "Vote was committed by an earlier attempt"
                    );
                    Ok(stored.vote)
                }
                _ => {
                    debug!("Voter already has a vote on this poll");
                    Err(already_voted(request))
                }
            }
        }
        Err(RecordVoteError::PreconditionFailed(Precondition::OptionNotInPoll)) => {
            warn!(
                option_id = request.option_id.as_str(),
                poll_id = request.poll_id.as_str(),
                "Vote names an option outside its poll"
            );
            Err(Rejection::new(
                RejectReason::DuplicateVote,
                format!(
                    "option {} is not part of poll {}",
                    request.option_id, request.poll_id
                ),
            )
            .into())
        }
    }
}

fn already_voted(request: &VoteRequest) -> VoteError {
    Rejection::new(
        RejectReason::DuplicateVote,
        format!("voter has already voted on poll {}", request.poll_id),
    )
    .into()
}
