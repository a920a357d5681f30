use crate::db::{option::OptionId, poll::PollId, poll::UserId, vote::RequestId};
use crate::events::{InboundVoteMessage, Notification, Topic};
use crate::services::broadcast::{BroadcastActor, Deliver, Subscribe, SubscriberId, Unsubscribe};
use crate::services::queue::{Enqueue, VoteQueue};
use crate::span::SpanMessage;
use actix::prelude::*;
use actix_web_actors::ws;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, debug_span, error, info, warn};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct IncomingSubscribe {
    pub topic: Topic,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct IncomingUnsubscribe {
    pub topic: Topic,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IncomingVote {
    pub poll_id: PollId,
    pub option_id: OptionId,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum IncomingMessage {
    Subscribe(IncomingSubscribe),
    Unsubscribe(IncomingUnsubscribe),
    Vote(IncomingVote),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OutgoingSubscribed {
    pub topic: Topic,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingVoteAccepted {
    pub request_id: RequestId,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OutgoingNotification {
    pub topic: Topic,
    pub payload: Notification,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OutgoingError {
    pub message: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OutgoingMessage {
    Subscribed(OutgoingSubscribed),
    VoteAccepted(OutgoingVoteAccepted),
    Notification(OutgoingNotification),
    Error(OutgoingError),
}

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

pub struct WsClient {
    id: SubscriberId,
    user_id: Option<UserId>,
    origin: Option<String>,
    broadcast: Addr<BroadcastActor>,
    queue: Addr<VoteQueue>,
}

impl WsClient {
    pub fn new(
        user_id: Option<UserId>,
        origin: Option<String>,
        broadcast: Addr<BroadcastActor>,
        queue: Addr<VoteQueue>,
    ) -> WsClient {
        WsClient {
            id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
            user_id,
            origin,
            broadcast,
            queue,
        }
    }

    fn send_json<T: Serialize>(&self, ctx: &mut ws::WebsocketContext<Self>, value: &T) {
        match serde_json::to_string(value) {
            Ok(json) => ctx.text(json),
            Err(err) => error!("Failed to convert to JSON {error}", error = err.to_string()),
        }
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, message: impl Into<String>) {
        self.send_json(
            ctx,
            &OutgoingMessage::Error(OutgoingError {
                message: message.into(),
            }),
        )
    }

    fn subscribe(&self, ctx: &mut ws::WebsocketContext<Self>, topic: Topic) {
        let request = self.broadcast.send(Subscribe {
            id: self.id,
            topic: topic.clone(),
            recipient: ctx.address().recipient(),
        });
        ctx.spawn(
            request
                .into_actor(self)
                .map(move |result, client, ctx| match result {
                    Ok(()) => client
                        .send_json(ctx, &OutgoingMessage::Subscribed(OutgoingSubscribed { topic })),
                    Err(err) => {
                        error!("Subscribing to {} failed: {}", topic, err);
                        client.send_error(ctx, "subscription failed");
                    }
                }),
        );
    }

    /// The client listens on the outcome topic before the vote is queued,
    /// so the outcome cannot be published ahead of the subscription.
    fn vote(&self, ctx: &mut ws::WebsocketContext<Self>, vote: IncomingVote) {
        let request_id = RequestId::new();
        let message = InboundVoteMessage {
            option_id: vote.option_id,
            poll_id: vote.poll_id,
            voter_id: self.user_id.as_ref().map(|user_id| user_id.0.clone()),
            anonymous_origin_id: self.origin.clone(),
            observed_at_epoch_millis: Utc::now().timestamp_millis(),
            request_id: request_id.clone(),
        };
        debug!(request_id = request_id.as_str(), "Incoming vote");

        let request = self.broadcast.send(Subscribe {
            id: self.id,
            topic: Topic::vote(&request_id),
            recipient: ctx.address().recipient(),
        });
        let queue = self.queue.clone();
        ctx.spawn(
            request
                .into_actor(self)
                .map(move |result, client, ctx| match result {
                    Ok(()) => {
                        client.send_json(
                            ctx,
                            &OutgoingMessage::VoteAccepted(OutgoingVoteAccepted { request_id }),
                        );
                        queue.do_send(SpanMessage::new(Enqueue(message)));
                    }
                    Err(err) => {
                        error!("Unable to subscribe to vote outcome: {}", err);
                        client.send_error(ctx, "vote could not be submitted");
                    }
                }),
        );
    }
}

impl Actor for WsClient {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, _ctx: &mut Self::Context) {
        info!(client_id = self.id, "New ws client");
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(client_id = self.id, "Ws client left");
        self.broadcast.do_send(Unsubscribe {
            id: self.id,
            topic: None,
        });
    }
}

// Incoming messages from ws
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsClient {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        let span = debug_span!("ws_client", client_id = self.id);
        let _enter = span.enter();
        match msg {
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<IncomingMessage>(&text) {
                Ok(IncomingMessage::Subscribe(subscribe)) => {
                    debug!(topic = subscribe.topic.as_str(), "Incoming subscribe");
                    self.subscribe(ctx, subscribe.topic);
                }
                Ok(IncomingMessage::Unsubscribe(unsubscribe)) => {
                    debug!(topic = unsubscribe.topic.as_str(), "Incoming unsubscribe");
                    self.broadcast.do_send(Unsubscribe {
                        id: self.id,
                        topic: Some(unsubscribe.topic),
                    });
                }
                Ok(IncomingMessage::Vote(vote)) => self.vote(ctx, vote),
                Err(err) => {
                    warn!("JSON error {}", err);
                    self.send_error(ctx, format!("invalid message: {}", err));
                }
            },
            Ok(ws::Message::Ping(bytes)) => ctx.pong(&bytes),
            Ok(ws::Message::Close(reason)) => {
                debug!("Got close message from WS. Reason: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(message) => {
                warn!("Client sent something else than text: {:?}", message);
            }
            Err(err) => {
                error!("ProtocolError in StreamHandler {:?}", err);
                ctx.stop();
            }
        }
    }
}

impl Handler<Deliver> for WsClient {
    type Result = ();

    fn handle(&mut self, msg: Deliver, ctx: &mut Self::Context) {
        let Deliver { topic, payload } = msg;
        debug!(client_id = self.id, topic = topic.as_str(), "Delivering notification");
        self.send_json(
            ctx,
            &OutgoingMessage::Notification(OutgoingNotification { topic, payload }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use insta::assert_json_snapshot;

    #[test]
    fn incoming_messages_are_tagged() {
        let vote: IncomingMessage =
            serde_json::from_str(r#"{"type":"vote","pollId":"p1","optionId":"o1"}"#).unwrap();
        assert_eq!(
            vote,
            IncomingMessage::Vote(IncomingVote {
                poll_id: "p1".into(),
                option_id: "o1".into(),
            })
        );
        let subscribe: IncomingMessage =
            serde_json::from_str(r#"{"type":"subscribe","topic":"poll/p1"}"#).unwrap();
        assert_eq!(
            subscribe,
            IncomingMessage::Subscribe(IncomingSubscribe {
                topic: Topic::poll(&"p1".into()),
            })
        );
    }

    #[test]
    fn outgoing_wire_format() {
        assert_json_snapshot!(OutgoingMessage::VoteAccepted(OutgoingVoteAccepted {
            request_id: "r1".into(),
        }), @r###"
        {
          "type": "voteAccepted",
          "requestId": "r1"
        }
        "###);
        assert_json_snapshot!(OutgoingMessage::Subscribed(OutgoingSubscribed {
            topic: Topic::vote(&"r1".into()),
        }), @r###"
        {
          "type": "subscribed",
          "topic": "vote/r1"
        }
        "###);
    }
}
