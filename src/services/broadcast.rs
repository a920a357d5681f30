use crate::events::{Notification, Topic};
use crate::span::SpanMessage;
use crate::span_message_impl;
use actix::prelude::*;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

pub type SubscriberId = u64;

/// Pushed to every subscriber of `topic`.
#[derive(Message, Clone, Debug)]
#[rtype(result = "()")]
pub struct Deliver {
    pub topic: Topic,
    pub payload: Notification,
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct Subscribe {
    pub id: SubscriberId,
    pub topic: Topic,
    pub recipient: Recipient<Deliver>,
}

/// `topic: None` removes the subscriber from every topic.
#[derive(Message)]
#[rtype(result = "()")]
pub struct Unsubscribe {
    pub id: SubscriberId,
    pub topic: Option<Topic>,
}

/// Resolves to the number of subscribers reached.
#[derive(Message, Clone, Debug)]
#[rtype(result = "usize")]
pub struct Publish {
    pub topic: Topic,
    pub payload: Notification,
}

// Actor
#[derive(Default)]
pub struct BroadcastActor {
    topics: HashMap<Topic, HashMap<SubscriberId, Recipient<Deliver>>>,
}

impl BroadcastActor {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Actor for BroadcastActor {
    type Context = Context<Self>;

    fn started(&mut self, _ctx: &mut Self::Context) {
        info!("Broadcast actor started");
    }
}

impl Handler<Subscribe> for BroadcastActor {
    type Result = ();

    fn handle(&mut self, msg: Subscribe, _ctx: &mut Context<Self>) -> Self::Result {
        debug!(
            subscriber = msg.id,
            topic = msg.topic.as_str(),
            "Adding subscriber"
        );
        self.topics
            .entry(msg.topic)
            .or_default()
            .insert(msg.id, msg.recipient);
    }
}

impl Handler<Unsubscribe> for BroadcastActor {
    type Result = ();

    fn handle(&mut self, msg: Unsubscribe, _ctx: &mut Context<Self>) -> Self::Result {
        debug!(subscriber = msg.id, "Removing subscriber");
        match msg.topic {
            Some(topic) => {
                if let Some(subscribers) = self.topics.get_mut(&topic) {
                    subscribers.remove(&msg.id);
                }
            }
            None => {
                for subscribers in self.topics.values_mut() {
                    subscribers.remove(&msg.id);
                }
            }
        }
        self.topics.retain(|_, subscribers| !subscribers.is_empty());
    }
}

impl Handler<Publish> for BroadcastActor {
    type Result = usize;

    fn handle(&mut self, msg: Publish, _ctx: &mut Context<Self>) -> Self::Result {
        let Publish { topic, payload } = msg;
        let subscribers = match self.topics.get_mut(&topic) {
            Some(subscribers) => subscribers,
            None => {
                debug!(topic = topic.as_str(), "No subscribers for topic");
                return 0;
            }
        };
        subscribers.retain(|id, recipient| {
            let sent = recipient
                .do_send(Deliver {
                    topic: topic.clone(),
                    payload: payload.clone(),
                })
                .is_ok();
            if !sent {
                debug!(subscriber = *id, "Dropping disconnected subscriber");
            }
            sent
        });
        let reached = subscribers.len();
        debug!(
            "Broadcasting to {topic}. Number of clients: {clients}",
            topic = topic,
            clients = reached
        );
        if reached == 0 {
            self.topics.remove(&topic);
        }
        reached
    }
}

span_message_impl!(Publish, BroadcastActor);

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("publish to {0} timed out")]
    Timeout(Topic),
    #[error("broadcast mailbox closed")]
    Closed,
}

/// Outbound pub/sub fanout.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: Topic, payload: Notification) -> Result<(), PublishError>;
}

/// Publishes through a [`BroadcastActor`], waiting at most `timeout` for the
/// actor to take the message.
#[derive(Clone)]
pub struct BroadcastPublisher {
    addr: Addr<BroadcastActor>,
    timeout: Duration,
}

impl BroadcastPublisher {
    pub fn new(addr: Addr<BroadcastActor>, timeout: Duration) -> Self {
        Self { addr, timeout }
    }
}

#[async_trait]
impl Publisher for BroadcastPublisher {
    async fn publish(&self, topic: Topic, payload: Notification) -> Result<(), PublishError> {
        let reached = self
            .addr
            .send(SpanMessage::new(Publish {
                topic: topic.clone(),
                payload,
            }))
            .timeout(self.timeout)
            .await
            .map_err(|err| match err {
                MailboxError::Timeout => PublishError::Timeout(topic.clone()),
                MailboxError::Closed => PublishError::Closed,
            })?;
        debug!(topic = topic.as_str(), reached, "Published");
        Ok(())
    }
}

/// Keeps everything it is asked to publish.
#[derive(Default)]
pub struct MemoryPublisher {
    published: Mutex<Vec<(Topic, Notification)>>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<(Topic, Notification)> {
        self.published
            .lock()
            .map(|published| published.clone())
            .unwrap_or_default()
    }

    pub fn on(&self, topic: &Topic) -> Vec<Notification> {
        self.published()
            .into_iter()
            .filter(|(published_topic, _)| published_topic == topic)
            .map(|(_, payload)| payload)
            .collect()
    }
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn publish(&self, topic: Topic, payload: Notification) -> Result<(), PublishError> {
        if let Ok(mut published) = self.published.lock() {
            published.push((topic, payload));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{memory::MemoryPollStore, option::InternalOption, poll::InternalPoll, PollStore};
    use crate::events::{FanoutEvent, InboundVoteMessage};
    use crate::services::outcome::OutcomePublisher;
    use crate::services::queue::Delivery;
    use crate::services::vote::VoteWorker;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;
    use tokio::time::{delay_for, timeout};

    /// Keeps the actor from reading its mailbox for a while.
    #[derive(Message)]
    #[rtype(result = "()")]
    struct Stall(Duration);

    impl Handler<Stall> for BroadcastActor {
        type Result = ();

        fn handle(&mut self, msg: Stall, ctx: &mut Context<Self>) {
            ctx.wait(delay_for(msg.0).into_actor(self));
        }
    }

    struct Collector(Arc<Mutex<Vec<Deliver>>>);

    impl Actor for Collector {
        type Context = Context<Self>;
    }

    impl Handler<Deliver> for Collector {
        type Result = ();

        fn handle(&mut self, msg: Deliver, _ctx: &mut Context<Self>) {
            self.0.lock().unwrap().push(msg);
        }
    }

    #[derive(Message)]
    #[rtype(result = "usize")]
    struct Received;

    impl Handler<Received> for Collector {
        type Result = usize;

        fn handle(&mut self, _msg: Received, _ctx: &mut Context<Self>) -> usize {
            self.0.lock().unwrap().len()
        }
    }

    fn counted(poll: &str) -> Notification {
        Notification::Fanout(FanoutEvent::VoteCounted {
            option_id: "o1".into(),
            poll_id: poll.into(),
            updated_at: "2020-09-13T12:28:20.000Z".to_owned(),
            votes: 1,
        })
    }

    #[actix_rt::test]
    async fn publish_reaches_only_subscribers_of_the_topic() {
        let broadcast = BroadcastActor::new().start();
        let seen = Arc::new(Mutex::new(vec![]));
        let collector = Collector(seen.clone()).start();
        let p1 = Topic::poll(&"p1".into());
        let p2 = Topic::poll(&"p2".into());

        broadcast
            .send(Subscribe {
                id: 1,
                topic: p1.clone(),
                recipient: collector.clone().recipient(),
            })
            .await
            .unwrap();

        let reached = broadcast
            .send(Publish {
                topic: p1.clone(),
                payload: counted("p1"),
            })
            .await
            .unwrap();
        assert_eq!(reached, 1);
        let reached = broadcast
            .send(Publish {
                topic: p2,
                payload: counted("p2"),
            })
            .await
            .unwrap();
        assert_eq!(reached, 0);

        assert_eq!(collector.send(Received).await.unwrap(), 1);
        let delivered = seen.lock().unwrap()[0].clone();
        assert_eq!(delivered.topic, p1);
        assert_eq!(delivered.payload, counted("p1"));
    }

    #[actix_rt::test]
    async fn unsubscribed_clients_receive_nothing() {
        let broadcast = BroadcastActor::new().start();
        let seen = Arc::new(Mutex::new(vec![]));
        let collector = Collector(seen.clone()).start();
        let topic = Topic::poll(&"p1".into());
        broadcast
            .send(Subscribe {
                id: 7,
                topic: topic.clone(),
                recipient: collector.clone().recipient(),
            })
            .await
            .unwrap();
        broadcast
            .send(Unsubscribe { id: 7, topic: None })
            .await
            .unwrap();

        let publisher = BroadcastPublisher::new(broadcast, Duration::from_secs(1));
        publisher.publish(topic, counted("p1")).await.unwrap();
        assert_eq!(collector.send(Received).await.unwrap(), 0);
    }

    #[actix_rt::test]
    async fn stalled_broadcast_times_out_publish() {
        let broadcast = BroadcastActor::new().start();
        broadcast.do_send(Stall(Duration::from_millis(500)));
        let publisher = BroadcastPublisher::new(broadcast, Duration::from_millis(20));
        let topic = Topic::poll(&"p1".into());

        let result = publisher.publish(topic.clone(), counted("p1")).await;
        assert!(matches!(result, Err(PublishError::Timeout(timed_out)) if timed_out == topic));
    }

    #[actix_rt::test]
    async fn worker_acknowledges_vote_when_outcome_publish_times_out() {
        let created_at = Utc.timestamp_millis(1_600_000_000_000);
        let store = Arc::new(MemoryPollStore::new());
        store
            .create_poll(
                &InternalPoll {
                    id: "p1".into(),
                    owner_id: "owner".into(),
                    prompt: "?".to_owned(),
                    created_at,
                    duration: 300,
                    archived: false,
                },
                &[InternalOption {
                    id: "o1".into(),
                    poll_id: "p1".into(),
                    index: 0,
                    text: "Yes".to_owned(),
                    votes: 0,
                    updated_at: created_at,
                }],
            )
            .await
            .unwrap();
        let broadcast = BroadcastActor::new().start();
        broadcast.do_send(Stall(Duration::from_millis(500)));
        let publisher = Arc::new(BroadcastPublisher::new(broadcast, Duration::from_millis(20)));
        let worker = VoteWorker::new(store.clone(), OutcomePublisher::new(publisher)).start();

        let delivery = Delivery {
            message: InboundVoteMessage {
                option_id: "o1".into(),
                poll_id: "p1".into(),
                voter_id: Some("u1".to_owned()),
                anonymous_origin_id: None,
                observed_at_epoch_millis: 1_600_000_005_000,
                request_id: "r1".into(),
            },
            attempt: 1,
        };
        let acked = timeout(Duration::from_millis(300), worker.send(delivery))
            .await
            .expect("worker stalled with the broadcast actor")
            .unwrap();
        assert!(acked.is_ok());
        let stored = store
            .get_vote(&"u1".into(), &"p1".into())
            .await
            .unwrap()
            .unwrap();
        assert!(stored.settled);
    }
}
