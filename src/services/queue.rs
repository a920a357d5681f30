use crate::db::StoreError;
use crate::events::InboundVoteMessage;
use crate::span_message_impl;
use actix::prelude::*;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// One attempt at processing an inbound vote. `attempt` starts at 1.
#[derive(Message, Clone, Debug)]
#[rtype(result = "Result<(), StoreError>")]
pub struct Delivery {
    pub message: InboundVoteMessage,
    pub attempt: u32,
}

#[derive(Message, Debug)]
#[rtype(result = "()")]
pub struct Enqueue(pub InboundVoteMessage);

#[derive(Message)]
#[rtype(result = "Vec<DeadLetter>")]
pub struct DeadLetters;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeadLetter {
    pub message: InboundVoteMessage,
    pub attempts: u32,
    pub last_error: String,
}

#[derive(Clone, Debug)]
pub struct QueueSettings {
    pub max_redeliveries: u32,
    pub redelivery_delay: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_redeliveries: 5,
            redelivery_delay: Duration::from_millis(250),
        }
    }
}

/// At-least-once vote queue in front of a fixed pool of workers.
///
/// A worker only gets a new delivery once its previous one has settled.
/// Nacked deliveries come back after `redelivery_delay` until the budget is
/// spent, then they are kept as dead letters.
pub struct VoteQueue {
    settings: QueueSettings,
    workers: Vec<Recipient<Delivery>>,
    idle: VecDeque<usize>,
    pending: VecDeque<Delivery>,
    dead: Vec<DeadLetter>,
}

impl VoteQueue {
    pub fn new(settings: QueueSettings, workers: Vec<Recipient<Delivery>>) -> Self {
        Self {
            settings,
            idle: (0..workers.len()).collect(),
            workers,
            pending: VecDeque::new(),
            dead: vec![],
        }
    }

    fn pump(&mut self, ctx: &mut Context<Self>) {
        while !self.pending.is_empty() {
            let worker = match self.idle.pop_front() {
                Some(worker) => worker,
                None => break,
            };
            if let Some(delivery) = self.pending.pop_front() {
                self.dispatch(worker, delivery, ctx);
            }
        }
    }

    fn dispatch(&mut self, worker: usize, delivery: Delivery, ctx: &mut Context<Self>) {
        debug!(
            worker,
            request_id = delivery.message.request_id.as_str(),
            attempt = delivery.attempt,
            "Dispatching vote"
        );
        let message = delivery.message.clone();
        let attempt = delivery.attempt;
        let request = self.workers[worker].send(delivery);
        ctx.spawn(request.into_actor(self).map(move |result, queue, ctx| {
            queue.idle.push_back(worker);
            match result {
                Ok(Ok(())) => debug!(request_id = message.request_id.as_str(), "Vote acknowledged"),
                Ok(Err(err)) => queue.nack(message, attempt, err.to_string(), ctx),
                Err(err) => queue.nack(message, attempt, err.to_string(), ctx),
            }
            queue.pump(ctx);
        }));
    }

    fn nack(
        &mut self,
        message: InboundVoteMessage,
        attempt: u32,
        last_error: String,
        ctx: &mut Context<Self>,
    ) {
        if attempt > self.settings.max_redeliveries {
            error!(
                request_id = message.request_id.as_str(),
                attempts = attempt,
                "Redelivery budget spent, dead-lettering vote: {}",
                last_error
            );
            self.dead.push(DeadLetter {
                message,
                attempts: attempt,
                last_error,
            });
            return;
        }
        warn!(
            request_id = message.request_id.as_str(),
            attempt,
            "Vote not acknowledged, redelivering: {}",
            last_error
        );
        ctx.run_later(self.settings.redelivery_delay, move |queue, ctx| {
            queue.pending.push_back(Delivery {
                message,
                attempt: attempt + 1,
            });
            queue.pump(ctx);
        });
    }
}

impl Actor for VoteQueue {
    type Context = Context<Self>;

    fn started(&mut self, _ctx: &mut Self::Context) {
        info!(workers = self.workers.len(), "Vote queue started");
    }
}

impl Handler<Enqueue> for VoteQueue {
    type Result = ();

    fn handle(&mut self, msg: Enqueue, ctx: &mut Context<Self>) -> Self::Result {
        debug!(request_id = msg.0.request_id.as_str(), "Vote enqueued");
        self.pending.push_back(Delivery {
            message: msg.0,
            attempt: 1,
        });
        self.pump(ctx);
    }
}

span_message_impl!(Enqueue, VoteQueue);

impl Handler<DeadLetters> for VoteQueue {
    type Result = MessageResult<DeadLetters>;

    fn handle(&mut self, _msg: DeadLetters, _ctx: &mut Context<Self>) -> Self::Result {
        MessageResult(self.dead.clone())
    }
}
