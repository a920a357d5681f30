use crate::config::Config;
use crate::db::{changes::ChangeRecord, PollStore, TimeoutStore};
use crate::services::{
    broadcast::{BroadcastActor, BroadcastPublisher, Publisher},
    fanout::FanoutRouter,
    identity::{self, IdentityProvider},
    outcome::OutcomePublisher,
    queue::VoteQueue,
    vote::VoteWorker,
};
use crate::websocket;
use actix::prelude::*;
use actix_web::{web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use futures::Stream;
use std::sync::Arc;
use tracing::{debug, info};

/// Running actors of the vote pipeline.
#[derive(Clone)]
pub struct Engine {
    pub broadcast: Addr<BroadcastActor>,
    pub queue: Addr<VoteQueue>,
}

/// Starts the topic registry, the worker pool behind the vote queue and the
/// change fanout router. Must be called from within a running actix system.
pub fn start_engine<S>(store: Arc<dyn PollStore>, changes: S, config: &Config) -> Engine
where
    S: Stream<Item = ChangeRecord> + 'static,
{
    let broadcast = BroadcastActor::new().start();
    let publisher: Arc<dyn Publisher> = Arc::new(BroadcastPublisher::new(
        broadcast.clone(),
        config.publish_timeout,
    ));
    let store: Arc<dyn PollStore> = Arc::new(TimeoutStore::new(store, config.store_timeout));

    let outcomes = OutcomePublisher::new(publisher.clone());
    let workers = (0..config.vote_workers)
        .map(|_| {
            VoteWorker::new(store.clone(), outcomes.clone())
                .start()
                .recipient()
        })
        .collect();
    let queue = VoteQueue::new(config.queue.clone(), workers).start();

    let router = FanoutRouter::new(config.fanout.clone(), publisher);
    actix_rt::spawn(router.run(changes));

    info!(workers = config.vote_workers, "Vote engine started");
    Engine { broadcast, queue }
}

#[derive(Clone)]
pub struct AppState {
    engine: Engine,
    identity: Arc<dyn IdentityProvider>,
}

impl AppState {
    pub fn new(engine: Engine, identity: Arc<dyn IdentityProvider>) -> Self {
        Self { engine, identity }
    }
}

async fn ws_route(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let user_id = state.identity.identify(&req);
    let origin = identity::origin(&req);
    debug!(
        authenticated = user_id.is_some(),
        "Upgrading websocket connection"
    );
    ws::start(
        websocket::WsClient::new(
            user_id,
            origin,
            state.engine.broadcast.clone(),
            state.engine.queue.clone(),
        ),
        &req,
        stream,
    )
}

pub fn configure(cfg: &mut web::ServiceConfig, state: AppState) {
    // websocket
    cfg.data(state)
        .service(web::resource("/ws/").to(ws_route));
}
