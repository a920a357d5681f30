extern crate pollcast;
use actix_codec::Framed;
use actix_http::ws::Codec;
use actix_web::{test, App};
use actix_web_actors::ws;
use chrono::{Duration as ChronoDuration, Utc};
use futures::{SinkExt, StreamExt};
use pollcast::{
    config::Config,
    db::{memory::MemoryPollStore, option::InternalOption, poll::InternalPoll, PollStore},
    events::{FanoutEvent, Notification, OutcomeEvent, RejectReason, Topic},
    server::{self, AppState},
    services::identity::TrustedHeader,
    websocket,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use websocket::{IncomingMessage, IncomingSubscribe, IncomingVote, OutgoingMessage};

const READ_TIMEOUT_MS: u64 = 200;

macro_rules! frame_message_type {
    ($framed:expr, $message_type:path) => {
        match read_message(&mut $framed)
            .await
            .expect("Unable to read ws frame")
        {
            $message_type(message_type) => message_type,
            other => panic!("Wrong outgoing message type {:?}", other),
        }
    };
}

async fn read_message(
    framed: &mut Framed<impl AsyncRead + AsyncWrite, Codec>,
) -> Option<OutgoingMessage> {
    let frame = timeout(Duration::from_millis(READ_TIMEOUT_MS), framed.next()).await;
    match frame.ok()??.unwrap() {
        ws::Frame::Text(item) => Some(serde_json::from_slice(&item[..]).unwrap()),
        _ => None,
    }
}

async fn read_messages(
    mut framed: &mut Framed<impl AsyncRead + AsyncWrite, Codec>,
) -> Vec<OutgoingMessage> {
    let mut messages = vec![];
    while let Some(message) = read_message(&mut framed).await {
        messages.push(message);
    }
    messages
}

async fn send(framed: &mut Framed<impl AsyncRead + AsyncWrite, Codec>, message: &IncomingMessage) {
    let message = serde_json::to_string(message).unwrap();
    framed.send(ws::Message::Text(message)).await.unwrap();
}

/// Poll `p1` opened a minute ago for five minutes, with options `o1` and `o2`.
async fn seeded_store() -> Arc<MemoryPollStore> {
    let created_at = Utc::now() - ChronoDuration::seconds(60);
    let store = Arc::new(MemoryPollStore::new());
    let options: Vec<InternalOption> = vec!["o1", "o2"]
        .into_iter()
        .enumerate()
        .map(|(index, id)| InternalOption {
            id: id.into(),
            poll_id: "p1".into(),
            index: index as i32,
            text: id.to_uppercase(),
            votes: 0,
            updated_at: created_at,
        })
        .collect();
    store
        .create_poll(
            &InternalPoll {
                id: "p1".into(),
                owner_id: "owner".into(),
                prompt: "Tabs or spaces?".to_owned(),
                created_at,
                duration: 300,
                archived: false,
            },
            &options,
        )
        .await
        .unwrap();
    store
}

fn start_server(store: Arc<MemoryPollStore>) -> test::TestServer {
    let changes = store.changes();
    let engine = server::start_engine(store, changes, &Config::default());
    let state = AppState::new(engine, Arc::new(TrustedHeader::default()));
    test::start(move || {
        let state = state.clone();
        App::new().configure(move |app| server::configure(app, state))
    })
}

fn vote(poll: &str, option: &str) -> IncomingMessage {
    IncomingMessage::Vote(IncomingVote {
        poll_id: poll.into(),
        option_id: option.into(),
    })
}

fn outcomes(messages: &[OutgoingMessage]) -> Vec<OutcomeEvent> {
    messages
        .iter()
        .filter_map(|message| match message {
            OutgoingMessage::Notification(notification) => match &notification.payload {
                Notification::Outcome(outcome) => Some(outcome.clone()),
                _ => None,
            },
            _ => None,
        })
        .collect()
}

#[actix_rt::test]
async fn test_subscribe() {
    let mut srv = start_server(seeded_store().await);
    let mut framed = srv.ws_at("/ws/").await.unwrap();

    send(
        &mut framed,
        &IncomingMessage::Subscribe(IncomingSubscribe {
            topic: Topic::poll(&"p1".into()),
        }),
    )
    .await;
    let subscribed = frame_message_type!(framed, OutgoingMessage::Subscribed);
    assert_eq!(subscribed.topic.as_str(), "poll/p1");
}

#[actix_rt::test]
async fn test_vote() {
    let store = seeded_store().await;
    let mut srv = start_server(store.clone());
    let mut framed = srv.ws_at("/ws/").await.unwrap();

    send(
        &mut framed,
        &IncomingMessage::Subscribe(IncomingSubscribe {
            topic: Topic::poll(&"p1".into()),
        }),
    )
    .await;
    frame_message_type!(framed, OutgoingMessage::Subscribed);

    send(&mut framed, &vote("p1", "o1")).await;
    let accepted = frame_message_type!(framed, OutgoingMessage::VoteAccepted);

    let messages = read_messages(&mut framed).await;
    let outcomes = outcomes(&messages);
    assert_eq!(outcomes.len(), 1);
    match &outcomes[0] {
        OutcomeEvent::VoteSucceeded {
            poll_id,
            option_id,
            vote_id,
            ..
        } => {
            assert_eq!(poll_id.as_str(), "p1");
            assert_eq!(option_id.as_str(), "o1");
            assert_eq!(vote_id.as_str(), accepted.request_id.as_str());
        }
        other => panic!("unexpected outcome {:?}", other),
    }

    let counted: Vec<&FanoutEvent> = messages
        .iter()
        .filter_map(|message| match message {
            OutgoingMessage::Notification(notification) => match &notification.payload {
                Notification::Fanout(event) => Some(event),
                _ => None,
            },
            _ => None,
        })
        .collect();
    assert_eq!(counted.len(), 1);
    match counted[0] {
        FanoutEvent::VoteCounted { option_id, votes, .. } => {
            assert_eq!(option_id.as_str(), "o1");
            assert_eq!(*votes, 1);
        }
        other => panic!("unexpected fanout {:?}", other),
    }

    // Close connection
    framed
        .send(ws::Message::Close(Some(ws::CloseCode::Normal.into())))
        .await
        .unwrap();

    let item = timeout(Duration::from_millis(READ_TIMEOUT_MS), framed.next())
        .await
        .expect("timeout")
        .unwrap()
        .unwrap();
    assert_eq!(item, ws::Frame::Close(Some(ws::CloseCode::Normal.into())));
}

#[actix_rt::test]
async fn test_second_vote_from_same_origin_is_duplicate() {
    let store = seeded_store().await;
    let mut srv = start_server(store.clone());

    let mut first = srv.ws_at("/ws/").await.unwrap();
    send(&mut first, &vote("p1", "o1")).await;
    frame_message_type!(first, OutgoingMessage::VoteAccepted);
    assert!(matches!(
        outcomes(&read_messages(&mut first).await).as_slice(),
        [OutcomeEvent::VoteSucceeded { .. }]
    ));

    // Both connections come from the same anonymous origin.
    let mut second = srv.ws_at("/ws/").await.unwrap();
    send(&mut second, &vote("p1", "o2")).await;
    frame_message_type!(second, OutgoingMessage::VoteAccepted);
    match outcomes(&read_messages(&mut second).await).as_slice() {
        [OutcomeEvent::VoteFailed { reason, .. }] => {
            assert_eq!(*reason, RejectReason::DuplicateVote)
        }
        other => panic!("unexpected outcomes {:?}", other),
    }

    let o1 = store.get_option(&"o1".into()).await.unwrap().unwrap();
    let o2 = store.get_option(&"o2".into()).await.unwrap().unwrap();
    assert_eq!(o1.votes + o2.votes, 1);
}

#[actix_rt::test]
async fn test_vote_on_missing_poll() {
    let mut srv = start_server(seeded_store().await);
    let mut framed = srv.ws_at("/ws/").await.unwrap();

    send(&mut framed, &vote("nope", "o1")).await;
    frame_message_type!(framed, OutgoingMessage::VoteAccepted);
    match outcomes(&read_messages(&mut framed).await).as_slice() {
        [OutcomeEvent::VoteFailed { reason, error, .. }] => {
            assert_eq!(*reason, RejectReason::PollNotFound);
            assert_eq!(error, "poll nope not found");
        }
        other => panic!("unexpected outcomes {:?}", other),
    }
}

#[actix_rt::test]
async fn test_invalid_message() {
    let mut srv = start_server(seeded_store().await);
    let mut framed = srv.ws_at("/ws/").await.unwrap();

    framed
        .send(ws::Message::Text(r#"{"type":"shout"}"#.to_owned()))
        .await
        .unwrap();
    let error = frame_message_type!(framed, OutgoingMessage::Error);
    assert!(error.message.starts_with("invalid message"));
}
