//! Integration tests for subscriptions, transitions and reconnects.

mod common;

use common::{args, empty, init_tracing, MockTransport};
use futures::executor::block_on;
use serde_json::json;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;
use tokio::task::LocalSet;
use tidal_client::{Client, ClientConfig, ConnectionState, SubscribeOptions};
use tidal_core::{Cursor, Error, ExecutionError, Timestamp, TransportError, Value};
use tidal_reactive::{ChangeOrigin, ChangeSet, Transition};

fn client() -> (Client, MockTransport) {
    init_tracing();
    let transport = MockTransport::new();
    (Client::new(transport.clone()), transport)
}

fn recorder() -> (Rc<RefCell<Vec<ChangeSet>>>, impl Fn(&ChangeSet) + 'static) {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    (seen, move |changes: &ChangeSet| sink.borrow_mut().push(changes.clone()))
}

#[test]
fn test_equivalent_args_share_one_subscription() {
    let (client, transport) = client();
    let a = client
        .subscribe("messages:list", args(json!({"channel": "x", "limit": 10})))
        .unwrap();
    let b = client
        .subscribe("messages.js:list", args(json!({"limit": 10, "channel": "x"})))
        .unwrap();
    block_on(client.flush_exchanges());

    assert_eq!(a.token(), b.token());
    assert_eq!(transport.subscribe_count(a.token()), 1);

    let token = a.token().clone();
    drop(a);
    assert!(transport.unsubscribes().is_empty());
    drop(b);
    assert_eq!(transport.unsubscribes(), vec![token.clone()]);
    assert_eq!(client.subscriber_count(&token), 0);
}

#[test]
fn test_last_release_purges_cached_result() {
    let (client, _) = client();
    let handle = client.subscribe("counter:get", empty()).unwrap();
    let token = handle.token().clone();
    block_on(client.flush_exchanges());
    client.deliver(Transition::new(Timestamp(1)).updated(token.clone(), 5i64));
    assert_eq!(client.peek(&token), Ok(Some(Value::Int64(5))));

    drop(handle);
    assert_eq!(client.peek(&token), Ok(None));
}

#[test]
fn test_teardown_waits_for_acknowledgement() {
    init_tracing();
    let transport = MockTransport::manual_acks();
    let client = Client::new(transport.clone());

    let handle = client.subscribe("counter:get", empty()).unwrap();
    let token = handle.token().clone();
    drop(handle);
    // Still in flight: nothing to tear down yet.
    assert!(transport.unsubscribes().is_empty());
    assert_eq!(client.subscriber_count(&token), 0);

    transport.ack(&token, Ok(None));
    block_on(client.flush_exchanges());
    assert_eq!(transport.unsubscribes(), vec![token]);
}

#[test]
fn test_resubscribe_while_in_flight_reuses_exchange() {
    init_tracing();
    let transport = MockTransport::manual_acks();
    let client = Client::new(transport.clone());

    let first = client.subscribe("counter:get", empty()).unwrap();
    let token = first.token().clone();
    drop(first);
    let second = client.subscribe("counter:get", empty()).unwrap();

    transport.ack(&token, Ok(None));
    block_on(client.flush_exchanges());

    assert_eq!(transport.subscribe_count(&token), 1);
    assert!(transport.unsubscribes().is_empty());
    assert_eq!(client.subscriber_count(second.token()), 1);
}

#[test]
fn test_stale_acknowledgement_is_ignored() {
    init_tracing();
    let transport = MockTransport::manual_acks();
    let client = Client::new(transport.clone());
    client.set_connection_state(ConnectionState::Connected);

    let handle = client.subscribe("counter:get", empty()).unwrap();
    let token = handle.token().clone();
    client.set_connection_state(ConnectionState::Disconnected {
        reason: "socket closed".into(),
    });
    client.set_connection_state(ConnectionState::Connected);
    assert_eq!(transport.subscribe_count(&token), 2);

    // The first exchange fails late; only the second one counts.
    transport.ack(&token, Err(TransportError::new("reset")));
    transport.ack(&token, Ok(None));
    block_on(client.flush_exchanges());

    drop(handle);
    assert_eq!(transport.unsubscribes(), vec![token]);
}

#[test]
fn test_reconnect_resumes_from_stored_cursor() {
    let (client, transport) = client();
    client.set_connection_state(ConnectionState::Connected);
    let handle = client.subscribe("counter:get", empty()).unwrap();
    let token = handle.token().clone();
    block_on(client.flush_exchanges());

    client.deliver(Transition::new(Timestamp(4)).updated_at(token.clone(), 7i64, Cursor::new("c4")));
    client.set_connection_state(ConnectionState::Disconnected {
        reason: "socket closed".into(),
    });
    client.set_connection_state(ConnectionState::Connected);
    block_on(client.flush_exchanges());

    assert_eq!(
        transport.subscribes(),
        vec![(token.clone(), None), (token.clone(), Some(Cursor::new("c4")))]
    );
    // Cached data survives the reconnect.
    assert_eq!(handle.peek(), Ok(Some(Value::Int64(7))));
}

#[test]
fn test_subscribe_with_initial_cursor() {
    let (client, transport) = client();
    let handle = client
        .subscribe_with(
            "counter:get",
            empty(),
            SubscribeOptions {
                cursor: Some(Cursor::new("resume-here")),
            },
        )
        .unwrap();

    assert_eq!(
        transport.subscribes(),
        vec![(handle.token().clone(), Some(Cursor::new("resume-here")))]
    );
}

#[test]
fn test_transition_notifies_once_per_listener() {
    let (client, _) = client();
    let a = client.subscribe("counter:get", args(json!({"id": "a"}))).unwrap();
    let b = client.subscribe("counter:get", args(json!({"id": "b"}))).unwrap();
    let (seen, on_change) = recorder();
    let _watch = client.watch([a.token().clone(), b.token().clone()], on_change);

    client.deliver(
        Transition::new(Timestamp(1))
            .updated(a.token().clone(), 1i64)
            .updated(b.token().clone(), 2i64),
    );

    let seen = seen.borrow();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].len(), 2);
    assert!(seen[0].contains(a.token()) && seen[0].contains(b.token()));
    assert_eq!(seen[0].origin(), ChangeOrigin::Transition(Timestamp(1)));
}

#[test]
fn test_listener_sees_whole_transition() {
    let (client, _) = client();
    let a = client.subscribe("counter:get", args(json!({"id": "a"}))).unwrap();
    let b = client.subscribe("counter:get", args(json!({"id": "b"}))).unwrap();
    let observed = Rc::new(RefCell::new(Vec::new()));

    let reader = client.clone();
    let sink = observed.clone();
    let (ta, tb) = (a.token().clone(), b.token().clone());
    let _watch = client.watch([ta.clone()], move |_| {
        sink.borrow_mut()
            .push((reader.peek(&ta).unwrap(), reader.peek(&tb).unwrap()));
    });

    client.deliver(
        Transition::new(Timestamp(1))
            .updated(a.token().clone(), 1i64)
            .updated(b.token().clone(), 2i64),
    );

    assert_eq!(
        *observed.borrow(),
        vec![(Some(Value::Int64(1)), Some(Value::Int64(2)))]
    );
}

#[test]
fn test_unchanged_value_does_not_notify() {
    let (client, _) = client();
    let handle = client.subscribe("counter:get", empty()).unwrap();
    let (seen, on_change) = recorder();
    let _watch = client.watch([handle.token().clone()], on_change);

    client.deliver(Transition::new(Timestamp(1)).updated(handle.token().clone(), 3i64));
    client.deliver(Transition::new(Timestamp(2)).updated(handle.token().clone(), 3i64));

    assert_eq!(seen.borrow().len(), 1);
    assert_eq!(client.max_observed_timestamp(), Some(Timestamp(2)));
}

#[test]
fn test_listener_removed_mid_batch_is_skipped() {
    let (client, _) = client();
    let handle = client.subscribe("counter:get", empty()).unwrap();
    let token = handle.token().clone();

    let victim_calls = Rc::new(RefCell::new(0));
    let victim_slot = Rc::new(RefCell::new(None));

    let slot = victim_slot.clone();
    let _remover = client.watch([token.clone()], move |_| {
        slot.borrow_mut().take();
    });
    let calls = victim_calls.clone();
    let victim = client.watch([token.clone()], move |_| *calls.borrow_mut() += 1);
    *victim_slot.borrow_mut() = Some(victim);

    client.deliver(Transition::new(Timestamp(1)).updated(token, 1i64));

    assert_eq!(*victim_calls.borrow(), 0);
    assert!(victim_slot.borrow().is_none());
}

#[test]
fn test_execution_error_is_reraised_until_replaced() {
    let (client, _) = client();
    let handle = client.subscribe("counter:get", empty()).unwrap();
    let error = ExecutionError::with_data("counter missing", Value::from("counter-1"));

    client.deliver(Transition::new(Timestamp(1)).failed(handle.token().clone(), error.clone()));
    assert_eq!(handle.peek(), Err(Error::Execution(error.clone())));
    assert_eq!(handle.peek(), Err(Error::Execution(error)));

    client.deliver(Transition::new(Timestamp(2)).updated(handle.token().clone(), 0i64));
    assert_eq!(handle.peek(), Ok(Some(Value::Int64(0))));
}

#[test]
fn test_transition_for_unknown_token_is_skipped() {
    let (client, _) = client();
    let handle = client.subscribe("counter:get", empty()).unwrap();
    let stranger = tidal_core::QueryRequest::new("counter:get", args(json!({"id": 9})))
        .unwrap()
        .token();

    client.deliver(
        Transition::new(Timestamp(1))
            .updated(stranger.clone(), 1i64)
            .updated(handle.token().clone(), 2i64),
    );

    assert_eq!(client.peek(&stranger), Ok(None));
    assert_eq!(handle.peek(), Ok(Some(Value::Int64(2))));
}

#[test]
fn test_watch_query_unsubscribes_on_drop() {
    let (client, transport) = client();
    let (seen, on_change) = recorder();
    let watch = client.watch_query("counter:get", empty(), on_change).unwrap();
    let token = watch.token().clone();
    block_on(client.flush_exchanges());

    client.deliver(Transition::new(Timestamp(1)).updated(token.clone(), 1i64));
    assert_eq!(watch.peek(), Ok(Some(Value::Int64(1))));
    drop(watch);
    client.deliver(Transition::new(Timestamp(2)).updated(token.clone(), 2i64));

    assert_eq!(seen.borrow().len(), 1);
    assert_eq!(transport.unsubscribes(), vec![token]);
}

fn prewarm_client(ttl: Duration) -> (Client, MockTransport) {
    init_tracing();
    let transport = MockTransport::new();
    let config = ClientConfig {
        prewarm_ttl: ttl,
        ..Default::default()
    };
    (Client::with_config(transport.clone(), config).unwrap(), transport)
}

#[tokio::test(start_paused = true)]
async fn test_prewarm_releases_after_ttl() {
    let (client, transport) = prewarm_client(Duration::from_millis(200));
    let local = LocalSet::new();
    local
        .run_until(async {
            tokio::task::spawn_local(client.drive());

            let token = client.prewarm("counter:get", empty()).unwrap().token().clone();
            client.flush_exchanges().await;
            assert_eq!(client.subscriber_count(&token), 1);

            tokio::time::sleep(Duration::from_millis(199)).await;
            assert_eq!(client.subscriber_count(&token), 1);

            tokio::time::sleep(Duration::from_millis(2)).await;
            assert_eq!(client.subscriber_count(&token), 0);
            assert_eq!(transport.unsubscribes(), vec![token]);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_prewarm_held_by_client_not_caller() {
    let (client, transport) = prewarm_client(Duration::from_secs(5));
    let local = LocalSet::new();
    local
        .run_until(async {
            tokio::task::spawn_local(client.drive());

            // Only the token is kept.
            let prewarm = client.prewarm("counter:get", empty()).unwrap();
            let token = prewarm.token().clone();
            drop(prewarm);
            client.flush_exchanges().await;
            tokio::time::sleep(Duration::from_millis(10)).await;

            assert_eq!(client.subscriber_count(&token), 1);
            assert!(transport.unsubscribes().is_empty());

            tokio::time::sleep(Duration::from_secs(5)).await;
            assert_eq!(client.subscriber_count(&token), 0);
            assert_eq!(transport.unsubscribes(), vec![token]);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_prewarm_hands_over_to_real_subscription() {
    let (client, transport) = prewarm_client(Duration::from_millis(200));
    let local = LocalSet::new();
    local
        .run_until(async {
            tokio::task::spawn_local(client.drive());

            let prewarm = client.prewarm("counter:get", empty()).unwrap();
            client.flush_exchanges().await;
            client.deliver(Transition::new(Timestamp(1)).updated(prewarm.token().clone(), 5i64));

            let handle = client.subscribe("counter:get", empty()).unwrap();
            assert_eq!(handle.peek(), Ok(Some(Value::Int64(5))));

            tokio::time::sleep(Duration::from_millis(300)).await;
            assert!(!prewarm.is_active());
            assert_eq!(client.subscriber_count(handle.token()), 1);
            assert_eq!(transport.subscribe_count(handle.token()), 1);
            assert!(transport.unsubscribes().is_empty());
            assert_eq!(handle.peek(), Ok(Some(Value::Int64(5))));
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_prewarm_cancel_releases_at_once() {
    let (client, transport) = prewarm_client(Duration::from_secs(5));
    let prewarm = client.prewarm("counter:get", empty()).unwrap();
    let token = prewarm.token().clone();
    client.flush_exchanges().await;
    assert!(prewarm.is_active());

    prewarm.cancel();
    assert_eq!(client.subscriber_count(&token), 0);
    assert_eq!(transport.unsubscribes(), vec![token]);
}

#[test]
fn test_invalid_config_is_rejected() {
    let config = ClientConfig {
        default_page_size: 0,
        ..Default::default()
    };
    assert!(Client::with_config(MockTransport::new(), config).is_err());
}
