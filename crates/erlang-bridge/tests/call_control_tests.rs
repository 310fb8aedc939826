//! Integration tests for call attachment and lookups

mod common;

use std::time::{Duration, Instant};

use common::*;
use pretty_assertions::assert_eq;
use rvoip_erlang_bridge::prelude::*;
use rvoip_erlang_bridge::SpawnTarget;

fn call_event(event_type: EventType, uuid: &str) -> Event {
    Event::new(event_type).with_header("Unique-ID", uuid)
}

#[tokio::test]
async fn test_handlecall_streams_call_until_hangup() {
    let engine = MockEngine::new();
    engine.add_call("call-1");
    let bridge = new_bridge(&engine);
    let (listener, peer) = bridge.add_memory_peer("peer@box");

    assert_eq!(
        call(&peer, Term::tuple(vec![Term::atom("handlecall"), text("call-1")])).await,
        Term::ok()
    );
    assert!(bridge.is_attached("call-1"));
    assert!(engine.is_controlled("call-1"));

    let first = peer.recv_term(WAIT).await.expect("call notice");
    assert_eq!(tag(&first), Some("call"));

    bridge.publish(&call_event(EventType::ChannelAnswer, "call-1"));
    bridge.publish(&call_event(EventType::ChannelAnswer, "call-2"));
    let answered = peer.recv_term(WAIT).await.expect("call event");
    assert_eq!(tag(&answered), Some("call_event"));

    bridge.publish(&call_event(EventType::ChannelDestroy, "call-1"));
    let destroyed = peer.recv_term(WAIT).await.expect("destroy event");
    assert_eq!(tag(&destroyed), Some("call_event"));
    assert_eq!(peer.recv_term(WAIT).await, Some(Term::atom("call_hangup")));

    assert!(wait_until(|| !bridge.is_attached("call-1")).await);
    assert!(!engine.is_controlled("call-1"));
    assert_eq!(listener.session_count(), 0);
}

#[tokio::test]
async fn test_handlecall_refusals() {
    let engine = MockEngine::new();
    engine.add_call("call-1");
    let bridge = new_bridge(&engine);
    let (_first, peer) = bridge.add_memory_peer("peer@box");
    let (_second, other) = bridge.add_memory_peer("other@box");

    let handlecall = |uuid: &str| Term::tuple(vec![Term::atom("handlecall"), text(uuid)]);
    assert_eq!(call(&peer, handlecall("")).await, Term::error("baduuid"));
    assert_eq!(call(&peer, handlecall("call-9")).await, Term::error("badsession"));
    assert_eq!(call(&peer, handlecall("call-1")).await, Term::ok());
    assert_eq!(call(&other, handlecall("call-1")).await, Term::error("session_attach_failed"));
    assert_eq!(call(&peer, Term::tuple(vec![Term::atom("handlecall")])).await, Term::error("badarg"));
}

#[tokio::test]
async fn test_handlecall_to_registered_name() {
    let engine = MockEngine::new();
    engine.add_call("call-1");
    let bridge = new_bridge(&engine);
    let (_listener, peer) = bridge.add_memory_peer("peer@box");

    // Name first or uuid first are both accepted
    let reply = call(
        &peer,
        Term::tuple(vec![Term::atom("handlecall"), Term::atom("call_handler"), text("call-1")]),
    )
    .await;
    assert_eq!(reply, Term::ok());

    let (to, notice) = peer.recv_message(WAIT).await.expect("call notice");
    assert_eq!(to, ProcessAddress::Name("call_handler".to_string()));
    assert_eq!(tag(&notice), Some("call"));
}

#[tokio::test]
async fn test_controller_exit_detaches_call() {
    let engine = MockEngine::new();
    engine.add_call("call-1");
    let bridge = new_bridge(&engine);
    let (_listener, peer) = bridge.add_memory_peer("peer@box");

    let controller = peer.new_pid();
    peer.send_from(&controller, Term::tuple(vec![Term::atom("handlecall"), text("call-1")]))
        .expect("send");
    assert_eq!(peer.recv_term(WAIT).await, Some(Term::ok()));
    assert!(bridge.is_attached("call-1"));

    peer.exit(&controller).expect("exit");
    assert!(wait_until(|| !bridge.is_attached("call-1")).await);
    assert!(!engine.is_controlled("call-1"));
}

#[tokio::test]
async fn test_session_filter_changes() {
    let engine = MockEngine::new();
    engine.add_call("call-1");
    let bridge = new_bridge(&engine);
    let (_listener, peer) = bridge.add_memory_peer("peer@box");

    assert_eq!(
        call(&peer, Term::tuple(vec![Term::atom("session_event"), Term::atom("DTMF")])).await,
        Term::error("nosession")
    );
    assert_eq!(
        call(&peer, Term::tuple(vec![Term::atom("handlecall"), text("call-1")])).await,
        Term::ok()
    );
    let _notice = peer.recv_term(WAIT).await.expect("call notice");

    assert_eq!(
        call(&peer, Term::tuple(vec![Term::atom("session_setevent"), Term::atom("DTMF")])).await,
        Term::ok()
    );
    bridge.publish(&call_event(EventType::ChannelAnswer, "call-1"));
    bridge.publish(&call_event(EventType::Dtmf, "call-1"));
    let delivered = peer.recv_term(WAIT).await.expect("dtmf");
    let items = delivered.as_tuple().and_then(|t| t[1].as_list()).expect("event list");
    assert!(items.contains(&Term::tuple(vec![text("Event-Name"), text("DTMF")])));
    assert!(peer.recv_term(QUIET).await.is_none());

    assert_eq!(call(&peer, Term::atom("session_noevents")).await, Term::ok());
}

#[tokio::test]
async fn test_spawned_controller_attach() {
    let engine = MockEngine::new();
    engine.add_call("call-1");
    let bridge = new_bridge(&engine);
    let (_listener, peer) = bridge.add_memory_peer("peer@box");

    let target = AttachTarget::Spawn(SpawnTarget::GetPid {
        module: "call_handler".to_string(),
    });
    let attaching = {
        let bridge = bridge.clone();
        tokio::spawn(async move { bridge.attach_outbound("call-1", &target, "peer@box").await })
    };

    let (to, request) = peer.recv_message(WAIT).await.expect("get_pid request");
    assert_eq!(to, ProcessAddress::Name("call_handler".to_string()));
    let reference = match request.as_tuple() {
        Some([get_pid, uuid, reference, _self_pid]) if get_pid.is_atom("get_pid") => {
            assert_eq!(uuid, &text("call-1"));
            reference.clone()
        }
        other => panic!("unexpected request {:?}", other),
    };

    let controller = peer.new_pid();
    peer.send(Term::tuple(vec![reference.clone(), Term::Pid(controller.clone())]))
        .expect("send");

    let handle = attaching.await.expect("join").expect("attached");
    assert_eq!(handle.uuid(), "call-1");
    assert!(!handle.is_detached());

    let (to, notice) = peer.recv_message(WAIT).await.expect("call notice");
    assert_eq!(to, ProcessAddress::Pid(controller));
    assert_eq!(tag(&notice), Some("call"));

    // A second answer for the same reference is refused
    assert_eq!(
        call(&peer, Term::tuple(vec![reference, Term::Pid(peer.new_pid())])).await,
        Term::error("invalid_ref")
    );
    assert_eq!(bridge.console("sessions peer@box"), "Outbound session for call-1 in state CS_NEW\n");
}

#[tokio::test]
async fn test_spawn_without_answer_times_out() {
    let engine = MockEngine::new();
    engine.add_call("call-1");
    let bridge = new_bridge(&engine);
    let (listener, peer) = bridge.add_memory_peer("peer@box");

    let target: AttachTarget = "call_handler:start".parse().expect("target");
    let attaching = {
        let bridge = bridge.clone();
        tokio::spawn(async move { bridge.attach_outbound("call-1", &target, "peer@box").await })
    };

    let (to, request) = peer.recv_message(WAIT).await.expect("rpc request");
    assert_eq!(to, ProcessAddress::Name("rex".to_string()));

    let result = attaching.await.expect("join");
    assert!(matches!(result, Err(BridgeError::Timeout(_))));
    assert!(!bridge.is_attached("call-1"));
    assert!(!engine.is_controlled("call-1"));
    assert_eq!(listener.session_count(), 0);

    // The late answer finds the timed-out slot
    let reference = request
        .as_tuple()
        .and_then(|t| t[1].as_tuple())
        .and_then(|call| call[3].as_list())
        .map(|args| args[0].clone())
        .expect("reference");
    let late = Term::tuple(vec![Term::atom("rex"), Term::tuple(vec![reference, Term::Pid(peer.new_pid())])]);
    assert_eq!(call(&peer, late).await, Term::error("timeout"));
}

#[tokio::test]
async fn test_send_message_reuses_listener() {
    let engine = MockEngine::new();
    let bridge = new_bridge(&engine);
    let (_listener, peer) = bridge.add_memory_peer("peer@box");

    bridge
        .send_message("mailbox", "peer@box", "hello")
        .await
        .expect("sent");
    let (to, message) = peer.recv_message(WAIT).await.expect("message");
    assert_eq!(to, ProcessAddress::Name("mailbox".to_string()));
    assert_eq!(message, Term::tuple(vec![Term::atom("freeswitch_sendmsg"), text("hello")]));
    assert_eq!(bridge.registry().len(), 1);
}

#[tokio::test]
async fn test_fetch_round_trip() {
    let engine = MockEngine::new();
    let bridge = new_bridge(&engine);
    let (_listener, peer) = bridge.add_memory_peer("peer@box");

    assert_eq!(
        call(&peer, Term::tuple(vec![Term::atom("bind"), Term::atom("directory")])).await,
        Term::ok()
    );
    assert_eq!(bridge.binding_count(), 1);

    let fetching = {
        let bridge = bridge.clone();
        tokio::spawn(async move {
            let request = FetchRequest::new(XmlSection::Directory)
                .with_key("domain", "name", "example.com")
                .with_param("user", "1000");
            bridge.fetch(&request).await
        })
    };

    let request = peer.recv_term(WAIT).await.expect("fetch request");
    let uuid = match request.as_tuple() {
        Some([fetch, section, tag_name, key_name, key_value, uuid, params]) if fetch.is_atom("fetch") => {
            assert_eq!(section, &Term::atom("directory"));
            assert_eq!(tag_name, &text("domain"));
            assert_eq!(key_name, &text("name"));
            assert_eq!(key_value, &text("example.com"));
            assert_eq!(params, &Term::list(vec![Term::tuple(vec![text("user"), text("1000")])]));
            uuid.clone()
        }
        other => panic!("unexpected request {:?}", other),
    };

    let reply = Term::tuple(vec![Term::atom("fetch_reply"), uuid.clone(), text("<document/>")]);
    assert_eq!(call(&peer, reply).await, Term::ok());
    assert_eq!(fetching.await.expect("join"), Some("<document/>".to_string()));

    let unknown = Term::tuple(vec![Term::atom("fetch_reply"), text("no-such-uuid"), text("<x/>")]);
    assert_eq!(call(&peer, unknown).await, Term::error("invalid_uuid"));
}

#[tokio::test]
async fn test_fetch_asks_every_bound_peer() {
    let engine = MockEngine::new();
    let bridge = new_bridge(&engine);
    let (_quiet_listener, quiet) = bridge.add_memory_peer("quiet@box");
    let (_answer_listener, answering) = bridge.add_memory_peer("answer@box");

    for peer in [&quiet, &answering] {
        assert_eq!(
            call(peer, Term::tuple(vec![Term::atom("bind"), Term::atom("dialplan")])).await,
            Term::ok()
        );
    }
    assert_eq!(bridge.binding_count(), 2);

    let fetching = {
        let bridge = bridge.clone();
        tokio::spawn(async move { bridge.fetch(&FetchRequest::new(XmlSection::Dialplan)).await })
    };

    let uuid_of = |request: Term| request.as_tuple().map(|t| t[5].clone()).expect("uuid");
    let first = uuid_of(quiet.recv_term(WAIT).await.expect("request to first binding"));
    let second = uuid_of(answering.recv_term(WAIT).await.expect("request to second binding"));
    assert_eq!(first, second);

    let reply = Term::tuple(vec![Term::atom("fetch_reply"), second, text("<doc/>")]);
    assert_eq!(call(&answering, reply).await, Term::ok());
    assert_eq!(fetching.await.expect("join"), Some("<doc/>".to_string()));

    let late = Term::tuple(vec![Term::atom("fetch_reply"), first, text("<other/>")]);
    assert_eq!(call(&quiet, late).await, Term::error("duplicate_response"));
}

#[tokio::test]
async fn test_fetch_timeout_and_late_reply() {
    let engine = MockEngine::new();
    let bridge = new_bridge(&engine);
    let (_listener, peer) = bridge.add_memory_peer("peer@box");

    call(&peer, Term::tuple(vec![Term::atom("bind"), Term::atom("dialplan")])).await;
    assert_eq!(bridge.fetch(&FetchRequest::new(XmlSection::Config)).await, None);

    let fetching = {
        let bridge = bridge.clone();
        tokio::spawn(async move { bridge.fetch(&FetchRequest::new(XmlSection::Dialplan)).await })
    };
    let request = peer.recv_term(WAIT).await.expect("fetch request");
    assert_eq!(fetching.await.expect("join"), None);

    let uuid = request.as_tuple().map(|t| t[5].clone()).expect("uuid");
    let late = Term::tuple(vec![Term::atom("fetch_reply"), uuid, text("<late/>")]);
    assert_eq!(call(&peer, late).await, Term::error("timeout"));
}

#[tokio::test]
async fn test_closing_listener_releases_fetch_waiters() {
    let engine = MockEngine::new();
    let mut config = test_config();
    config.fetch_timeout_ms = 10_000;
    let bridge = new_bridge_with(&engine, config);
    let (listener, peer) = bridge.add_memory_peer("peer@box");

    call(&peer, Term::tuple(vec![Term::atom("bind"), Term::atom("config")])).await;
    let started = Instant::now();
    let fetching = {
        let bridge = bridge.clone();
        tokio::spawn(async move { bridge.fetch(&FetchRequest::new(XmlSection::Config)).await })
    };
    let _request = peer.recv_term(WAIT).await.expect("fetch request");

    listener.shutdown();
    assert_eq!(fetching.await.expect("join"), None);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(wait_until(|| bridge.binding_count() == 0).await);
}

#[tokio::test]
async fn test_bind_rejects_unknown_section() {
    let engine = MockEngine::new();
    let bridge = new_bridge(&engine);
    let (_listener, peer) = bridge.add_memory_peer("peer@box");

    assert_eq!(
        call(&peer, Term::tuple(vec![Term::atom("bind"), Term::atom("weather")])).await,
        Term::error("badarg")
    );
    assert_eq!(bridge.binding_count(), 0);
}
