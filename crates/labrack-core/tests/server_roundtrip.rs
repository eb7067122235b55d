//! End-to-end tests: server, client, and subscriber over real sockets.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Map};

use labrack_core::testing::{DUMMY_DMM_CLASS, DUMMY_FAULTY_CLASS, DUMMY_SOURCE_CLASS};
use labrack_core::{
    BroadcastBus, Client, InstrumentFactory, LabrackError, ParameterEvent, ParameterManager,
    Registry, ServerHandle, ServerSettings, StationServer, Subscriber,
};

async fn start_server() -> (ServerHandle, Arc<Client>) {
    let registry = Arc::new(Registry::new(InstrumentFactory::with_defaults()));
    let bus = Arc::new(BroadcastBus::new(1024));
    let handle = StationServer::start(ServerSettings::loopback(), registry, bus)
        .await
        .expect("server start");
    let client = Arc::new(Client::new("127.0.0.1", handle.addr().port()));
    (handle, client)
}

/// Subscribe to the server's broadcast socket, collecting events.
async fn collect_events(
    handle: &ServerHandle,
    prefix: &str,
) -> (Subscriber, Arc<Mutex<Vec<ParameterEvent>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let subscriber = Subscriber::start(
        &handle.broadcast_addr.to_string(),
        prefix,
        move |event| {
            sink.lock().unwrap().push(event);
        },
    )
    .await
    .expect("subscriber start");
    // Let the server register the subscription before traffic starts.
    tokio::time::sleep(Duration::from_millis(50)).await;
    (subscriber, events)
}

#[tokio::test]
async fn test_create_and_read() {
    let (mut handle, client) = start_server().await;

    let dmm = client
        .find_or_create_instrument("dmm", DUMMY_DMM_CLASS, vec![], Map::new())
        .await
        .unwrap();
    assert_eq!(client.list_instruments().await.unwrap(), vec!["dmm"]);

    let blueprint = client.get_blueprint("dmm").await.unwrap();
    let voltage = &blueprint.parameters["voltage"];
    assert_eq!(voltage.unit, "V");
    assert!(voltage.settable);

    client.set_param("dmm", "voltage", json!(1.25)).await.unwrap();
    assert_eq!(client.get_param("dmm", "voltage").await.unwrap(), json!(1.25));
    assert_eq!(
        dmm.parameter("voltage").unwrap().get().await.unwrap(),
        json!(1.25)
    );

    handle.shutdown();
}

#[tokio::test]
async fn test_concurrent_sets_across_instruments() {
    let (mut handle, client) = start_server().await;
    let (subscriber, events) = collect_events(&handle, "").await;

    client
        .find_or_create_instrument("a", DUMMY_SOURCE_CLASS, vec![], Map::new())
        .await
        .unwrap();
    client
        .find_or_create_instrument("b", DUMMY_SOURCE_CLASS, vec![], Map::new())
        .await
        .unwrap();

    // Two independent clients hitting two instruments simultaneously.
    let port = handle.addr().port();
    let client_a = Arc::new(Client::new("127.0.0.1", port));
    let client_b = Arc::new(Client::new("127.0.0.1", port));
    let (ra, rb) = tokio::join!(
        client_a.set_param("a", "voltage", json!(1.0)),
        client_b.set_param("b", "voltage", json!(2.0)),
    );
    ra.unwrap();
    rb.unwrap();

    assert_eq!(client.get_param("a", "voltage").await.unwrap(), json!(1.0));
    assert_eq!(client.get_param("b", "voltage").await.unwrap(), json!(2.0));

    tokio::time::sleep(Duration::from_millis(100)).await;
    let topics: Vec<String> = {
        let events = events.lock().unwrap();
        events.iter().map(|e| e.topic.clone()).collect()
    };
    assert!(topics.contains(&"a.voltage".to_string()));
    assert!(topics.contains(&"b.voltage".to_string()));

    subscriber.stop().await;
    handle.shutdown();
}

#[tokio::test]
async fn test_concurrent_sets_within_one_instrument() {
    let (mut handle, client) = start_server().await;
    let (subscriber, events) = collect_events(&handle, "a.").await;

    client
        .find_or_create_instrument("a", DUMMY_SOURCE_CLASS, vec![], Map::new())
        .await
        .unwrap();

    let port = handle.addr().port();
    let client_a = Arc::new(Client::new("127.0.0.1", port));
    let client_b = Arc::new(Client::new("127.0.0.1", port));
    let (ra, rb) = tokio::join!(
        client_a.set_param("a", "voltage", json!(1.0)),
        client_b.set_param("a", "voltage", json!(2.0)),
    );
    ra.unwrap();
    rb.unwrap();

    // The winner is whichever handler committed last, but it must be one of
    // the two written values.
    let final_value = client.get_param("a", "voltage").await.unwrap();
    assert!(final_value == json!(1.0) || final_value == json!(2.0));

    tokio::time::sleep(Duration::from_millis(100)).await;
    let observed = events.lock().unwrap();
    assert_eq!(observed.len(), 2);
    // Broadcasts come out in commit order, and the last one matches the
    // final state.
    assert_eq!(observed[1].change.value, final_value);

    subscriber.stop().await;
    handle.shutdown();
}

#[tokio::test]
async fn test_validation_failure_leaves_state_and_emits_nothing() {
    let (mut handle, client) = start_server().await;

    client
        .find_or_create_instrument("dmm", DUMMY_DMM_CLASS, vec![], Map::new())
        .await
        .unwrap();
    client.set_param("dmm", "range", json!(10)).await.unwrap();

    let (subscriber, events) = collect_events(&handle, "").await;

    let err = client.set_param("dmm", "range", json!(5)).await.unwrap_err();
    assert!(matches!(err, LabrackError::Validation(_)));
    assert_eq!(client.get_param("dmm", "range").await.unwrap(), json!(10));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(events.lock().unwrap().is_empty());

    subscriber.stop().await;
    handle.shutdown();
}

#[tokio::test]
async fn test_read_only_set_is_unsupported() {
    let (mut handle, client) = start_server().await;
    client
        .find_or_create_instrument("dmm", DUMMY_DMM_CLASS, vec![], Map::new())
        .await
        .unwrap();

    let err = client
        .set_param("dmm", "idn", json!("changed"))
        .await
        .unwrap_err();
    assert!(matches!(err, LabrackError::Unsupported(_)));
    assert_eq!(
        client.get_param("dmm", "idn").await.unwrap(),
        json!("labrack dummy dmm")
    );

    handle.shutdown();
}

#[tokio::test]
async fn test_parameter_manager_over_the_wire() {
    let (mut handle, client) = start_server().await;

    let pm = client
        .find_or_create_instrument(
            ParameterManager::DEFAULT_NAME,
            ParameterManager::CLASS_PATH,
            vec![],
            Map::new(),
        )
        .await
        .unwrap();

    pm.method("add_parameter")
        .unwrap()
        .call(vec![json!("qubit.pi.length"), json!(40), json!("ns")], Map::new())
        .await
        .unwrap();

    assert_eq!(
        client
            .get_param(ParameterManager::DEFAULT_NAME, "qubit.pi.length")
            .await
            .unwrap(),
        json!(40)
    );

    // The blueprint grew the new sub-modules; a fresh proxy sees them.
    let pm = client
        .get_instrument(ParameterManager::DEFAULT_NAME)
        .await
        .unwrap();
    assert!(pm.parameter("qubit.pi.length").is_some());

    pm.method("remove_parameter")
        .unwrap()
        .call(vec![json!("qubit.pi.length")], Map::new())
        .await
        .unwrap();

    let err = client
        .get_param(ParameterManager::DEFAULT_NAME, "qubit.pi.length")
        .await
        .unwrap_err();
    assert!(matches!(err, LabrackError::NotFound(_)));

    handle.shutdown();
}

#[tokio::test]
async fn test_subscriber_prefix_filtering() {
    let (mut handle, client) = start_server().await;

    client
        .find_or_create_instrument("dmm", DUMMY_DMM_CLASS, vec![], Map::new())
        .await
        .unwrap();
    client
        .find_or_create_instrument("source", DUMMY_SOURCE_CLASS, vec![], Map::new())
        .await
        .unwrap();

    let (subscriber, dmm_events) = collect_events(&handle, "dmm.").await;

    client.set_param("dmm", "voltage", json!(1.25)).await.unwrap();
    client.set_param("source", "voltage", json!(5.0)).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let observed = dmm_events.lock().unwrap();
    assert_eq!(observed.len(), 1);
    assert_eq!(observed[0].topic, "dmm.voltage");
    assert_eq!(observed[0].change.value, json!(1.25));
    assert_eq!(observed[0].change.unit, "V");
    assert!(observed[0].change.ts > 0.0);
    drop(observed);

    subscriber.stop().await;
    handle.shutdown();
}

#[tokio::test]
async fn test_snapshot_over_the_wire() {
    let (mut handle, client) = start_server().await;
    client
        .find_or_create_instrument("dmm", DUMMY_DMM_CLASS, vec![], Map::new())
        .await
        .unwrap();
    client.set_param("dmm", "voltage", json!(3.3)).await.unwrap();

    let snapshot = client.snapshot("dmm").await.unwrap();
    assert_eq!(snapshot["voltage"], json!(3.3));
    assert_eq!(snapshot["trigger.mode"], json!("auto"));

    handle.shutdown();
}

#[tokio::test]
async fn test_create_conflicting_class_is_validation_error() {
    let (mut handle, client) = start_server().await;
    client
        .find_or_create_instrument("dev", DUMMY_DMM_CLASS, vec![], Map::new())
        .await
        .unwrap();

    let err = client
        .find_or_create_instrument("dev", DUMMY_SOURCE_CLASS, vec![], Map::new())
        .await
        .unwrap_err();
    assert!(matches!(err, LabrackError::Validation(_)));

    handle.shutdown();
}

#[tokio::test]
async fn test_driver_failures_cross_the_wire_without_killing_workers() {
    let (mut handle, client) = start_server().await;
    client
        .find_or_create_instrument("flaky", DUMMY_FAULTY_CLASS, vec![], Map::new())
        .await
        .unwrap();

    // A driver-reported fault arrives as InstrumentFailure with the
    // driver's text preserved.
    let err = client
        .call_method("flaky", "fail", vec![], Map::new())
        .await
        .unwrap_err();
    match err {
        LabrackError::InstrumentFailure(msg) => assert!(msg.contains("bus timeout")),
        other => panic!("expected InstrumentFailure, got {:?}", other),
    }

    // Panic more times than the pool has workers; every request still gets
    // an answer, so no worker died with the driver.
    for _ in 0..8 {
        let err = client
            .call_method("flaky", "panic", vec![], Map::new())
            .await
            .unwrap_err();
        match err {
            LabrackError::InstrumentFailure(msg) => {
                assert!(msg.contains("simulated driver crash"))
            }
            other => panic!("expected InstrumentFailure, got {:?}", other),
        }
    }

    // The instrument lock was released by the unwinds and the pool keeps
    // serving.
    assert_eq!(
        client.get_param("flaky", "status").await.unwrap(),
        json!("ok")
    );
    assert_eq!(client.list_instruments().await.unwrap(), vec!["flaky"]);

    handle.shutdown();
}

#[tokio::test]
async fn test_method_call_over_the_wire() {
    let (mut handle, client) = start_server().await;
    client
        .find_or_create_instrument("src", DUMMY_SOURCE_CLASS, vec![], Map::new())
        .await
        .unwrap();

    let reached = client
        .call_method("src", "ramp", vec![json!(2.5)], Map::new())
        .await
        .unwrap();
    assert_eq!(reached, json!(2.5));
    assert_eq!(client.get_param("src", "voltage").await.unwrap(), json!(2.5));

    handle.shutdown();
}
