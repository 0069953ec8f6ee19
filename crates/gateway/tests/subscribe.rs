//! Subscribe and unsubscribe flows: snapshot delivery, transitive
//! loads, access enforcement, and event ordering.

mod common;

use common::{subscribe_model, Session};
use serde_json::json;

#[tokio::test]
async fn subscribe_model_delivers_snapshot() {
    let session = Session::start();
    let mut client = session.connect().await;

    let id = client.request("subscribe.test.model", None);

    let mut reqs = session.bus.get_requests(2).await;
    reqs.take("access.test.model")
        .assert_payload("token", json!(null))
        .respond_success(json!({ "get": true, "call": "*" }));
    reqs.take("get.test.model")
        .respond_success(json!({ "model": { "foo": "bar" } }));

    let result = client.get_result(id).await;
    assert_eq!(result, json!({ "models": { "test.model": { "foo": "bar" } } }));

    // Exactly one backend subscription for the resource.
    assert_eq!(session.bus.subscription_count("event.test.model.>"), 1);
    assert!(session.cache.get("test.model").unwrap().has_backend_sub());
}

#[tokio::test]
async fn subscribe_collection_delivers_snapshot() {
    let session = Session::start();
    let mut client = session.connect().await;

    let id = client.request("subscribe.test.collection", None);

    let mut reqs = session.bus.get_requests(2).await;
    reqs.take("access.test.collection")
        .respond_success(json!({ "get": true }));
    reqs.take("get.test.collection")
        .respond_success(json!({ "collection": ["a", "b", 3] }));

    let result = client.get_result(id).await;
    assert_eq!(
        result,
        json!({ "collections": { "test.collection": ["a", "b", 3] } })
    );
}

#[tokio::test]
async fn subscribe_access_denied_fails_request() {
    let session = Session::start();
    let mut client = session.connect().await;

    let id = client.request("subscribe.test.model", None);

    let mut reqs = session.bus.get_requests(2).await;
    reqs.take("access.test.model")
        .respond_success(json!({ "get": false }));
    reqs.take("get.test.model")
        .respond_success(json!({ "model": { "foo": "bar" } }));

    assert_eq!(client.get_error_code(id).await, "system.accessDenied");
}

#[tokio::test]
async fn subscribe_get_error_fails_request() {
    let session = Session::start();
    let mut client = session.connect().await;

    let id = client.request("subscribe.test.model", None);

    let mut reqs = session.bus.get_requests(2).await;
    reqs.take("access.test.model")
        .respond_success(json!({ "get": true }));
    reqs.take("get.test.model")
        .respond_error("system.notFound", "Not found");

    assert_eq!(client.get_error_code(id).await, "system.notFound");
}

#[tokio::test]
async fn subscribe_loads_referenced_resources() {
    let session = Session::start();
    let mut client = session.connect().await;

    let id = client.request("subscribe.test.model", None);

    let mut reqs = session.bus.get_requests(2).await;
    reqs.take("access.test.model")
        .respond_success(json!({ "get": true }));
    reqs.take("get.test.model")
        .respond_success(json!({ "model": { "name": "a", "child": { "rid": "test.child" } } }));

    // The referenced resource is fetched and access checked the same
    // way.
    let mut reqs = session.bus.get_requests(2).await;
    reqs.take("access.test.child")
        .respond_success(json!({ "get": true }));
    reqs.take("get.test.child")
        .respond_success(json!({ "model": { "foo": "bar" } }));

    let result = client.get_result(id).await;
    assert_eq!(
        result,
        json!({ "models": {
            "test.model": { "name": "a", "child": { "rid": "test.child" } },
            "test.child": { "foo": "bar" },
        }})
    );
}

#[tokio::test]
async fn subscribe_child_access_denied_goes_into_errors() {
    let session = Session::start();
    let mut client = session.connect().await;

    let id = client.request("subscribe.test.model", None);

    let mut reqs = session.bus.get_requests(2).await;
    reqs.take("access.test.model")
        .respond_success(json!({ "get": true }));
    reqs.take("get.test.model")
        .respond_success(json!({ "model": { "child": { "rid": "test.child" } } }));

    let mut reqs = session.bus.get_requests(2).await;
    reqs.take("access.test.child")
        .respond_success(json!({ "get": false }));
    reqs.take("get.test.child")
        .respond_success(json!({ "model": { "foo": "bar" } }));

    // The parent still loads; the denied child lands in errors.
    let result = client.get_result(id).await;
    assert_eq!(
        result["models"]["test.model"],
        json!({ "child": { "rid": "test.child" } })
    );
    assert_eq!(
        result["errors"]["test.child"]["code"],
        json!("system.accessDenied")
    );
}

#[tokio::test]
async fn subscribe_soft_references_are_not_followed() {
    let session = Session::start();
    let mut client = session.connect().await;

    let id = client.request("subscribe.test.model", None);

    let mut reqs = session.bus.get_requests(2).await;
    reqs.take("access.test.model")
        .respond_success(json!({ "get": true }));
    reqs.take("get.test.model")
        .respond_success(
            json!({ "model": { "parent": { "rid": "test.parent", "soft": true } } }),
        );

    let result = client.get_result(id).await;
    assert_eq!(
        result["models"]["test.model"]["parent"],
        json!({ "rid": "test.parent", "soft": true })
    );
    session.bus.assert_no_request().await;
}

#[tokio::test]
async fn subscribe_cyclic_references_terminate() {
    let session = Session::start();
    let mut client = session.connect().await;

    let id = client.request("subscribe.test.a", None);

    let mut reqs = session.bus.get_requests(2).await;
    reqs.take("access.test.a")
        .respond_success(json!({ "get": true }));
    reqs.take("get.test.a")
        .respond_success(json!({ "model": { "other": { "rid": "test.b" } } }));

    let mut reqs = session.bus.get_requests(2).await;
    reqs.take("access.test.b")
        .respond_success(json!({ "get": true }));
    reqs.take("get.test.b")
        .respond_success(json!({ "model": { "other": { "rid": "test.a" } } }));

    let result = client.get_result(id).await;
    assert_eq!(
        result["models"]["test.a"],
        json!({ "other": { "rid": "test.b" } })
    );
    assert_eq!(
        result["models"]["test.b"],
        json!({ "other": { "rid": "test.a" } })
    );
}

#[tokio::test]
async fn second_subscriber_reuses_backend_subscription() {
    let session = Session::start();
    let mut first = session.connect().await;
    subscribe_model(&session, &mut first, "test.model", json!({ "foo": "bar" })).await;

    // A second client subscribing to the same resource triggers only an
    // access check; the snapshot is served from the cache.
    let mut second = session.connect().await;
    let id = second.request("subscribe.test.model", None);
    session
        .bus
        .get_request()
        .await
        .assert_subject("access.test.model")
        .respond_success(json!({ "get": true }));

    let result = second.get_result(id).await;
    assert_eq!(result["models"]["test.model"], json!({ "foo": "bar" }));
    assert_eq!(session.bus.subscription_count("event.test.model.>"), 1);
}

#[tokio::test]
async fn snapshot_is_delivered_before_events() {
    let session = Session::start();
    let mut client = session.connect().await;

    let id = client.request("subscribe.test.model", None);
    let mut reqs = session.bus.get_requests(2).await;
    reqs.take("access.test.model")
        .respond_success(json!({ "get": true }));
    let get = reqs.take("get.test.model");

    // An event racing the initial fetch: the snapshot supersedes it and
    // the client never sees it.
    session
        .bus
        .event("event.test.model.change", json!({ "foo": "early" }));
    get.respond_success(json!({ "model": { "foo": "bar" } }));

    let result = client.get_result(id).await;
    assert_eq!(result["models"]["test.model"], json!({ "foo": "bar" }));

    session
        .bus
        .event("event.test.model.change", json!({ "foo": "baz" }));
    let data = client.assert_event("test.model", "change").await;
    assert_eq!(data, json!({ "foo": "baz" }));
}

#[tokio::test]
async fn events_are_delivered_in_order() {
    let session = Session::start();
    let mut client = session.connect().await;
    subscribe_model(&session, &mut client, "test.model", json!({ "n": 0 })).await;

    for i in 1..=5 {
        session
            .bus
            .event("event.test.model.change", json!({ "n": i }));
    }
    for i in 1..=5 {
        let data = client.assert_event("test.model", "change").await;
        assert_eq!(data, json!({ "n": i }));
    }
}

#[tokio::test]
async fn custom_events_are_forwarded_verbatim() {
    let session = Session::start();
    let mut client = session.connect().await;
    subscribe_model(&session, &mut client, "test.model", json!({ "foo": "bar" })).await;

    session
        .bus
        .event("event.test.model.ping", json!({ "anything": [1, 2, 3] }));
    let data = client.assert_event("test.model", "ping").await;
    assert_eq!(data, json!({ "anything": [1, 2, 3] }));
}

#[tokio::test]
async fn unsubscribe_returns_null_and_stops_events() {
    let session = Session::start();
    let mut client = session.connect().await;
    subscribe_model(&session, &mut client, "test.model", json!({ "foo": "bar" })).await;

    let id = client.request("unsubscribe.test.model", None);
    let result = client.get_result(id).await;
    assert_eq!(result, serde_json::Value::Null);

    // Resubscribing builds the graph anew: access is requested again
    // while the snapshot still comes from the cache.
    let id = client.request("subscribe.test.model", None);
    session
        .bus
        .get_request()
        .await
        .assert_subject("access.test.model")
        .respond_success(json!({ "get": true }));
    let result = client.get_result(id).await;
    assert_eq!(result["models"]["test.model"], json!({ "foo": "bar" }));
}

#[tokio::test]
async fn unsubscribe_without_subscription_errors() {
    let session = Session::start();
    let mut client = session.connect().await;

    let id = client.request("unsubscribe.test.model", None);
    assert_eq!(client.get_error_code(id).await, "system.noSubscription");
}

#[tokio::test]
async fn double_subscribe_needs_two_unsubscribes() {
    let session = Session::start();
    let mut client = session.connect().await;
    subscribe_model(&session, &mut client, "test.model", json!({ "foo": "bar" })).await;

    // Second direct subscription; access is cached, snapshot is
    // resident.
    let id = client.request("subscribe.test.model", None);
    let result = client.get_result(id).await;
    assert_eq!(result["models"]["test.model"], json!({ "foo": "bar" }));

    let id = client.request("unsubscribe.test.model", None);
    client.get_result(id).await;
    let id = client.request("unsubscribe.test.model", None);
    client.get_result(id).await;

    let id = client.request("unsubscribe.test.model", None);
    assert_eq!(client.get_error_code(id).await, "system.noSubscription");
}

#[tokio::test]
async fn invalid_rid_is_rejected() {
    let session = Session::start();
    let mut client = session.connect().await;

    let id = client.request("subscribe.test..model", None);
    assert_eq!(client.get_error_code(id).await, "system.invalidRequest");

    let id = client.request("subscribe.test.*", None);
    assert_eq!(client.get_error_code(id).await, "system.invalidRequest");
}

#[tokio::test]
async fn version_handshake_negotiates() {
    let session = Session::start();
    let mut client = session.connect_without_version().await;

    let id = client.request("version", Some(json!({ "protocol": "1.999.999" })));
    let result = client.get_result(id).await;
    assert_eq!(result["protocol"], json!(gateway::PROTOCOL_VERSION));

    let id = client.request("version", Some(json!({ "protocol": "bogus" })));
    assert_eq!(client.get_error_code(id).await, "system.invalidParams");
}
