//! Gateway forwarding through `/services/{serviceName}/...`.
//!
//! Services are created through the control API on the in-memory runtime; their
//! routes are then pointed at a wiremock server standing in for the container.

mod common;

use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::*;

#[tokio::test]
async fn test_suma_end_to_end() {
    let h = harness().await;
    let service = create(&h.app, &suma_submission()).await;
    let service_name = service["serviceName"].as_str().unwrap().to_string();
    assert!(service_name.starts_with("suma-"));
    assert_eq!(service["status"], "running");
    assert_eq!(
        service["url"],
        format!("http://localhost:4000/services/{}", service_name)
    );

    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/suma"))
        .and(query_param("num1", "5"))
        .and(query_param("num2", "10"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true, "resultado": 15})))
        .expect(1)
        .mount(&upstream)
        .await;
    route_to(&h.state, &service_name, &upstream.uri()).await;

    let reply = get(
        &h.app,
        &format!("/services/{}/api/suma?num1=5&num2=10", service_name),
    )
    .await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body, json!({"success": true, "resultado": 15}));
}

#[tokio::test]
async fn test_json_body_reencoded_with_fresh_length() {
    let h = harness().await;
    let service = create(&h.app, &suma_submission()).await;
    let name = service["serviceName"].as_str().unwrap().to_string();

    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/items"))
        .and(body_json(json!({"a": 1, "b": [1, 2]})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"created": true})))
        .expect(1)
        .mount(&upstream)
        .await;
    route_to(&h.state, &name, &upstream.uri()).await;

    // Pretty-printed body: the forwarded copy is shorter than what was sent.
    let raw = "{\n  \"a\": 1,\n  \"b\": [1, 2]\n}";
    let reply = send(
        &h.app,
        Request::post(format!("/services/{}/items", name))
            .header("content-type", "application/json")
            .header("content-length", raw.len().to_string())
            .body(Body::from(raw))
            .unwrap(),
    )
    .await;
    assert_eq!(reply.status, StatusCode::CREATED);
    assert_eq!(reply.body["created"], true);

    let received = upstream.received_requests().await.unwrap();
    let forwarded = &received[0];
    assert_eq!(
        forwarded.headers.get("content-length").unwrap().to_str().unwrap(),
        forwarded.body.len().to_string()
    );
}

#[tokio::test]
async fn test_prefix_stripped_for_root_and_bare_paths() {
    let h = harness().await;
    let service = create(&h.app, &suma_submission()).await;
    let name = service["serviceName"].as_str().unwrap().to_string();

    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_string("root"))
        .expect(2)
        .mount(&upstream)
        .await;
    route_to(&h.state, &name, &upstream.uri()).await;

    let bare = get(&h.app, &format!("/services/{}", name)).await;
    assert_eq!(bare.status, StatusCode::OK);
    assert_eq!(bare.body, json!("root"));

    let slash = get(&h.app, &format!("/services/{}/", name)).await;
    assert_eq!(slash.status, StatusCode::OK);
}

#[tokio::test]
async fn test_upstream_status_and_headers_passed_through() {
    let h = harness().await;
    let service = create(&h.app, &suma_submission()).await;
    let name = service["serviceName"].as_str().unwrap().to_string();

    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/secret"))
        .and(header("x-trace", "abc"))
        .respond_with(
            ResponseTemplate::new(418)
                .insert_header("x-custom", "teapot")
                .insert_header("cache-control", "max-age=60")
                .set_body_json(json!({"error": "short and stout"})),
        )
        .mount(&upstream)
        .await;
    route_to(&h.state, &name, &upstream.uri()).await;

    let reply = send(
        &h.app,
        Request::get(format!("/services/{}/secret", name))
            .header("x-trace", "abc")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(reply.status, StatusCode::IM_A_TEAPOT);
    assert_eq!(reply.headers.get("x-custom").unwrap(), "teapot");
    // control-plane security headers are not applied to gateway traffic
    assert_eq!(reply.headers.get("cache-control").unwrap(), "max-age=60");
    assert_eq!(reply.body["error"], "short and stout");
}

#[tokio::test]
async fn test_unknown_service_is_404() {
    let h = harness().await;
    let reply = get(&h.app, "/services/nope-12345678/anything").await;
    assert_eq!(reply.status, StatusCode::NOT_FOUND);
    assert_eq!(reply.body["success"], false);
}

#[tokio::test]
async fn test_dead_upstream_is_503() {
    let h = harness().await;
    let service = create(&h.app, &suma_submission()).await;
    let name = service["serviceName"].as_str().unwrap().to_string();

    // Bind and drop a listener so the port is closed.
    let port = {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap().port()
    };
    route_to(&h.state, &name, &format!("http://127.0.0.1:{}", port)).await;

    let reply = get(&h.app, &format!("/services/{}/api/suma", name)).await;
    assert_eq!(reply.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(reply.body["success"], false);
    assert_eq!(reply.body["service"], name);
    assert_eq!(reply.body["code"], "service_unavailable");
}

#[tokio::test]
async fn test_deleted_service_stops_routing() {
    let h = harness().await;
    let service = create(&h.app, &suma_submission()).await;
    let id = service["id"].as_str().unwrap().to_string();
    let name = service["serviceName"].as_str().unwrap().to_string();

    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .mount(&upstream)
        .await;
    route_to(&h.state, &name, &upstream.uri()).await;
    assert_eq!(get(&h.app, &format!("/services/{}/", name)).await.status, StatusCode::OK);

    let reply = delete(&h.app, &format!("/api/microservices/{}", id)).await;
    assert_eq!(reply.status, StatusCode::OK);

    let after = get(&h.app, &format!("/services/{}/", name)).await;
    assert_eq!(after.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_stopped_service_stops_routing_and_restart_restores() {
    let h = harness().await;
    let service = create(&h.app, &suma_submission()).await;
    let id = service["id"].as_str().unwrap().to_string();
    let name = service["serviceName"].as_str().unwrap().to_string();
    assert!(h.state.routes.lookup(&name).await.is_some());

    let stopped = post_json(&h.app, &format!("/api/microservices/{}/stop", id), &json!({})).await;
    assert_eq!(stopped.status, StatusCode::OK);
    assert_eq!(stopped.body["microservice"]["status"], "exited");
    assert!(stopped.body["microservice"]["url"].is_null());
    assert!(h.state.routes.lookup(&name).await.is_none());

    let started = post_json(&h.app, &format!("/api/microservices/{}/start", id), &json!({})).await;
    assert_eq!(started.status, StatusCode::OK);
    assert_eq!(started.body["microservice"]["status"], "running");
    assert!(h.state.routes.lookup(&name).await.is_some());
}

#[tokio::test]
async fn test_gateway_requests_show_up_in_metrics() {
    let h = harness().await;
    get(&h.app, "/services/metrics-probe-00000000/").await;
    let reply = get(&h.app, "/metrics").await;
    assert_eq!(reply.status, StatusCode::OK);
    let text = reply.body.as_str().unwrap();
    assert!(text.contains("msgate_gateway_requests_total"));
    assert!(text.contains("metrics-probe-00000000"));
}

#[tokio::test]
async fn test_running_service_keeps_serving_while_another_deploys() {
    let h = harness().await;
    let service = create(&h.app, &suma_submission()).await;
    let name = service["serviceName"].as_str().unwrap().to_string();

    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/suma"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"resultado": 3})))
        .mount(&upstream)
        .await;
    route_to(&h.state, &name, &upstream.uri()).await;

    // Every runtime call for the second deployment now takes two seconds.
    h.runtime.set_delay(Some(Duration::from_secs(2)));
    let app = h.app.clone();
    let deploying = tokio::spawn(async move {
        post_json(&app, "/api/microservices", &suma_submission()).await
    });
    tokio::task::yield_now().await;

    let started = Instant::now();
    let reply = tokio::time::timeout(
        Duration::from_secs(1),
        get(&h.app, &format!("/services/{}/api/suma?num1=1&num2=2", name)),
    )
    .await
    .expect("gateway request blocked behind a deployment");
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body, json!({"resultado": 3}));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(!deploying.is_finished());

    deploying.abort();
}
