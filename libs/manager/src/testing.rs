//! Mock apiserver plumbing shared by the unit tests: a kube [`Client`]
//! wired to a tower-test service pair, so tests assert on the exact
//! HTTP traffic the controllers produce.

use http::{Method, Request, Response};
use kube::client::Body;
use kube::Client;
use tower_test::mock::{self, Handle};

pub type ApiServerHandle = Handle<Request<Body>, Response<Body>>;

pub fn mock_client() -> (Client, ApiServerHandle) {
    let (service, handle) = mock::pair::<Request<Body>, Response<Body>>();
    (Client::new(service, "ns-manager"), handle)
}

/// Serve exactly one request: assert method and path prefix, reply
/// with `response`, return the request head and its parsed JSON body
/// (`Null` for bodiless requests).
pub async fn serve_one(
    handle: &mut ApiServerHandle,
    method: Method,
    path_prefix: &str,
    response: serde_json::Value,
) -> (http::request::Parts, serde_json::Value) {
    let (request, send) = handle.next_request().await.expect("service not called");
    assert_eq!(request.method(), method);
    assert!(
        request.uri().path().starts_with(path_prefix),
        "expected path {} to start with {path_prefix}",
        request.uri().path(),
    );
    let (parts, body) = request.into_parts();
    let bytes = body.collect_bytes().await.unwrap();
    let body_json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("request body is json")
    };
    send.send_response(
        Response::builder()
            .body(Body::from(serde_json::to_vec(&response).unwrap()))
            .unwrap(),
    );
    (parts, body_json)
}

/// Reply to one request with an apiserver-style error status.
pub async fn serve_error(handle: &mut ApiServerHandle, code: u16, reason: &str) {
    let (_, send) = handle.next_request().await.expect("service not called");
    let error = serde_json::json!({
        "kind": "Status",
        "status": "Failure",
        "reason": reason,
        "message": reason,
        "code": code,
    });
    send.send_response(
        Response::builder()
            .status(code)
            .body(Body::from(serde_json::to_vec(&error).unwrap()))
            .unwrap(),
    );
}
