mod support;

use std::io::Read;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use pack_runner_host::host::{
    BroadcastEventBus, HttpClient, HttpRequest, KvScope, MemoryLogSink, ReqwestHttpClient,
    ResolvedSecrets, WasmtimeRuntime,
};
use pack_runner_host::workflow::{RunContext, RunSignals, WorkflowEngine};
use serde_json::{Value, json};
use support::{PackSpec, pack_at, write_workflow};
use tiny_http::{Header, Response, Server};

/// Seen by the server: method, path, content-type header, body.
type Seen = (String, String, Option<String>, String);

/// Serve `count` requests, answering each with `{"echo": <request body>}`.
fn serve(count: usize) -> (String, JoinHandle<Vec<Seen>>) {
    let server = Server::http("127.0.0.1:0").expect("bind test server");
    let addr = server.server_addr().to_ip().expect("ip listener");
    let handle = std::thread::spawn(move || {
        let mut seen = Vec::new();
        for _ in 0..count {
            let mut request = server.recv().expect("request");
            let mut body = String::new();
            request.as_reader().read_to_string(&mut body).unwrap();
            let content_type = request
                .headers()
                .iter()
                .find(|header| header.field.equiv("content-type"))
                .map(|header| header.value.as_str().to_string());
            seen.push((
                request.method().as_str().to_string(),
                request.url().to_string(),
                content_type,
                body.clone(),
            ));
            let echoed: Value = serde_json::from_str(&body).unwrap_or(Value::String(body));
            let response = Response::from_string(json!({ "echo": echoed }).to_string())
                .with_status_code(201)
                .with_header(
                    Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]).unwrap(),
                );
            request.respond(response).unwrap();
        }
        seen
    });
    (format!("http://{addr}"), handle)
}

#[tokio::test]
async fn reqwest_client_round_trips_requests() {
    let (base, server) = serve(1);
    let client = ReqwestHttpClient::new(Duration::from_secs(5)).unwrap();
    let response = client
        .send(HttpRequest {
            method: "put".into(),
            url: format!("{base}/items/7"),
            headers: [("content-type".to_string(), "application/json".to_string())].into(),
            body: Some(r#"{"name":"seven"}"#.into()),
        })
        .await
        .expect("request succeeds");

    assert_eq!(response.status, 201);
    assert_eq!(
        response.to_value()["body"],
        json!({ "echo": { "name": "seven" } })
    );
    let seen = server.join().unwrap();
    assert_eq!(seen[0].0, "PUT");
    assert_eq!(seen[0].1, "/items/7");
}

#[tokio::test]
async fn reqwest_client_rejects_bad_methods() {
    let client = ReqwestHttpClient::new(Duration::from_secs(1)).unwrap();
    let err = client
        .send(HttpRequest {
            method: "NOT A METHOD".into(),
            url: "http://127.0.0.1:9/".into(),
            headers: Default::default(),
            body: None,
        })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("invalid http method"));
}

#[tokio::test]
async fn workflow_posts_json_to_a_granted_host() {
    let (base, server) = serve(1);
    let temp = tempfile::TempDir::new().unwrap();
    let pack = pack_at(
        temp.path(),
        PackSpec {
            connect: &["127.0.0.1"],
            ..PackSpec::workflow("poster")
        },
    );
    write_workflow(
        temp.path(),
        json!([
            { "id": "seed", "type": "kv.put", "key": "n", "value": 5 },
            { "id": "post", "type": "http.request", "method": "POST",
              "url": format!("{base}/ingest"), "body": { "n": "{{seed.response}}" } },
            { "id": "check", "type": "kv.put", "key": "echoed", "value": "{{post.response.body.echo.n}}" }
        ]),
    );

    let http: Arc<dyn HttpClient> = Arc::new(ReqwestHttpClient::new(Duration::from_secs(5)).unwrap());
    let engine = WorkflowEngine::new(
        http,
        Arc::new(WasmtimeRuntime::new().unwrap()),
        Arc::new(MemoryLogSink::new(8)),
        Arc::new(BroadcastEventBus::default()),
        Duration::from_secs(5),
    );
    let mut kv = KvScope::new();
    let report = engine
        .run_pack(RunContext {
            pack: &pack,
            instance_id: "inst-http",
            secrets: &ResolvedSecrets::default(),
            kv: &mut kv,
            signals: &RunSignals::new(),
        })
        .await
        .expect("workflow runs");

    assert_eq!(report.results["post"]["status"], json!(201));
    assert_eq!(kv.get("echoed"), Some(&json!(5)));
    let seen = server.join().unwrap();
    assert_eq!(seen[0].0, "POST");
    assert_eq!(seen[0].2.as_deref(), Some("application/json"));
    assert_eq!(seen[0].3, r#"{"n":5}"#);
}

#[tokio::test]
async fn transport_errors_leave_the_url_out() {
    let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = closed.local_addr().unwrap();
    drop(closed);

    let client = ReqwestHttpClient::new(Duration::from_secs(5)).unwrap();
    let err = client
        .send(HttpRequest {
            method: "GET".into(),
            url: format!("http://{addr}/x?token=s3cr3t"),
            headers: [("authorization".to_string(), "Bearer s3cr3t".to_string())].into(),
            body: None,
        })
        .await
        .unwrap_err();

    let message = err.to_string();
    assert!(message.starts_with("request failed"), "{message}");
    assert!(!message.contains("s3cr3t"), "{message}");
    assert!(!message.contains("/x"), "{message}");
}
