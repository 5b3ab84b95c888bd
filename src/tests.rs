use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use http::{Request, Response as HttpResponse, StatusCode};
use serde_json::json;

use crate::client::Client;
use crate::config::RequestConfig;
use crate::error::{Error, ErrorCode, TransportErrorKind};
use crate::sender::{HttpSender, SendError};
use crate::session::{AuthSession, LoginTrigger};

const ENDPOINT: &str = "https://api.origin.test/v1/items";
const INVALID_TOKEN_BODY: &str = r#"{"failure":{"cause":"INVALID_VALUE","field":"AuthToken"}}"#;

enum Step {
    Reply {
        status: u16,
        content_type: Option<&'static str>,
        body: &'static str,
    },
    Stall(Duration),
    Fail(TransportErrorKind),
}

impl Step {
    fn json(status: u16, body: &'static str) -> Self {
        Self::Reply {
            status,
            content_type: Some("application/json"),
            body,
        }
    }

    fn empty(status: u16) -> Self {
        Self::Reply {
            status,
            content_type: None,
            body: "",
        }
    }
}

#[derive(Clone, Debug)]
struct CapturedRequest {
    method: String,
    uri: String,
    headers: Vec<(String, String)>,
    body: Bytes,
}

impl CapturedRequest {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(label, _)| label.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Answers requests from a fixed script, then with `200 {}` once it runs dry.
#[derive(Default)]
struct ScriptedSender {
    steps: Mutex<VecDeque<Step>>,
    captured: Mutex<Vec<CapturedRequest>>,
}

impl ScriptedSender {
    fn new(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into()),
            captured: Mutex::new(Vec::new()),
        })
    }

    fn request_count(&self) -> usize {
        self.captured.lock().expect("lock captured").len()
    }

    fn captured(&self) -> Vec<CapturedRequest> {
        self.captured.lock().expect("lock captured").clone()
    }
}

fn reply(status: u16, content_type: Option<&str>, body: &str) -> HttpResponse<Bytes> {
    let mut builder = HttpResponse::builder().status(status);
    if let Some(content_type) = content_type {
        builder = builder.header("content-type", content_type);
    }
    builder
        .body(Bytes::copy_from_slice(body.as_bytes()))
        .expect("build scripted response")
}

impl HttpSender for ScriptedSender {
    fn send(
        &self,
        request: Request<Bytes>,
    ) -> BoxFuture<'static, Result<HttpResponse<Bytes>, SendError>> {
        let (parts, body) = request.into_parts();
        let headers = parts
            .headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_owned(),
                    value.to_str().unwrap_or_default().to_owned(),
                )
            })
            .collect();
        self.captured
            .lock()
            .expect("lock captured")
            .push(CapturedRequest {
                method: parts.method.to_string(),
                uri: parts.uri.to_string(),
                headers,
                body,
            });

        let step = self
            .steps
            .lock()
            .expect("lock steps")
            .pop_front()
            .unwrap_or_else(|| Step::json(200, "{}"));
        async move {
            match step {
                Step::Reply {
                    status,
                    content_type,
                    body,
                } => Ok(reply(status, content_type, body)),
                Step::Stall(delay) => {
                    tokio::time::sleep(delay).await;
                    Ok(reply(200, Some("application/json"), "{}"))
                }
                Step::Fail(kind) => Err(SendError::transport(kind, "scripted failure")),
            }
        }
        .boxed()
    }
}

#[derive(Default)]
struct CountingTrigger {
    fired: AtomicUsize,
}

impl CountingTrigger {
    fn fired(&self) -> usize {
        self.fired.load(Ordering::SeqCst)
    }
}

impl LoginTrigger for CountingTrigger {
    fn trigger_login(&self) {
        self.fired.fetch_add(1, Ordering::SeqCst);
    }
}

fn client_with(sender: Arc<ScriptedSender>) -> Client {
    Client::builder()
        .client_name("reqlane-test")
        .http_sender(sender)
        .build()
}

fn logged_in_client(sender: Arc<ScriptedSender>) -> (Client, AuthSession, Arc<CountingTrigger>) {
    let trigger = Arc::new(CountingTrigger::default());
    let session = AuthSession::new(trigger.clone());
    session.set_credentials("stale", "1000");
    let client = Client::builder()
        .client_name("reqlane-test")
        .http_sender(sender)
        .session(session.clone())
        .build();
    (client, session, trigger)
}

fn authed_config() -> RequestConfig {
    let mut config = RequestConfig::get().requires_auth(true);
    config.add_auth_hint("AuthToken", "{token}");
    config
}

// Lets spawned dispatch tasks run until they block on the relogin handshake.
async fn settle_tasks() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

#[test]
fn error_code_maps_expected_variant() {
    let error = Error::InvalidUri {
        uri: "bad://uri".to_owned(),
    };
    assert_eq!(error.code(), ErrorCode::InvalidUri);
    assert_eq!(error.code().as_str(), "invalid_uri");
}

#[test]
fn error_code_contract_table_is_stable() {
    let names: Vec<&str> = ErrorCode::all().iter().map(|code| code.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "invalid_endpoint",
            "invalid_uri",
            "invalid_header_name",
            "invalid_header_value",
            "request_build",
            "serialize_json",
            "network",
            "timeout",
            "response_body_too_large",
            "http_status",
            "deserialize",
            "auth_retry_exhausted",
            "dispatch_aborted",
            "tls_backend_init",
        ]
    );

    let unique: BTreeSet<&str> = names.iter().copied().collect();
    assert_eq!(unique.len(), names.len());
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn equivalent_requests_share_one_dispatch() {
    let sender = ScriptedSender::new(vec![Step::json(200, r#"{"id":1}"#)]);
    let client = client_with(sender.clone());

    let first = client.enqueue(ENDPOINT, RequestConfig::get(), 0);
    let second = client.enqueue(ENDPOINT, RequestConfig::get(), 0);
    assert!(first.same_dispatch(&second));
    assert_eq!(client.pending_count(), 1);

    let (first, second) = tokio::join!(first, second);
    let first = first.expect("first request should succeed");
    let second = second.expect("second request should succeed");
    assert_eq!(first.data(), &json!({"id": 1}));
    assert_eq!(second.data(), first.data());
    assert_eq!(sender.request_count(), 1);
    assert_eq!(client.pending_count(), 0);

    let metrics = client.metrics_snapshot();
    assert_eq!(metrics.requests_enqueued, 2);
    assert_eq!(metrics.dedup_hits, 1);
    assert_eq!(metrics.dispatches, 1);
    assert_eq!(metrics.requests_succeeded, 1);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn settled_request_is_dispatched_again_after_auto_dequeue() {
    let sender = ScriptedSender::new(Vec::new());
    let client = client_with(sender.clone());

    client
        .enqueue(ENDPOINT, RequestConfig::get(), 0)
        .await
        .expect("first request should succeed");
    client
        .enqueue(ENDPOINT, RequestConfig::get(), 0)
        .await
        .expect("second request should succeed");
    assert_eq!(sender.request_count(), 2);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn any_difference_produces_an_independent_dispatch() {
    let sender = ScriptedSender::new(Vec::new());
    let client = client_with(sender.clone());

    let base = RequestConfig::get().header("Accept", "application/json");
    let other_header = RequestConfig::get().header("Accept", "application/xml");
    let mut other_parameter = base.clone();
    other_parameter.add_parameter("id", "7");
    let mut other_append = base.clone();
    other_append.append_parameter("page", "2");
    let mut other_body = base.clone();
    other_body.add_body("payload");
    let reordered = RequestConfig::get()
        .header("X-B", "2")
        .header("X-A", "1");
    let ordered = RequestConfig::get()
        .header("X-A", "1")
        .header("X-B", "2");

    let pending = vec![
        client.enqueue(ENDPOINT, base.clone(), 0),
        client.enqueue(ENDPOINT, other_header, 0),
        client.enqueue(ENDPOINT, other_parameter, 0),
        client.enqueue(ENDPOINT, other_append, 0),
        client.enqueue(ENDPOINT, other_body, 0),
        client.enqueue(ENDPOINT, base, 1),
        client.enqueue(ENDPOINT, ordered, 0),
        client.enqueue(ENDPOINT, reordered, 0),
    ];
    assert_eq!(client.pending_count(), 8);

    for result in futures_util::future::join_all(pending).await {
        result.expect("request should succeed");
    }
    assert_eq!(sender.request_count(), 8);
    assert_eq!(client.metrics_snapshot().dedup_hits, 0);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn manual_dequeue_keeps_settled_result_until_removed() {
    let sender = ScriptedSender::new(vec![
        Step::json(200, r#"{"generation":1}"#),
        Step::json(200, r#"{"generation":2}"#),
    ]);
    let client = client_with(sender.clone());
    let config = || RequestConfig::get().auto_dequeue(false);

    let first = client.enqueue(ENDPOINT, config(), 0);
    let settled = first.clone().await.expect("first request should succeed");
    assert_eq!(settled.data(), &json!({"generation": 1}));
    assert_eq!(client.pending_count(), 1);

    let reused = client.enqueue(ENDPOINT, config(), 0);
    assert!(reused.same_dispatch(&first));
    assert!(reused.peek().is_some());
    let reused = reused.await.expect("reused request should succeed");
    assert_eq!(reused.data(), &json!({"generation": 1}));
    assert_eq!(sender.request_count(), 1);

    assert!(client.dequeue(&first));
    assert!(!client.dequeue(&first));
    assert_eq!(client.pending_count(), 0);

    let fresh = client
        .enqueue(ENDPOINT, config(), 0)
        .await
        .expect("fresh request should succeed");
    assert_eq!(fresh.data(), &json!({"generation": 2}));
    assert_eq!(sender.request_count(), 2);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn empty_endpoint_fails_without_network_call() {
    let sender = ScriptedSender::new(Vec::new());
    let client = client_with(sender.clone());

    let error = client
        .enqueue("  ", RequestConfig::get(), 0)
        .await
        .expect_err("empty endpoint should fail");
    assert_eq!(error.code(), ErrorCode::InvalidEndpoint);
    assert_eq!(sender.request_count(), 0);
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn endpoint_is_resolved_before_dispatch() {
    let sender = ScriptedSender::new(Vec::new());
    let client = client_with(sender.clone());

    let mut config = RequestConfig::post();
    config.add_parameter("productId", "1234");
    config.append_parameter("locale", "en_US");
    config
        .add_json_body(&json!({"quantity": 1}))
        .expect("serialize body");
    client
        .enqueue("https://api{num}.x.origin.com/offer/{productId}", config, 0)
        .await
        .expect("request should succeed");

    let captured = sender.captured();
    assert_eq!(captured.len(), 1);
    assert_eq!(captured[0].method, "POST");
    assert_eq!(
        captured[0].uri,
        "https://api4.x.origin.com/offer/1234?locale=en_US"
    );
    assert_eq!(captured[0].body, Bytes::from_static(br#"{"quantity":1}"#));
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn accepted_status_is_success_and_other_statuses_fail_with_body() {
    let sender = ScriptedSender::new(vec![
        Step::empty(202),
        Step::json(404, r#"{"error":"not_found"}"#),
    ]);
    let client = client_with(sender.clone());

    let accepted = client
        .enqueue(ENDPOINT, RequestConfig::put(), 0)
        .await
        .expect("202 should be a success");
    assert_eq!(accepted.status(), StatusCode::ACCEPTED);
    assert!(accepted.data().is_null());

    let error = client
        .enqueue(ENDPOINT, RequestConfig::get(), 0)
        .await
        .expect_err("404 should fail");
    assert_eq!(error.code(), ErrorCode::HttpStatus);
    assert_eq!(error.status(), Some(404));
    assert_eq!(error.body(), Some(&json!({"error": "not_found"})));
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn response_headers_are_kept_only_on_request() {
    let sender = ScriptedSender::new(vec![Step::json(200, "{}"), Step::json(200, "{}")]);
    let client = client_with(sender);

    let without = client
        .enqueue(ENDPOINT, RequestConfig::get(), 0)
        .await
        .expect("request should succeed");
    assert!(without.headers().is_none());

    let with = client
        .enqueue(ENDPOINT, RequestConfig::get().response_header(true), 0)
        .await
        .expect("request should succeed");
    let content_type = with
        .headers()
        .and_then(|headers| headers.get("content-type"))
        .and_then(|value| value.to_str().ok());
    assert_eq!(content_type, Some("application/json"));
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn xml_content_type_is_normalized_to_json() {
    let sender = ScriptedSender::new(vec![Step::Reply {
        status: 200,
        content_type: Some("application/xml; charset=utf-8"),
        body: r#"<offer id="7"><name>Game</name></offer>"#,
    }]);
    let client = client_with(sender);

    let response = client
        .enqueue(ENDPOINT, RequestConfig::get(), 0)
        .await
        .expect("request should succeed");
    assert_eq!(
        response.data(),
        &json!({"offer": {"_id": "7", "name": "Game"}})
    );
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn request_times_out_after_thirty_seconds() {
    let sender = ScriptedSender::new(vec![
        Step::Stall(Duration::from_secs(29)),
        Step::Stall(Duration::from_secs(31)),
    ]);
    let client = client_with(sender);
    assert_eq!(client.request_timeout(), Duration::from_secs(30));

    client
        .enqueue(ENDPOINT, RequestConfig::get(), 0)
        .await
        .expect("29 seconds is within the timeout");

    let error = client
        .enqueue(ENDPOINT, RequestConfig::get(), 0)
        .await
        .expect_err("31 seconds should time out");
    assert!(error.is_timeout());
    match error {
        Error::Timeout { timeout_ms, .. } => assert_eq!(timeout_ms, 30_000),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(client.metrics_snapshot().timeouts, 1);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn network_failure_is_distinct_from_timeout() {
    let sender = ScriptedSender::new(vec![Step::Fail(TransportErrorKind::Connect)]);
    let client = client_with(sender);

    let error = client
        .enqueue(ENDPOINT, RequestConfig::get(), 0)
        .await
        .expect_err("connect failure should fail");
    assert!(error.is_network());
    assert!(!error.is_timeout());
    match error {
        Error::Network { kind, .. } => assert_eq!(kind, TransportErrorKind::Connect),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn healable_failure_triggers_one_relogin_and_replays_with_fresh_token() {
    let sender = ScriptedSender::new(vec![
        Step::json(401, INVALID_TOKEN_BODY),
        Step::json(200, r#"{"owned":true}"#),
    ]);
    let (client, session, trigger) = logged_in_client(sender.clone());

    let pending = client.enqueue(ENDPOINT, authed_config(), 0);
    settle_tasks().await;
    assert_eq!(trigger.fired(), 1);
    assert!(session.relogin_in_flight());

    session.login_succeeded("fresh");
    let response = pending.await.expect("replay should succeed");
    assert_eq!(response.data(), &json!({"owned": true}));

    let captured = sender.captured();
    assert_eq!(captured.len(), 2);
    assert_eq!(captured[0].header("AuthToken"), Some("stale"));
    assert_eq!(captured[1].header("AuthToken"), Some("fresh"));
    assert_eq!(trigger.fired(), 1);

    let metrics = client.metrics_snapshot();
    assert_eq!(metrics.relogins_triggered, 1);
    assert_eq!(metrics.replays, 1);
    assert_eq!(metrics.dispatches, 2);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn logged_out_session_propagates_original_failure() {
    let sender = ScriptedSender::new(vec![Step::json(401, INVALID_TOKEN_BODY)]);
    let (client, session, trigger) = logged_in_client(sender.clone());
    session.clear_credentials();

    let error = client
        .enqueue(ENDPOINT, authed_config(), 0)
        .await
        .expect_err("logged out failure should propagate");
    assert_eq!(error.code(), ErrorCode::HttpStatus);
    assert_eq!(error.status(), Some(401));
    assert_eq!(
        error.body(),
        Some(&json!({"failure": {"cause": "INVALID_VALUE", "field": "AuthToken"}}))
    );
    assert_eq!(trigger.fired(), 0);
    assert_eq!(sender.request_count(), 1);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn dont_relogin_propagates_original_failure() {
    let sender = ScriptedSender::new(vec![Step::json(401, INVALID_TOKEN_BODY)]);
    let (client, _session, trigger) = logged_in_client(sender.clone());

    let error = client
        .enqueue(ENDPOINT, authed_config().dont_relogin(true), 0)
        .await
        .expect_err("failure should propagate");
    assert_eq!(error.status(), Some(401));
    assert_eq!(trigger.fired(), 0);
    assert_eq!(sender.request_count(), 1);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn permanent_authorization_failure_never_triggers_relogin() {
    let sender = ScriptedSender::new(vec![Step::json(
        403,
        r#"{"failure":{"cause":"NOT_OWNED","field":"offerId"}}"#,
    )]);
    let (client, _session, trigger) = logged_in_client(sender.clone());

    let error = client
        .enqueue(ENDPOINT, authed_config(), 0)
        .await
        .expect_err("ownership failure should propagate");
    assert_eq!(error.status(), Some(403));
    assert_eq!(trigger.fired(), 0);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn empty_403_is_healed_by_relogin() {
    let sender = ScriptedSender::new(vec![Step::empty(403), Step::json(200, r#"{"ok":1}"#)]);
    let (client, session, trigger) = logged_in_client(sender.clone());

    let pending = client.enqueue(ENDPOINT, authed_config(), 0);
    settle_tasks().await;
    assert_eq!(trigger.fired(), 1);
    session.login_succeeded("fresh");

    let response = pending.await.expect("replay should succeed");
    assert_eq!(response.data(), &json!({"ok": 1}));
    assert_eq!(sender.request_count(), 2);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn failed_login_rejects_with_auth_retry_exhausted() {
    let sender = ScriptedSender::new(vec![Step::json(401, INVALID_TOKEN_BODY)]);
    let (client, session, trigger) = logged_in_client(sender.clone());

    let pending = client.enqueue(ENDPOINT, authed_config(), 0);
    settle_tasks().await;
    assert_eq!(trigger.fired(), 1);
    session.login_failed();

    let error = pending.await.expect_err("failed login should reject");
    assert_eq!(error.code(), ErrorCode::AuthRetryExhausted);
    assert_eq!(error.status(), Some(401));
    assert_eq!(sender.request_count(), 1);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn concurrent_healable_failures_share_one_relogin() {
    let sender = ScriptedSender::new(vec![
        Step::json(401, INVALID_TOKEN_BODY),
        Step::json(401, INVALID_TOKEN_BODY),
        Step::json(200, r#"{"n":1}"#),
        Step::json(200, r#"{"n":1}"#),
    ]);
    let (client, session, trigger) = logged_in_client(sender.clone());

    let first = client.enqueue(ENDPOINT, authed_config(), 0);
    let second = client.enqueue("https://api.origin.test/v1/other", authed_config(), 0);
    assert!(!first.same_dispatch(&second));
    settle_tasks().await;
    assert_eq!(trigger.fired(), 1);

    session.login_succeeded("fresh");
    let (first, second) = tokio::join!(first, second);
    first.expect("first replay should succeed");
    second.expect("second replay should succeed");

    let captured = sender.captured();
    assert_eq!(captured.len(), 4);
    assert!(
        captured[2..]
            .iter()
            .all(|request| request.header("AuthToken") == Some("fresh"))
    );
    assert_eq!(trigger.fired(), 1);

    let metrics = client.metrics_snapshot();
    assert_eq!(metrics.relogins_triggered, 1);
    assert_eq!(metrics.relogins_coalesced, 1);
    assert_eq!(metrics.replays, 2);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn replay_outcome_is_final() {
    let sender = ScriptedSender::new(vec![
        Step::json(401, INVALID_TOKEN_BODY),
        Step::json(401, INVALID_TOKEN_BODY),
    ]);
    let (client, session, trigger) = logged_in_client(sender.clone());

    let pending = client.enqueue(ENDPOINT, authed_config(), 0);
    settle_tasks().await;
    session.login_succeeded("fresh");

    let error = pending.await.expect_err("replay failure should be final");
    assert_eq!(error.code(), ErrorCode::HttpStatus);
    assert_eq!(error.status(), Some(401));
    assert_eq!(sender.request_count(), 2);
    assert_eq!(trigger.fired(), 1);
    assert!(!session.relogin_in_flight());
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn timeout_never_triggers_relogin() {
    let sender = ScriptedSender::new(vec![Step::Stall(Duration::from_secs(45))]);
    let (client, _session, trigger) = logged_in_client(sender);

    let error = client
        .enqueue(ENDPOINT, authed_config(), 0)
        .await
        .expect_err("stalled request should time out");
    assert!(error.is_timeout());
    assert_eq!(trigger.fired(), 0);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn user_scoped_request_without_auth_header_gets_no_token() {
    let sender = ScriptedSender::new(Vec::new());
    let (client, _session, _trigger) = logged_in_client(sender.clone());

    client
        .enqueue(ENDPOINT, RequestConfig::get().requires_user(true), 0)
        .await
        .expect("request should succeed");
    let captured = sender.captured();
    assert_eq!(captured[0].header("AuthToken"), None);
    assert_eq!(captured[0].header("authorization"), None);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn add_header_is_skipped_while_offline() {
    let sender = ScriptedSender::new(Vec::new());
    let client = client_with(sender);
    let mut config = RequestConfig::get();

    client.session().set_online(false);
    client.add_header(&mut config, "X-Origin-Platform", "PCWIN");
    assert!(config.headers().is_empty());

    client.session().set_online(true);
    client.add_header(&mut config, "X-Origin-Platform", "PCWIN");
    assert_eq!(
        config.headers(),
        &[("X-Origin-Platform".to_owned(), "PCWIN".to_owned())]
    );
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn metrics_can_be_disabled() {
    let sender = ScriptedSender::new(Vec::new());
    let client = Client::builder()
        .http_sender(sender)
        .metrics_enabled(false)
        .build();

    client
        .enqueue(ENDPOINT, RequestConfig::get(), 0)
        .await
        .expect("request should succeed");
    let metrics = client.metrics_snapshot();
    assert_eq!(metrics.requests_enqueued, 0);
    assert_eq!(metrics.dispatches, 0);
}
