//! Integration tests for the retrying HTTP executor
//!
//! Exercises the executor against a local mock server: transient server
//! errors, connect failures, non-retryable statuses, attempt exhaustion,
//! body resubmission, the pre-retry hook, and cancellation.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ledgerkit_client::{ClientError, HttpRetryError, HttpRetryExecutor, HttpRetryOptions};
use ledgerkit_common::BackoffPolicy;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_json, body_string, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fast_executor(max_retries: u32) -> HttpRetryExecutor {
    let options = HttpRetryOptions {
        max_retries,
        policy: BackoffPolicy::builder()
            .initial_delay(Duration::from_millis(1))
            .no_jitter()
            .build()
            .expect("valid policy"),
        ..HttpRetryOptions::default()
    };
    HttpRetryExecutor::new(reqwest::Client::new(), options)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_retries_transient_server_errors() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/accounts"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/accounts"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "acc_1"})))
        .mount(&server)
        .await;

    let executor = fast_executor(3);
    let cancel = CancellationToken::new();
    let url = format!("{}/v1/accounts", server.uri());

    let response = executor
        .execute_request(
            &cancel,
            reqwest::Request::new(reqwest::Method::GET, url.parse().expect("valid url")),
        )
        .await
        .expect("should succeed after retries");

    assert_eq!(response.status.as_u16(), 200);
    let body: serde_json::Value = response.json().expect("valid json");
    assert_eq!(body["id"], "acc_1");
    assert_eq!(server.received_requests().await.expect("requests recorded").len(), 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_client_error_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/accounts"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
        .mount(&server)
        .await;

    let executor = fast_executor(5);
    let cancel = CancellationToken::new();
    let url = format!("{}/v1/accounts", server.uri());

    let result = executor
        .execute_request(
            &cancel,
            reqwest::Request::new(reqwest::Method::GET, url.parse().expect("valid url")),
        )
        .await;

    match result {
        Err(HttpRetryError::NonRetryable { source }) => {
            assert!(matches!(source, ClientError::Validation { .. }));
        }
        other => panic!("expected NonRetryable, got {other:?}"),
    }
    assert_eq!(server.received_requests().await.expect("requests recorded").len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_exhaustion_reports_last_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/accounts"))
        .respond_with(ResponseTemplate::new(503).set_body_string("still down"))
        .mount(&server)
        .await;

    let executor = fast_executor(2);
    let cancel = CancellationToken::new();
    let url = format!("{}/v1/accounts", server.uri());

    let result = executor
        .execute_request(
            &cancel,
            reqwest::Request::new(reqwest::Method::GET, url.parse().expect("valid url")),
        )
        .await;

    match result {
        Err(HttpRetryError::Exhausted { attempts, last_status, source }) => {
            assert_eq!(attempts, 3);
            assert_eq!(last_status, Some(503));
            assert!(matches!(source, ClientError::Internal { status: 503, .. }));
        }
        other => panic!("expected Exhausted, got {other:?}"),
    }
    assert_eq!(server.received_requests().await.expect("requests recorded").len(), 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_post_body_resubmitted_on_retry() {
    let payload = serde_json::json!({"amount": 125, "asset": "USD"});

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/transactions"))
        .and(body_json(&payload))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/transactions"))
        .and(body_json(&payload))
        .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({"id": "txn_9"})))
        .mount(&server)
        .await;

    let client = reqwest::Client::new();
    let executor = fast_executor(3);
    let cancel = CancellationToken::new();

    let request = client
        .post(format!("{}/v1/transactions", server.uri()))
        .json(&payload)
        .build()
        .expect("valid request");

    let response = executor
        .execute_request(&cancel, request)
        .await
        .expect("retry should resend the same body");

    assert_eq!(response.status.as_u16(), 201);
    assert_eq!(server.received_requests().await.expect("requests recorded").len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_retry_hook_observes_failures_and_can_abort() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/accounts"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let hook_calls = Arc::new(AtomicU32::new(0));
    let hook_calls_clone = Arc::clone(&hook_calls);

    let executor = fast_executor(5).on_retry(move |request, prior| {
        let call = hook_calls_clone.fetch_add(1, Ordering::SeqCst) + 1;
        assert_eq!(request.method(), &reqwest::Method::GET);
        assert_eq!(request.url().path(), "/v1/accounts");
        let response = prior.expect("status failure should carry the prior response");
        assert_eq!(response.status.as_u16(), 503);
        if call >= 2 {
            Err(ClientError::Other { message: "giving up from hook".to_string() })
        } else {
            Ok(())
        }
    });

    let cancel = CancellationToken::new();
    let url = format!("{}/v1/accounts", server.uri());
    let result = executor
        .execute_request(
            &cancel,
            reqwest::Request::new(reqwest::Method::GET, url.parse().expect("valid url")),
        )
        .await;

    match result {
        Err(HttpRetryError::HookAborted { source }) => {
            assert!(source.to_string().contains("giving up from hook"));
        }
        other => panic!("expected HookAborted, got {other:?}"),
    }
    // Hook ran before the first and second retries; the abort on the second
    // means only two requests went out.
    assert_eq!(hook_calls.load(Ordering::SeqCst), 2);
    assert_eq!(server.received_requests().await.expect("requests recorded").len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_connect_failure_retried_until_exhaustion() {
    // Port 1 refuses connections, so every attempt fails in the transport
    // before a response exists.
    let executor = fast_executor(2);
    let cancel = CancellationToken::new();
    let url: reqwest::Url = "http://127.0.0.1:1/v1/accounts".parse().expect("valid url");

    let result = executor
        .execute_request(&cancel, reqwest::Request::new(reqwest::Method::GET, url))
        .await;

    match result {
        Err(HttpRetryError::Exhausted { attempts, last_status, source }) => {
            assert_eq!(attempts, 3);
            assert_eq!(last_status, None);
            assert!(matches!(source, ClientError::Network { .. }));
        }
        other => panic!("expected Exhausted, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_hook_sees_no_response_for_transport_failures() {
    let hook_calls = Arc::new(AtomicU32::new(0));
    let hook_calls_clone = Arc::clone(&hook_calls);

    let executor = fast_executor(5).on_retry(move |request, prior| {
        hook_calls_clone.fetch_add(1, Ordering::SeqCst);
        assert_eq!(request.url().path(), "/v1/accounts");
        assert!(prior.is_none(), "transport failures have no prior response");
        Err(ClientError::Other { message: "host unreachable, stopping".to_string() })
    });
    let cancel = CancellationToken::new();
    let url: reqwest::Url = "http://127.0.0.1:1/v1/accounts".parse().expect("valid url");

    let result = executor
        .execute_request(&cancel, reqwest::Request::new(reqwest::Method::GET, url))
        .await;

    match result {
        Err(HttpRetryError::HookAborted { source }) => {
            assert!(source.to_string().contains("host unreachable"));
        }
        other => panic!("expected HookAborted, got {other:?}"),
    }
    assert_eq!(hook_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_streaming_body_sent_on_first_attempt() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/transactions"))
        .and(body_string("streamed-entry"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&server)
        .await;

    // A streamed body cannot be cloned, so only the original request
    // carries it.
    let stream =
        futures_util::stream::iter(vec![Ok::<_, std::io::Error>("streamed-entry")]);
    let url = format!("{}/v1/transactions", server.uri());
    let mut request =
        reqwest::Request::new(reqwest::Method::POST, url.parse().expect("valid url"));
    *request.body_mut() = Some(reqwest::Body::wrap_stream(stream));

    let executor = fast_executor(0);
    let cancel = CancellationToken::new();
    let response = executor
        .execute_request(&cancel, request)
        .await
        .expect("first attempt should carry the streamed body");

    assert_eq!(response.status.as_u16(), 201);
    assert_eq!(server.received_requests().await.expect("requests recorded").len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancellation_interrupts_backoff() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/accounts"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let options = HttpRetryOptions {
        max_retries: 3,
        policy: BackoffPolicy::builder()
            .initial_delay(Duration::from_secs(30))
            .no_jitter()
            .build()
            .expect("valid policy"),
        ..HttpRetryOptions::default()
    };
    let executor = HttpRetryExecutor::new(reqwest::Client::new(), options);
    let cancel = CancellationToken::new();

    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel_clone.cancel();
    });

    let url = format!("{}/v1/accounts", server.uri());
    let result = executor
        .execute_request(
            &cancel,
            reqwest::Request::new(reqwest::Method::GET, url.parse().expect("valid url")),
        )
        .await;

    assert!(matches!(result, Err(HttpRetryError::Cancelled)));
}
