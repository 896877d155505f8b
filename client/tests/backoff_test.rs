//! Adaptive batch-size backoff under payload-size rejection.
//!
//! A 413 response halves the upload window and retries immediately; at
//! window size 1 the oversized event itself is dropped so the queue can
//! never stall behind it.

use std::time::Duration;

use beacon_client::config::Config;
use beacon_client::TelemetryClient;
use serde_json::Value;
use tempfile::TempDir;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

// =============================================================================
// Test Helpers
// =============================================================================

fn test_config(server_url: &str, dir: &TempDir) -> Config {
    Config::new(server_url, "test-api-key", dir.path().join("events.db"))
        .with_upload_threshold(100)
        .with_max_batch_size(8)
        .with_upload_period(Duration::from_secs(3600))
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3])
                    .ok()
                    .and_then(|h| u8::from_str_radix(h, 16).ok());
                match hex {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(bytes[i]);
                        i += 1;
                    }
                }
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Extracts the uploaded event array from a form-encoded request.
fn uploaded_events(request: &wiremock::Request) -> Vec<Value> {
    let body = String::from_utf8(request.body.clone()).unwrap();
    let events = body
        .split('&')
        .find_map(|pair| pair.strip_prefix("e="))
        .expect("missing form field: e");
    serde_json::from_str(&percent_decode(events)).unwrap()
}

// =============================================================================
// Backoff Tests
// =============================================================================

#[tokio::test]
async fn persistent_413_halves_the_window_then_drops_event_by_event() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(413))
        .mount(&mock_server)
        .await;

    let dir = TempDir::new().unwrap();
    let client = TelemetryClient::new(test_config(&mock_server.uri(), &dir)).unwrap();

    for i in 0..8 {
        client.log_event(&format!("event-{i}")).await.unwrap();
    }
    client.flush().await.unwrap();

    // 8 -> 4 -> 2 -> 1, then each further 413 at window 1 drops one event
    // until the queue drains.
    let requests = mock_server.received_requests().await.unwrap();
    let sizes: Vec<usize> = requests.iter().map(|r| uploaded_events(r).len()).collect();
    assert_eq!(sizes, vec![8, 4, 2, 1, 1, 1, 1, 1, 1, 1, 1]);
    assert_eq!(client.pending_events().await.unwrap(), 0);
}

#[tokio::test]
async fn window_recovers_after_a_successful_upload() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(413))
        .up_to_n_times(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("success"))
        .mount(&mock_server)
        .await;

    let dir = TempDir::new().unwrap();
    let client = TelemetryClient::new(test_config(&mock_server.uri(), &dir)).unwrap();

    for i in 0..8 {
        client.log_event(&format!("event-{i}")).await.unwrap();
    }

    // First flush: 413 on the full batch, then success on the halved one.
    client.flush().await.unwrap();
    assert_eq!(client.pending_events().await.unwrap(), 4);

    // The backoff cleared with the success, so the rest goes out in one
    // full-window batch.
    client.flush().await.unwrap();
    assert_eq!(client.pending_events().await.unwrap(), 0);

    let requests = mock_server.received_requests().await.unwrap();
    let sizes: Vec<usize> = requests.iter().map(|r| uploaded_events(r).len()).collect();
    assert_eq!(sizes, vec![8, 4, 4]);
}
