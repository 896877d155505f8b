//! Batch upload over HTTP.
//!
//! A batch is posted as a form-encoded body carrying the protocol version,
//! the API key, the serialized event array, the send time, and an MD5
//! checksum over those fields. The checksum lets the server detect requests
//! mangled in transit; it is corruption evidence, not authentication.
//!
//! The server replies with one of a small set of literal body strings (or an
//! HTTP 413 for oversized payloads). [`Uploader::upload`] maps every reply
//! and every transport failure into an [`UploadOutcome`]; it never returns
//! an error, because outcome handling is scheduler state, not control flow.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use tracing::debug;

/// Ingestion protocol version sent as the `v` form field.
pub const API_VERSION: u32 = 2;

/// HTTP request timeout.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Server verdict on one upload attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// The server persisted the batch.
    Success,
    /// The API key was rejected; retrying cannot succeed until it changes.
    InvalidApiKey,
    /// The request arrived corrupted; the batch stays queued for later.
    BadChecksum,
    /// The server could not persist the batch; it stays queued for later.
    ServerStoreFailed,
    /// HTTP 413: the request body exceeded the server's size limit.
    PayloadTooLarge,
    /// Transport failure or an unrecognized response body.
    Failed(String),
}

/// Serializes, checksums and posts event batches.
#[derive(Clone)]
pub struct Uploader {
    client: Client,
    server_url: String,
    api_key: String,
}

impl Uploader {
    /// Creates an uploader with a pooled HTTP client.
    #[must_use]
    pub fn new(server_url: String, api_key: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .pool_max_idle_per_host(2)
            .build()
            .expect("failed to create HTTP client");

        Self {
            client,
            server_url,
            api_key,
        }
    }

    /// Posts one serialized batch and interprets the server's reply.
    ///
    /// `events_json` is the JSON array of event objects; `upload_time` is
    /// the send timestamp in epoch milliseconds.
    pub async fn upload(&self, events_json: &str, upload_time: i64) -> UploadOutcome {
        let version = API_VERSION.to_string();
        let upload_time = upload_time.to_string();
        let digest = checksum(&version, &self.api_key, events_json, &upload_time);

        let form = [
            ("v", version.as_str()),
            ("client", self.api_key.as_str()),
            ("e", events_json),
            ("upload_time", upload_time.as_str()),
            ("checksum", digest.as_str()),
        ];

        debug!(
            url = %self.server_url,
            bytes = events_json.len(),
            "posting event batch"
        );

        let result = self.client.post(&self.server_url).form(&form).send().await;

        match result {
            Ok(response) => {
                if response.status() == StatusCode::PAYLOAD_TOO_LARGE {
                    return UploadOutcome::PayloadTooLarge;
                }

                match response.text().await {
                    Ok(body) => match body.as_str() {
                        "success" => UploadOutcome::Success,
                        "invalid_api_key" => UploadOutcome::InvalidApiKey,
                        "bad_checksum" => UploadOutcome::BadChecksum,
                        "request_db_write_failed" => UploadOutcome::ServerStoreFailed,
                        other => UploadOutcome::Failed(format!("unexpected response: {other}")),
                    },
                    Err(error) => {
                        UploadOutcome::Failed(format!("failed to read response body: {error}"))
                    }
                }
            }
            Err(error) => UploadOutcome::Failed(error.to_string()),
        }
    }
}

/// Computes the lowercase hex MD5 digest over the concatenated form fields.
#[must_use]
pub fn checksum(version: &str, api_key: &str, events_json: &str, upload_time: &str) -> String {
    let preimage = format!("{version}{api_key}{events_json}{upload_time}");
    format!("{:x}", md5::compute(preimage.as_bytes()))
}
