use reqwest::Client;
use std::time::Duration;

/// Shared client builder for every outbound collaborator (LINE content API,
/// vision gateway, document store). The request timeout bounds how long a
/// hung upstream can hold a webhook task open; it surfaces to callers as
/// their own fetch/extraction/store error.
pub fn build_client() -> Client {
    let timeout = std::env::var("HTTP_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(15);
    let connect = std::env::var("HTTP_CONNECT_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(5);
    Client::builder()
        .timeout(Duration::from_secs(timeout))
        .connect_timeout(Duration::from_secs(connect))
        .build()
        .unwrap_or_else(|_| Client::new())
}
