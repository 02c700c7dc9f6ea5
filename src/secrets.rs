//! Secrets endpoint client
//!
//! Fetches the encryption master key from a Vault-style HTTP endpoint at
//! build time: `GET {vault_addr}/{secret_path}` with the token in an
//! `X-Vault-Token` header. The reply is JSON carrying the key in a nested
//! `"key"` field (Vault KV v2 nests it under `data.data`); the field is
//! located by a recursive search so either nesting depth works.

use thiserror::Error;

/// Secrets fetch errors. All of them are fatal to layer initialization.
#[derive(Debug, Error)]
pub enum SecretsError {
    #[error("Secrets request to {url} failed: {source}")]
    Request {
        url: String,
        source: reqwest::Error,
    },

    #[error("Secrets endpoint {url} answered HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("Secrets response from {url} is not valid JSON: {source}")]
    Json {
        url: String,
        source: reqwest::Error,
    },

    #[error("Secrets response from {url} does not contain a \"key\" field")]
    MissingKey { url: String },
}

pub type SecretsResult<T> = Result<T, SecretsError>;

/// Fetch the encryption key from a Vault-style endpoint.
///
/// A leading slash on `secret_path` is tolerated; the request goes to
/// `{vault_addr}/{secret_path}`.
pub fn fetch_key(vault_addr: &str, api_key: &str, secret_path: &str) -> SecretsResult<String> {
    let url = format!(
        "{}/{}",
        vault_addr.trim_end_matches('/'),
        secret_path.trim_start_matches('/')
    );

    log::debug!("[SECRETS] fetching encryption key from {url}");

    let response = reqwest::blocking::Client::new()
        .get(&url)
        .header("X-Vault-Token", api_key)
        .send()
        .map_err(|source| SecretsError::Request {
            url: url.clone(),
            source,
        })?;

    let status = response.status();
    if !status.is_success() {
        return Err(SecretsError::Status {
            url,
            status: status.as_u16(),
        });
    }

    let body: serde_json::Value = response.json().map_err(|source| SecretsError::Json {
        url: url.clone(),
        source,
    })?;

    find_key_field(&body)
        .map(str::to_owned)
        .ok_or(SecretsError::MissingKey { url })
}

/// Depth-first search for the first string-valued `"key"` field.
fn find_key_field(value: &serde_json::Value) -> Option<&str> {
    match value {
        serde_json::Value::Object(map) => {
            if let Some(serde_json::Value::String(key)) = map.get("key") {
                return Some(key);
            }
            map.values().find_map(find_key_field)
        }
        serde_json::Value::Array(items) => items.iter().find_map(find_key_field),
        _ => None,
    }
}
