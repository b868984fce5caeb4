//! Built-in action handlers.
//!
//! - `http`: one HTTP request per invocation. Params:
//!   `{ "url": "...", "method": "POST", "headers": {..}, "body": <json> }`.
//!   `{{ field }}` placeholders in the URL resolve against the context.
//!   Output is `{ "status": u16, "body": <json or string> }`.
//! - `echo`: returns its params with an `echoed_at` timestamp. Useful for
//!   wiring tests and for seeding context values.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use stepwise_core::workflow::context::resolve_template;
use stepwise_core::workflow::handler::{ActionError, ActionHandler};

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct HttpParams {
    url: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    body: Option<Value>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// Performs an HTTP request described by the step params.
///
/// Network errors and 5xx responses (plus 408/429) are reported as
/// retryable failures; other 4xx responses as invalid parameters.
#[derive(Debug, Clone)]
pub struct HttpHandler {
    client: reqwest::Client,
}

impl HttpHandler {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("stepwise/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl ActionHandler for HttpHandler {
    fn name(&self) -> &str {
        "http"
    }

    async fn invoke(&self, params: &Value, context: &Map<String, Value>) -> Result<Value, ActionError> {
        let params: HttpParams = serde_json::from_value(params.clone())
            .map_err(|e| ActionError::InvalidParams(e.to_string()))?;
        let method: reqwest::Method = params
            .method
            .to_uppercase()
            .parse()
            .map_err(|_| ActionError::InvalidParams(format!("invalid HTTP method: {}", params.method)))?;
        let url = resolve_template(&params.url, context);

        let mut request = self.client.request(method, &url);
        for (key, value) in &params.headers {
            request = request.header(key.as_str(), value.as_str());
        }
        if let Some(body) = &params.body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ActionError::Failed(format!("HTTP request to '{url}' failed: {e}")))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ActionError::Failed(format!("failed to read HTTP response body: {e}")))?;

        tracing::debug!(url = url.as_str(), status = status.as_u16(), body_len = text.len(), "HTTP action completed");

        if !status.is_success() {
            let message = format!("'{url}' responded {status}");
            let retryable = status.is_server_error()
                || status == reqwest::StatusCode::REQUEST_TIMEOUT
                || status == reqwest::StatusCode::TOO_MANY_REQUESTS;
            return Err(if retryable {
                ActionError::Failed(message)
            } else {
                ActionError::InvalidParams(message)
            });
        }

        let body = serde_json::from_str(&text).unwrap_or(Value::String(text));
        Ok(json!({
            "status": status.as_u16(),
            "body": body,
        }))
    }
}

// ---------------------------------------------------------------------------
// Echo
// ---------------------------------------------------------------------------

/// Returns its params, stamped with `echoed_at`. Non-object params are
/// wrapped as `{ "value": params }`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoHandler;

impl ActionHandler for EchoHandler {
    fn name(&self) -> &str {
        "echo"
    }

    async fn invoke(&self, params: &Value, _context: &Map<String, Value>) -> Result<Value, ActionError> {
        let mut output = match params {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other.clone());
                map
            }
        };
        output.insert("echoed_at".to_string(), Value::String(Utc::now().to_rfc3339()));
        Ok(Value::Object(output))
    }
}
