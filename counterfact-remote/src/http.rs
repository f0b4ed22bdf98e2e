//! Predictor backed by a JSON-over-HTTP model endpoint.
//!
//! Request body: `{"instances": [{"<feature>": <value>, ...}, ...]}`.
//! Response body: `{"predictions": [{"<output>": <value>, ...}, ...]}`, one
//! prediction per instance, in order. Response values are typed against the
//! declared output schema.

use async_trait::async_trait;
use counterfact_core::error::ConfigError;
use counterfact_core::{Instance, OracleError, Output, OutputValue, Predictor, TypedValue, ValueKind};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::debug;

/// One declared model output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSpec {
    pub name: String,
    pub kind: ValueKind,
}

impl OutputSpec {
    pub fn new(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Endpoint settings for [`HttpPredictor`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpPredictorConfig {
    /// Full URL the instances are POSTed to.
    pub endpoint: String,
    /// Environment variable holding a bearer token, if the endpoint needs one.
    #[serde(default)]
    pub api_key_env: Option<String>,
    pub outputs: Vec<OutputSpec>,
}

impl HttpPredictorConfig {
    pub fn new(endpoint: impl Into<String>, outputs: Vec<OutputSpec>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key_env: None,
            outputs,
        }
    }

    pub fn with_api_key_env(mut self, var: impl Into<String>) -> Self {
        self.api_key_env = Some(var.into());
        self
    }
}

/// Calls a remote model over HTTP.
///
/// Timeouts, retries and batching are left to the oracle adapter; this type
/// performs exactly one request per `predict` call.
pub struct HttpPredictor {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    outputs: Vec<OutputSpec>,
}

impl HttpPredictor {
    /// Create a predictor, reading the bearer token from `api_key_env` when set.
    pub fn new(config: &HttpPredictorConfig) -> Result<Self, ConfigError> {
        let api_key = match &config.api_key_env {
            Some(var) => Some(std::env::var(var).map_err(|_| {
                ConfigError::invalid(format!("environment variable '{var}' is not set"))
            })?),
            None => None,
        };
        Self::new_with_key(config, api_key)
    }

    /// Create a predictor with an explicitly provided token.
    pub fn new_with_key(config: &HttpPredictorConfig, api_key: Option<String>) -> Result<Self, ConfigError> {
        if config.endpoint.trim().is_empty() {
            return Err(ConfigError::invalid("predictor endpoint is empty"));
        }
        if config.outputs.is_empty() {
            return Err(ConfigError::invalid("predictor output schema is empty"));
        }
        Ok(Self {
            client: Client::new(),
            endpoint: config.endpoint.clone(),
            api_key,
            outputs: config.outputs.clone(),
        })
    }

    /// Build the JSON request body for a batch.
    pub fn encode_instances(inputs: &[Instance]) -> Value {
        let rows: Vec<Value> = inputs
            .iter()
            .map(|instance| {
                let row: Map<String, Value> = instance
                    .features()
                    .iter()
                    .map(|f| (f.name().to_string(), f.value().to_json()))
                    .collect();
                Value::Object(row)
            })
            .collect();
        json!({ "instances": rows })
    }

    /// Parse a response body into typed outputs.
    pub fn decode_predictions(
        body: &str,
        outputs: &[OutputSpec],
        expected: usize,
    ) -> Result<Vec<Output>, OracleError> {
        let parsed: Value = serde_json::from_str(body)
            .map_err(|e| OracleError::call_failed(format!("Invalid response JSON: {e}")))?;
        let predictions = parsed
            .get("predictions")
            .and_then(Value::as_array)
            .ok_or_else(|| OracleError::call_failed("Response has no 'predictions' array"))?;
        if predictions.len() != expected {
            return Err(OracleError::LengthMismatch {
                expected,
                actual: predictions.len(),
            });
        }

        predictions
            .iter()
            .enumerate()
            .map(|(row, prediction)| {
                let values = outputs
                    .iter()
                    .map(|spec| {
                        let raw = prediction.get(&spec.name).ok_or_else(|| {
                            OracleError::call_failed(format!(
                                "Prediction {row} is missing output '{}'",
                                spec.name
                            ))
                        })?;
                        let value = TypedValue::from_json(spec.kind, raw).map_err(|e| {
                            OracleError::call_failed(format!("Output '{}': {e}", spec.name))
                        })?;
                        Ok(OutputValue::new(spec.name.clone(), value))
                    })
                    .collect::<Result<Vec<_>, OracleError>>()?;
                Ok(Output::new(values))
            })
            .collect()
    }

    /// Map an unsuccessful HTTP status to an oracle error.
    pub fn map_http_error(status: reqwest::StatusCode, body: &str) -> OracleError {
        let message = match status.as_u16() {
            401 | 403 => {
                debug!(body = %body, "Prediction endpoint rejected credentials");
                format!("Authentication failed ({status})")
            }
            429 => format!("Rate limited ({status}): {body}"),
            code if code >= 500 => format!("Server error ({status}): {body}"),
            _ => format!("HTTP {status}: {body}"),
        };
        OracleError::CallFailed { message }
    }
}

#[async_trait]
impl Predictor for HttpPredictor {
    async fn predict(&self, inputs: &[Instance]) -> Result<Vec<Output>, OracleError> {
        let body = Self::encode_instances(inputs);
        debug!(endpoint = %self.endpoint, instances = inputs.len(), "Sending prediction request");

        let mut request = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }
        let response = request
            .send()
            .await
            .map_err(|e| OracleError::call_failed(format!("Request failed: {e}")))?;

        let status = response.status();
        let response_body = response
            .text()
            .await
            .map_err(|e| OracleError::call_failed(format!("Failed to read response body: {e}")))?;
        if !status.is_success() {
            return Err(Self::map_http_error(status, &response_body));
        }
        Self::decode_predictions(&response_body, &self.outputs, inputs.len())
    }

    fn name(&self) -> &str {
        &self.endpoint
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use counterfact_core::Feature;
    use pretty_assertions::assert_eq;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn schema() -> Vec<OutputSpec> {
        vec![
            OutputSpec::new("approved", ValueKind::Boolean),
            OutputSpec::new("score", ValueKind::Numeric),
        ]
    }

    fn applicant(age: i64) -> Instance {
        Instance::new(vec![
            Feature::integer("age", age),
            Feature::categorical("employment", "employed"),
        ])
        .unwrap()
    }

    #[test]
    fn test_encode_instances() {
        let body = HttpPredictor::encode_instances(&[applicant(30), applicant(41)]);
        assert_eq!(
            body,
            json!({"instances": [
                {"age": 30, "employment": "employed"},
                {"age": 41, "employment": "employed"},
            ]})
        );
    }

    #[test]
    fn test_decode_predictions() {
        let body = r#"{"predictions": [{"approved": true, "score": 0.9}, {"approved": false, "score": 0.2, "extra": 1}]}"#;
        let outputs = HttpPredictor::decode_predictions(body, &schema(), 2).unwrap();
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].get("approved").unwrap().value, TypedValue::Boolean(true));
        assert_eq!(outputs[1].get("score").unwrap().value, TypedValue::Numeric(0.2));
        assert!(outputs[1].get("extra").is_none());
    }

    #[test]
    fn test_decode_rejects_bad_responses() {
        let missing = r#"{"predictions": [{"approved": true}]}"#;
        assert!(matches!(
            HttpPredictor::decode_predictions(missing, &schema(), 1),
            Err(OracleError::CallFailed { .. })
        ));

        let mistyped = r#"{"predictions": [{"approved": "yes", "score": 1.0}]}"#;
        assert!(matches!(
            HttpPredictor::decode_predictions(mistyped, &schema(), 1),
            Err(OracleError::CallFailed { .. })
        ));

        let short = r#"{"predictions": []}"#;
        assert_eq!(
            HttpPredictor::decode_predictions(short, &schema(), 3).unwrap_err(),
            OracleError::LengthMismatch {
                expected: 3,
                actual: 0
            }
        );

        assert!(HttpPredictor::decode_predictions("not json", &schema(), 1).is_err());
    }

    #[test]
    fn test_map_http_error() {
        let err = HttpPredictor::map_http_error(reqwest::StatusCode::SERVICE_UNAVAILABLE, "busy");
        assert!(err.to_string().contains("Server error"));
        let err = HttpPredictor::map_http_error(reqwest::StatusCode::UNAUTHORIZED, "secret detail");
        assert!(!err.to_string().contains("secret detail"));
        let err = HttpPredictor::map_http_error(reqwest::StatusCode::BAD_REQUEST, "bad field");
        assert!(err.to_string().contains("bad field"));
    }

    #[test]
    fn test_missing_api_key_env_is_rejected() {
        let config = HttpPredictorConfig::new("http://localhost:1/predict", schema())
            .with_api_key_env("COUNTERFACT_REMOTE_TEST_KEY_THAT_IS_NEVER_SET");
        assert!(HttpPredictor::new(&config).is_err());
        let empty = HttpPredictorConfig::new("http://localhost:1/predict", vec![]);
        assert!(HttpPredictor::new(&empty).is_err());
    }

    /// Serve one canned HTTP response and return the raw request received.
    async fn serve_once(status: &'static str, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/predict", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                raw.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&raw).to_string();
                if let Some(split) = text.find("\r\n\r\n") {
                    let length = text[..split]
                        .lines()
                        .find_map(|l| {
                            let lower = l.to_ascii_lowercase();
                            lower
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                        })
                        .unwrap_or(0);
                    if raw.len() >= split + 4 + length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&raw).to_string()
        });
        (url, handle)
    }

    #[tokio::test]
    async fn test_predict_round_trip_over_http() {
        let (url, server) = serve_once("200 OK", r#"{"predictions": [{"approved": true, "score": 0.75}]}"#).await;
        let config = HttpPredictorConfig::new(url, schema());
        let predictor = HttpPredictor::new_with_key(&config, Some("token-123".into())).unwrap();

        let outputs = predictor.predict(&[applicant(30)]).await.unwrap();
        assert_eq!(outputs[0].get("score").unwrap().value, TypedValue::Numeric(0.75));

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /predict"));
        assert!(request.to_ascii_lowercase().contains("authorization: bearer token-123"));
        assert!(request.contains(r#""employment":"employed""#));
    }

    #[tokio::test]
    async fn test_predict_maps_server_errors() {
        let (url, server) = serve_once("500 Internal Server Error", r#"{"error": "boom"}"#).await;
        let predictor = HttpPredictor::new(&HttpPredictorConfig::new(url, schema())).unwrap();

        let err = predictor.predict(&[applicant(30)]).await.unwrap_err();
        assert!(err.to_string().contains("boom"));
        server.await.unwrap();
    }
}
