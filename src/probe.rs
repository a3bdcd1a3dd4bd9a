//! RequestProbe: replays an ad-hoc request through the gateway's own public route.
//!
//! Used for exploratory checks from the control API and the CLI. Any HTTP
//! status is a successful probe; only transport failures are errors.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("invalid method '{0}'")]
    InvalidMethod(String),

    #[error("invalid header '{0}'")]
    InvalidHeader(String),

    #[error("probe request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_endpoint() -> String {
    "/".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeRequest {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    /// JSON when the body parses as JSON, otherwise the raw text.
    pub data: Value,
}

pub struct RequestProbe {
    client: reqwest::Client,
    self_base_url: String,
}

impl RequestProbe {
    pub fn new(self_base_url: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            self_base_url: self_base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn target_url(&self, service_name: &str, endpoint: &str) -> String {
        let endpoint = endpoint.trim();
        let sep = if endpoint.starts_with('/') { "" } else { "/" };
        format!(
            "{}/services/{}{}{}",
            self.self_base_url, service_name, sep, endpoint
        )
    }

    pub async fn send(
        &self,
        service_name: &str,
        req: &ProbeRequest,
    ) -> Result<ProbeResponse, ProbeError> {
        let method = reqwest::Method::from_bytes(req.method.trim().to_ascii_uppercase().as_bytes())
            .map_err(|_| ProbeError::InvalidMethod(req.method.clone()))?;
        let url = self.target_url(service_name, &req.endpoint);

        let mut builder = self.client.request(method.clone(), &url);
        for (name, value) in &req.headers {
            let name = reqwest::header::HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| ProbeError::InvalidHeader(name.clone()))?;
            let value = reqwest::header::HeaderValue::from_str(value)
                .map_err(|_| ProbeError::InvalidHeader(name.to_string()))?;
            builder = builder.header(name, value);
        }

        let sends_body = matches!(
            method,
            reqwest::Method::POST | reqwest::Method::PUT | reqwest::Method::PATCH
        );
        if sends_body {
            if let Some(body) = &req.body {
                builder = builder.json(body);
            }
        }

        tracing::debug!(%method, url = %url, "probing service");
        let resp = builder.send().await?;

        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();
        let text = resp.text().await?;
        let data = serde_json::from_str(&text).unwrap_or(Value::String(text));

        Ok(ProbeResponse {
            status,
            headers,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_target_url_goes_through_gateway() {
        let probe = RequestProbe::new("http://127.0.0.1:4000/", Duration::from_secs(1)).unwrap();
        assert_eq!(
            probe.target_url("suma-1", "/api/suma?num1=5"),
            "http://127.0.0.1:4000/services/suma-1/api/suma?num1=5"
        );
        assert_eq!(
            probe.target_url("suma-1", "health"),
            "http://127.0.0.1:4000/services/suma-1/health"
        );
    }

    #[tokio::test]
    async fn test_non_2xx_is_returned_verbatim() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/services/suma-1/missing"))
            .respond_with(ResponseTemplate::new(404).set_body_string("Cannot GET /missing"))
            .mount(&server)
            .await;

        let probe = RequestProbe::new(&server.uri(), Duration::from_secs(5)).unwrap();
        let req = ProbeRequest {
            endpoint: "/missing".into(),
            method: "get".into(),
            headers: BTreeMap::new(),
            body: None,
        };
        let resp = probe.send("suma-1", &req).await.unwrap();
        assert_eq!(resp.status, 404);
        assert_eq!(resp.data, Value::String("Cannot GET /missing".into()));
    }

    #[tokio::test]
    async fn test_post_sends_json_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/services/suma-1/api/suma"))
            .and(body_json(serde_json::json!({"num1": 2, "num2": 3})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"success": true, "resultado": 5})),
            )
            .mount(&server)
            .await;

        let probe = RequestProbe::new(&server.uri(), Duration::from_secs(5)).unwrap();
        let req = ProbeRequest {
            endpoint: "/api/suma".into(),
            method: "POST".into(),
            headers: BTreeMap::new(),
            body: Some(serde_json::json!({"num1": 2, "num2": 3})),
        };
        let resp = probe.send("suma-1", &req).await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.data["resultado"], 5);
    }

    #[tokio::test]
    async fn test_get_ignores_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/services/suma-1/api/suma"))
            .and(query_param("num1", "5"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let probe = RequestProbe::new(&server.uri(), Duration::from_secs(5)).unwrap();
        let req = ProbeRequest {
            endpoint: "/api/suma?num1=5".into(),
            method: "GET".into(),
            headers: BTreeMap::from([("x-trace".to_string(), "1".to_string())]),
            body: Some(serde_json::json!({"ignored": true})),
        };
        let resp = probe.send("suma-1", &req).await.unwrap();
        assert_eq!(resp.status, 200);
    }

    #[test]
    fn test_request_defaults() {
        let req: ProbeRequest = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.endpoint, "/");
    }
}
