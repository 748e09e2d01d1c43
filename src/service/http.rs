//! HTTP/JSON client for the reference model service.
//!
//! Routes, relative to the service base URL:
//!
//! ```text
//! POST /{name}            {"algorithm", "dimension", "index"}   create model
//! GET  /{name}                                                 describe model
//! PUT  /{name}/training   {"value": [f32; 12]}                  append training sample
//! POST /{name}/training                                        train
//! PUT  /{name}/testing    {"value": [f32; 12]}                  append testing sample, predict
//! ```
//!
//! Every reply carries `"opcode": "success" | "failure"` and, on failure, an
//! optional `"reason"`.

use super::{ModelService, ModelSpec, ServiceError, ServiceResult};
use crate::protocol::{PredictionResult, TelemetrySample, FEATURE_COUNT};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, trace};

/// Connect timeout applied to every call.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Serialize)]
struct CreateModelRequest<'a> {
    algorithm: &'a str,
    dimension: usize,
    index: usize,
}

#[derive(Debug, Serialize)]
struct SampleRequest {
    value: [f32; FEATURE_COUNT],
}

impl From<&TelemetrySample> for SampleRequest {
    fn from(sample: &TelemetrySample) -> Self {
        Self {
            value: sample.features(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Reply {
    opcode: Option<String>,
    reason: Option<String>,
    prediction: Option<serde_json::Value>,
}

impl Reply {
    /// Turn a failure indication into an error.
    fn check(self) -> ServiceResult<Reply> {
        match self.opcode.as_deref() {
            Some("success") => Ok(self),
            Some("failure") => Err(ServiceError::Rejected(
                self.reason.unwrap_or_else(|| "unknown reason".to_string()),
            )),
            Some(other) => Err(ServiceError::Rejected(format!("unexpected opcode '{}'", other))),
            None => Err(ServiceError::Rejected("reply has no opcode".to_string())),
        }
    }

    /// A success reply without a prediction means the model has nothing to
    /// say yet.
    fn prediction(&self) -> ServiceResult<PredictionResult> {
        match &self.prediction {
            None | Some(serde_json::Value::Null) => Ok(PredictionResult::sentinel()),
            Some(value) => value
                .as_f64()
                .map(|v| PredictionResult::valid(v as f32))
                .ok_or_else(|| {
                    ServiceError::Rejected(format!("non-numeric prediction: {}", value))
                }),
        }
    }
}

fn classify(err: reqwest::Error) -> ServiceError {
    if err.is_timeout() {
        ServiceError::Timeout
    } else if err.is_decode() {
        ServiceError::Rejected(err.to_string())
    } else {
        ServiceError::Unreachable(err.to_string())
    }
}

/// Model service reached over HTTP.
///
/// The inner `reqwest::Client` pools connections and is cheap to share, so a
/// single instance serves every connection handler.
pub struct HttpModelService {
    client: Client,
    base_url: String,
    request_timeout: Duration,
    training_timeout: Duration,
}

impl HttpModelService {
    pub fn new(
        base_url: &str,
        request_timeout: Duration,
        training_timeout: Duration,
    ) -> reqwest::Result<Self> {
        let client = Client::builder().connect_timeout(CONNECT_TIMEOUT).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            request_timeout,
            training_timeout,
        })
    }

    fn url(&self, name: &str, resource: Option<&str>) -> String {
        match resource {
            Some(resource) => format!("{}/{}/{}", self.base_url, name, resource),
            None => format!("{}/{}", self.base_url, name),
        }
    }

    async fn call(&self, request: RequestBuilder, timeout: Duration) -> ServiceResult<Reply> {
        let response = request.timeout(timeout).send().await.map_err(classify)?;

        let status = response.status();
        if !status.is_success() {
            return Err(ServiceError::Rejected(format!("HTTP status {}", status)));
        }

        let reply: Reply = response.json().await.map_err(classify)?;
        trace!(?reply, "Model service reply");
        reply.check()
    }

    /// Fetch the service's description of a model. Informational only.
    pub async fn describe_model(&self, name: &str) -> ServiceResult<serde_json::Value> {
        let request = self.client.get(self.url(name, None));
        let response = request
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        if !status.is_success() {
            return Err(ServiceError::Rejected(format!("HTTP status {}", status)));
        }
        response.json().await.map_err(classify)
    }
}

#[async_trait]
impl ModelService for HttpModelService {
    async fn register_model(&self, spec: &ModelSpec) -> ServiceResult<()> {
        let body = CreateModelRequest {
            algorithm: &spec.algorithm,
            dimension: spec.dimension,
            index: spec.index,
        };
        debug!(name = %spec.name, ?body, "Registering model");

        let request = self.client.post(self.url(&spec.name, None)).json(&body);
        self.call(request, self.request_timeout).await.map(|_| ())
    }

    async fn append_training_sample(
        &self,
        name: &str,
        sample: &TelemetrySample,
    ) -> ServiceResult<()> {
        let request = self
            .client
            .put(self.url(name, Some("training")))
            .json(&SampleRequest::from(sample));
        self.call(request, self.request_timeout).await.map(|_| ())
    }

    async fn trigger_training(&self, name: &str) -> ServiceResult<()> {
        let request = self.client.post(self.url(name, Some("training")));
        self.call(request, self.training_timeout).await.map(|_| ())
    }

    async fn append_testing_sample_and_predict(
        &self,
        name: &str,
        sample: &TelemetrySample,
    ) -> ServiceResult<PredictionResult> {
        let request = self
            .client
            .put(self.url(name, Some("testing")))
            .json(&SampleRequest::from(sample));
        let reply = self.call(request, self.request_timeout).await?;
        reply.prediction()
    }
}
