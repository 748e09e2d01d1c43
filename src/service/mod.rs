//! Model service boundary.
//!
//! The bridge never trains or scores anything itself. Every sample is handed
//! to an external service that owns a registry of named models. The
//! [`ModelService`] trait is that boundary; [`HttpModelService`] talks to the
//! reference deployment over HTTP/JSON.
//!
//! Calls are awaited by the connection handler that issues them, so a slow
//! call suspends only that connection. Nothing here retries: a failed call is
//! reported once and it is up to the caller to decide what the device sees.

mod http;

pub use http::HttpModelService;

use crate::protocol::{PredictionResult, TelemetrySample};
use async_trait::async_trait;

/// Parameters used to create the model on the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: String,
    pub algorithm: String,
    /// Number of features per sample
    pub dimension: usize,
    /// Feature index the model predicts
    pub index: usize,
}

/// Why a remote call failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// No reply within the call's deadline
    Timeout,
    /// The service could not be reached
    Unreachable(String),
    /// The service replied with a failure indication
    Rejected(String),
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceError::Timeout => write!(f, "Model service timed out"),
            ServiceError::Unreachable(msg) => write!(f, "Model service unreachable: {}", msg),
            ServiceError::Rejected(msg) => write!(f, "Model service rejected request: {}", msg),
        }
    }
}

impl std::error::Error for ServiceError {}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Operations the bridge needs from the model service.
///
/// Implementations are shared by every connection handler and must be safe
/// to call concurrently.
#[async_trait]
pub trait ModelService: Send + Sync {
    /// Create the named model. Called once before the bridge accepts devices.
    async fn register_model(&self, spec: &ModelSpec) -> ServiceResult<()>;

    /// Add one sample to the model's training set.
    async fn append_training_sample(&self, name: &str, sample: &TelemetrySample)
        -> ServiceResult<()>;

    /// Train the model on everything appended so far.
    async fn trigger_training(&self, name: &str) -> ServiceResult<()>;

    /// Add one sample to the testing set and return the model's prediction.
    async fn append_testing_sample_and_predict(
        &self,
        name: &str,
        sample: &TelemetrySample,
    ) -> ServiceResult<PredictionResult>;
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scripted in-memory service for session and server tests.

    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// A recorded call.
    #[derive(Debug, Clone, PartialEq)]
    pub enum Call {
        Register(String),
        AppendTraining(String),
        Train(String),
        Predict(String),
    }

    /// Returns queued outcomes per operation, or success when a queue is empty.
    #[derive(Default)]
    pub struct MockService {
        calls: Mutex<Vec<Call>>,
        register: Mutex<VecDeque<ServiceResult<()>>>,
        training: Mutex<VecDeque<ServiceResult<()>>>,
        train: Mutex<VecDeque<ServiceResult<()>>>,
        predict: Mutex<VecDeque<ServiceResult<PredictionResult>>>,
    }

    impl MockService {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn fail_register(self, err: ServiceError) -> Self {
            self.register.lock().unwrap().push_back(Err(err));
            self
        }

        pub fn push_training(&self, outcome: ServiceResult<()>) {
            self.training.lock().unwrap().push_back(outcome);
        }

        pub fn push_train(&self, outcome: ServiceResult<()>) {
            self.train.lock().unwrap().push_back(outcome);
        }

        pub fn push_predict(&self, outcome: ServiceResult<PredictionResult>) {
            self.predict.lock().unwrap().push_back(outcome);
        }

        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
            self.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
        }

        fn record(&self, call: Call) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl ModelService for MockService {
        async fn register_model(&self, spec: &ModelSpec) -> ServiceResult<()> {
            self.record(Call::Register(spec.name.clone()));
            self.register.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }

        async fn append_training_sample(
            &self,
            name: &str,
            _sample: &TelemetrySample,
        ) -> ServiceResult<()> {
            self.record(Call::AppendTraining(name.to_string()));
            self.training.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }

        async fn trigger_training(&self, name: &str) -> ServiceResult<()> {
            self.record(Call::Train(name.to_string()));
            self.train.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }

        async fn append_testing_sample_and_predict(
            &self,
            name: &str,
            _sample: &TelemetrySample,
        ) -> ServiceResult<PredictionResult> {
            self.record(Call::Predict(name.to_string()));
            self.predict
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(PredictionResult::valid(0.0)))
        }
    }
}
