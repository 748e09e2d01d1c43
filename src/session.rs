//! Per-connection session state machine.
//!
//! A session starts in [`Phase::Training`]: every telemetry sample is appended
//! to the model's training set and the device gets the sentinel prediction.
//! The sample that brings the count to `train_target` also triggers remote
//! training; if that succeeds the session moves to [`Phase::Testing`] for the
//! rest of the connection, and every later sample is scored.
//!
//! ```text
//!            sample n < T                  sample n > T
//!           +--------+                     +--------+
//!           v        |                     v        |
//!       [Training] --+-- n == T, trained --> [Testing] --+
//! ```
//!
//! Training is triggered at most once per session. If the trigger fails the
//! session stays in `Training` and the count has already moved past the
//! threshold, so it is not retried.

use crate::protocol::{decode_telemetry, Frame, MessageType, PredictionResult, TelemetrySample};
use crate::service::{ModelService, ServiceError};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Session phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Training,
    Testing,
}

/// Per-session parameters shared by all connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub model_name: String,
    pub train_target: u64,
    pub test_target: u64,
}

/// State owned by one connection handler.
pub struct Session {
    model_name: String,
    train_target: u64,
    test_target: u64,
    samples_seen: u64,
    phase: Phase,
    service: Arc<dyn ModelService>,
}

impl Session {
    pub fn new(config: &SessionConfig, service: Arc<dyn ModelService>) -> Self {
        Self {
            model_name: config.model_name.clone(),
            train_target: config.train_target,
            test_target: config.test_target,
            samples_seen: 0,
            phase: Phase::Training,
            service,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn samples_seen(&self) -> u64 {
        self.samples_seen
    }

    /// Process one incoming frame and return the responses, in send order.
    pub async fn handle(&mut self, frame: &Frame) -> Vec<Frame> {
        match frame.kind() {
            Some(MessageType::Telemetry) => self.on_telemetry(frame.payload()).await,
            Some(MessageType::Control) => {
                debug!("Control command acknowledged");
                vec![Frame::ack()]
            }
            _ => {
                let message = format!("Unknown message type: 0x{:02x}", frame.message_type());
                warn!(message_type = frame.message_type(), "Unknown message type");
                vec![Frame::error(&message)]
            }
        }
    }

    async fn on_telemetry(&mut self, payload: &[u8]) -> Vec<Frame> {
        let sample = match decode_telemetry(payload) {
            Ok(sample) => sample,
            Err(e) => {
                warn!(error = %e, "Rejected telemetry payload");
                return vec![Frame::error(&format!("Invalid telemetry: {}", e))];
            }
        };

        self.samples_seen += 1;
        debug!(
            sample = self.samples_seen,
            phase = ?self.phase,
            features = ?sample.features(),
            "Telemetry received"
        );

        match self.phase {
            Phase::Training => self.train(&sample).await,
            Phase::Testing => self.test(&sample).await,
        }
    }

    async fn train(&mut self, sample: &TelemetrySample) -> Vec<Frame> {
        let mut responses = Vec::with_capacity(2);

        match self
            .service
            .append_training_sample(&self.model_name, sample)
            .await
        {
            Ok(()) => {
                debug!(
                    sample = self.samples_seen,
                    target = self.train_target,
                    "Training sample added"
                );
                if self.samples_seen == self.train_target {
                    if let Err(e) = self.start_training().await {
                        responses.push(Frame::error(&format!("Training failed: {}", e)));
                    }
                }
            }
            Err(e) => {
                warn!(sample = self.samples_seen, error = %e, "Failed to add training sample");
                responses.push(Frame::error(&format!("Training sample rejected: {}", e)));
            }
        }

        // Devices never get a usable prediction while the model is training
        responses.push(Frame::prediction(PredictionResult::sentinel()));
        responses
    }

    async fn start_training(&mut self) -> Result<(), ServiceError> {
        info!(
            model = %self.model_name,
            samples = self.samples_seen,
            "All training samples collected, training model"
        );

        match self.service.trigger_training(&self.model_name).await {
            Ok(()) => {
                self.phase = Phase::Testing;
                info!(model = %self.model_name, "Model trained, switching to testing");
                Ok(())
            }
            Err(e) => {
                warn!(model = %self.model_name, error = %e, "Model training failed");
                Err(e)
            }
        }
    }

    async fn test(&mut self, sample: &TelemetrySample) -> Vec<Frame> {
        let result = self
            .service
            .append_testing_sample_and_predict(&self.model_name, sample)
            .await;

        let tested = self.samples_seen - self.train_target;
        if tested == self.test_target {
            info!(
                model = %self.model_name,
                samples = tested,
                "Testing window complete"
            );
        }

        match result {
            Ok(prediction) => {
                debug!(
                    value = prediction.value,
                    valid = prediction.valid,
                    "Prediction received"
                );
                vec![Frame::prediction(prediction)]
            }
            Err(e) => {
                warn!(sample = self.samples_seen, error = %e, "Prediction failed");
                vec![
                    Frame::error(&format!("Prediction failed: {}", e)),
                    Frame::prediction(PredictionResult::sentinel()),
                ]
            }
        }
    }
}
