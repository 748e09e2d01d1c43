//! Binary wire protocol spoken between edge devices and the bridge.
//!
//! Every message is a frame:
//!
//! ```text
//! +--------+----------------+------------------+
//! | type:1 | length:2 (BE)  | payload:length   |
//! +--------+----------------+------------------+
//! ```
//!
//! Message types:
//! - `0x01` telemetry (device -> bridge), 45-byte sample payload
//! - `0x02` control/mode command (device -> bridge), acknowledged only
//! - `0x81` prediction (bridge -> device), 4-byte big-endian `f32`
//! - `0x82` acknowledgment (bridge -> device), empty payload
//! - `0xFF` error (bridge -> device), UTF-8 message

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 3;

/// Largest payload a frame header can describe.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Minimum telemetry payload: eleven `f32` values and one month byte.
pub const TELEMETRY_LEN: usize = 45;

/// Number of features in a telemetry sample.
pub const FEATURE_COUNT: usize = 12;

/// Wire value of the "no prediction yet" sentinel.
pub const SENTINEL_PREDICTION: f32 = -1.0;

/// Known message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Telemetry = 0x01,
    Control = 0x02,
    Prediction = 0x81,
    Ack = 0x82,
    Error = 0xFF,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(MessageType::Telemetry),
            0x02 => Some(MessageType::Control),
            0x81 => Some(MessageType::Prediction),
            0x82 => Some(MessageType::Ack),
            0xFF => Some(MessageType::Error),
            _ => None,
        }
    }
}

/// Framing errors. Connection-fatal once the peer stops sending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Fewer than three header bytes are available
    TruncatedHeader { actual: usize },
    /// Header announced more payload than is available
    TruncatedPayload { expected: usize, actual: usize },
    /// Payload does not fit in the 16-bit length field
    PayloadTooLarge(usize),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::TruncatedHeader { actual } => {
                write!(f, "Truncated header: expected {} bytes, got {}", HEADER_LEN, actual)
            }
            FrameError::TruncatedPayload { expected, actual } => {
                write!(f, "Truncated payload: expected {} bytes, got {}", expected, actual)
            }
            FrameError::PayloadTooLarge(len) => {
                write!(f, "Payload too large: {} bytes (max {})", len, MAX_PAYLOAD_LEN)
            }
        }
    }
}

impl std::error::Error for FrameError {}

/// Payload content errors. Reported to the device; the connection stays open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    PayloadTooShort { expected: usize, actual: usize },
}

impl std::fmt::Display for FormatError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FormatError::PayloadTooShort { expected, actual } => {
                write!(f, "Payload too short: expected {} bytes, got {}", expected, actual)
            }
        }
    }
}

impl std::error::Error for FormatError {}

/// A single wire message.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    message_type: u8,
    payload: Bytes,
}

impl Frame {
    /// Build a frame, rejecting payloads the header cannot describe.
    pub fn new<B: Into<Bytes>>(message_type: u8, payload: B) -> Result<Frame, FrameError> {
        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(FrameError::PayloadTooLarge(payload.len()));
        }
        Ok(Frame {
            message_type,
            payload,
        })
    }

    /// Raw type byte, which may not be a known [`MessageType`].
    pub fn message_type(&self) -> u8 {
        self.message_type
    }

    pub fn kind(&self) -> Option<MessageType> {
        MessageType::from_u8(self.message_type)
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Prediction response. Invalid results carry the sentinel value.
    pub fn prediction(result: PredictionResult) -> Frame {
        Frame {
            message_type: MessageType::Prediction as u8,
            payload: Bytes::copy_from_slice(&encode_f32_be(result.wire_value())),
        }
    }

    /// Empty acknowledgment for control commands.
    pub fn ack() -> Frame {
        Frame {
            message_type: MessageType::Ack as u8,
            payload: Bytes::new(),
        }
    }

    /// Error response. Messages longer than a frame allows are cut at a
    /// character boundary.
    pub fn error(message: &str) -> Frame {
        let mut end = message.len().min(MAX_PAYLOAD_LEN);
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        Frame {
            message_type: MessageType::Error as u8,
            payload: Bytes::copy_from_slice(&message.as_bytes()[..end]),
        }
    }

    /// Encode the frame to bytes
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        self.encode_into(&mut buf);
        buf
    }

    /// Encode the frame into an existing buffer
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(HEADER_LEN + self.payload.len());
        buf.put_u8(self.message_type);
        // Length fits: enforced at construction
        buf.put_u16(self.payload.len() as u16);
        buf.extend_from_slice(&self.payload);
    }
}

/// Decode one frame from the front of `input`.
///
/// Returns the frame and the number of bytes consumed. Bytes after the frame
/// are left for the next call.
pub fn decode_frame(input: &[u8]) -> Result<(Frame, usize), FrameError> {
    if input.len() < HEADER_LEN {
        return Err(FrameError::TruncatedHeader {
            actual: input.len(),
        });
    }

    let message_type = input[0];
    let length = u16::from_be_bytes([input[1], input[2]]) as usize;
    let available = input.len() - HEADER_LEN;
    if available < length {
        return Err(FrameError::TruncatedPayload {
            expected: length,
            actual: available,
        });
    }

    let payload = Bytes::copy_from_slice(&input[HEADER_LEN..HEADER_LEN + length]);
    Ok((
        Frame {
            message_type,
            payload,
        },
        HEADER_LEN + length,
    ))
}

/// Big-endian IEEE-754 single precision.
pub fn encode_f32_be(value: f32) -> [u8; 4] {
    value.to_be_bytes()
}

/// Min/avg/max statistics for one sensed quantity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Summary {
    pub avg: f32,
    pub min: f32,
    pub max: f32,
}

/// Power statistics carry two extra percentiles.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerSummary {
    pub avg: f32,
    pub min: f32,
    pub max: f32,
    pub p25: f32,
    pub p75: f32,
}

/// One aggregated sensing window reported by a device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TelemetrySample {
    pub temperature: Summary,
    pub humidity: Summary,
    pub power: PowerSummary,
    pub month: u8,
}

impl TelemetrySample {
    /// Features in the order the model expects them.
    pub fn features(&self) -> [f32; FEATURE_COUNT] {
        [
            self.temperature.avg,
            self.temperature.min,
            self.temperature.max,
            self.humidity.avg,
            self.humidity.min,
            self.humidity.max,
            self.power.avg,
            self.power.min,
            self.power.max,
            self.power.p25,
            self.power.p75,
            f32::from(self.month),
        ]
    }

    /// Encode into the 45-byte telemetry payload layout.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(TELEMETRY_LEN);
        for value in &self.features()[..FEATURE_COUNT - 1] {
            buf.put_f32(*value);
        }
        buf.put_u8(self.month);
        buf
    }
}

/// Decode a telemetry payload. Bytes past the 45th are ignored.
pub fn decode_telemetry(payload: &[u8]) -> Result<TelemetrySample, FormatError> {
    if payload.len() < TELEMETRY_LEN {
        return Err(FormatError::PayloadTooShort {
            expected: TELEMETRY_LEN,
            actual: payload.len(),
        });
    }

    let mut buf = &payload[..TELEMETRY_LEN];
    let temperature = Summary {
        avg: buf.get_f32(),
        min: buf.get_f32(),
        max: buf.get_f32(),
    };
    let humidity = Summary {
        avg: buf.get_f32(),
        min: buf.get_f32(),
        max: buf.get_f32(),
    };
    let power = PowerSummary {
        avg: buf.get_f32(),
        min: buf.get_f32(),
        max: buf.get_f32(),
        p25: buf.get_f32(),
        p75: buf.get_f32(),
    };
    let month = buf.get_u8();

    Ok(TelemetrySample {
        temperature,
        humidity,
        power,
        month,
    })
}

/// Outcome of a prediction request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PredictionResult {
    pub value: f32,
    pub valid: bool,
}

impl PredictionResult {
    pub fn valid(value: f32) -> Self {
        Self { value, valid: true }
    }

    /// "No prediction yet"
    pub fn sentinel() -> Self {
        Self {
            value: SENTINEL_PREDICTION,
            valid: false,
        }
    }

    /// Value to put on the wire.
    pub fn wire_value(&self) -> f32 {
        if self.valid {
            self.value
        } else {
            SENTINEL_PREDICTION
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample() -> TelemetrySample {
        TelemetrySample {
            temperature: Summary {
                avg: 15.5,
                min: 10.25,
                max: 20.75,
            },
            humidity: Summary {
                avg: 65.5,
                min: 45.0,
                max: 85.0,
            },
            power: PowerSummary {
                avg: 250.5,
                min: 180.0,
                max: 320.0,
                p25: 200.0,
                p75: 300.0,
            },
            month: 6,
        }
    }

    #[test]
    fn test_decode_frame() {
        let buffer = [0x02, 0x00, 0x02, 0xAA, 0xBB];
        let (frame, consumed) = decode_frame(&buffer).unwrap();
        assert_eq!(consumed, 5);
        assert_eq!(frame.message_type(), 0x02);
        assert_eq!(frame.kind(), Some(MessageType::Control));
        assert_eq!(&frame.payload()[..], &[0xAA, 0xBB]);
    }

    #[test]
    fn test_decode_frame_leaves_trailing_bytes() {
        let buffer = [0x02, 0x00, 0x00, 0x01, 0x00];
        let (frame, consumed) = decode_frame(&buffer).unwrap();
        assert_eq!(consumed, 3);
        assert!(frame.payload().is_empty());

        match decode_frame(&buffer[consumed..]) {
            Err(FrameError::TruncatedHeader { actual: 2 }) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_truncated_header() {
        match decode_frame(&[0x01]) {
            Err(FrameError::TruncatedHeader { actual: 1 }) => {}
            other => panic!("unexpected: {:?}", other),
        }
        match decode_frame(&[]) {
            Err(FrameError::TruncatedHeader { actual: 0 }) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_truncated_payload() {
        match decode_frame(&[0x01, 0x00, 0x2D, 1, 2, 3]) {
            Err(FrameError::TruncatedPayload {
                expected: 45,
                actual: 3,
            }) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_is_still_a_frame() {
        let (frame, _) = decode_frame(&[0x05, 0x00, 0x00]).unwrap();
        assert_eq!(frame.message_type(), 0x05);
        assert_eq!(frame.kind(), None);
    }

    #[test]
    fn test_encode_prediction() {
        let frame = Frame::prediction(PredictionResult::valid(42.5));
        let bytes = frame.encode();
        assert_eq!(&bytes[..3], &[0x81, 0x00, 0x04]);
        assert_eq!(&bytes[3..], &42.5f32.to_be_bytes());
    }

    #[test]
    fn test_encode_sentinel() {
        let frame = Frame::prediction(PredictionResult::sentinel());
        assert_eq!(&frame.encode()[..], &[0x81, 0x00, 0x04, 0xBF, 0x80, 0x00, 0x00]);
    }

    #[test]
    fn test_invalid_result_never_leaks_value() {
        let result = PredictionResult {
            value: 7.0,
            valid: false,
        };
        assert_eq!(result.wire_value(), SENTINEL_PREDICTION);
    }

    #[test]
    fn test_encode_ack() {
        assert_eq!(&Frame::ack().encode()[..], &[0x82, 0x00, 0x00]);
    }

    #[test]
    fn test_encode_error() {
        let bytes = Frame::error("bad").encode();
        assert_eq!(&bytes[..], b"\xFF\x00\x03bad");
    }

    #[test]
    fn test_error_truncated_on_char_boundary() {
        // 'é' is two bytes; an odd limit would split it
        let message = "é".repeat(MAX_PAYLOAD_LEN);
        let frame = Frame::error(&message);
        assert_eq!(frame.payload().len(), MAX_PAYLOAD_LEN - 1);
        assert!(std::str::from_utf8(frame.payload()).is_ok());
    }

    #[test]
    fn test_frame_new_rejects_oversized_payload() {
        let payload = vec![0u8; MAX_PAYLOAD_LEN + 1];
        assert_eq!(
            Frame::new(0x01, payload),
            Err(FrameError::PayloadTooLarge(MAX_PAYLOAD_LEN + 1))
        );
    }

    #[test]
    fn test_encode_f32_be() {
        assert_eq!(encode_f32_be(1.0), [0x3F, 0x80, 0x00, 0x00]);
        assert_eq!(encode_f32_be(-1.0), [0xBF, 0x80, 0x00, 0x00]);
    }

    #[test]
    fn test_decode_telemetry() {
        let payload = sample().encode();
        assert_eq!(payload.len(), TELEMETRY_LEN);

        let decoded = decode_telemetry(&payload).unwrap();
        assert_eq!(decoded, sample());
        assert_eq!(decoded.features()[6], 250.5);
        assert_eq!(decoded.features()[11], 6.0);
    }

    #[test]
    fn test_telemetry_reencodes_original_bytes() {
        let mut payload = Vec::with_capacity(TELEMETRY_LEN);
        for i in 0..11u32 {
            // Arbitrary bit patterns, including a NaN payload
            payload.extend_from_slice(&(0x3F80_0000u32 + i * 0x0101_0101).to_be_bytes());
        }
        payload[40..44].copy_from_slice(&0x7FC0_1234u32.to_be_bytes());
        payload.push(255);

        let decoded = decode_telemetry(&payload).unwrap();
        assert_eq!(decoded.month, 255);
        assert_eq!(&decoded.encode()[..], &payload[..]);
    }

    #[test]
    fn test_telemetry_ignores_trailing_bytes() {
        let mut payload = sample().encode();
        payload.extend_from_slice(b"extra");
        assert_eq!(decode_telemetry(&payload).unwrap(), sample());
    }

    #[test]
    fn test_telemetry_too_short() {
        let payload = sample().encode();
        match decode_telemetry(&payload[..44]) {
            Err(FormatError::PayloadTooShort {
                expected: 45,
                actual: 44,
            }) => {}
            other => panic!("unexpected: {:?}", other),
        }
        assert!(decode_telemetry(&[]).is_err());
    }
}
