//! Command protocol message types.
//!
//! One `Event` per line: `{"type": "...", "data": "..."}`. `data` is itself
//! the JSON text of the record selected by `type`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while encoding or decoding protocol records.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed event: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("event {0:?} carries no data")]
    MissingData(EventType),
}

/// Event type tag. Selects how `Event::data` is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    /// Client asks the server to compile and run a script.
    Run,
    /// Server answer to a `Run`.
    RunResult,
    /// Asynchronous script output.
    Log,
    /// Client asks for a screen capture bundle.
    Capture,
    /// Stop the running script (performed as a full restart).
    StopScript,
    /// Terminate the server process.
    Exit,
}

/// A single protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl Event {
    /// Event without a payload (`STOP_SCRIPT`, `EXIT`).
    pub const fn bare(kind: EventType) -> Self {
        Self { kind, data: None }
    }

    /// Event whose payload is the JSON encoding of `payload`.
    pub fn with_payload<T: Serialize>(kind: EventType, payload: &T) -> Result<Self, CodecError> {
        Ok(Self {
            kind,
            data: Some(serde_json::to_string(payload)?),
        })
    }

    pub fn run(request: &RunRequest) -> Result<Self, CodecError> {
        Self::with_payload(EventType::Run, request)
    }

    pub fn run_result(result: &RunResult) -> Result<Self, CodecError> {
        Self::with_payload(EventType::RunResult, result)
    }

    pub fn log(value: &serde_json::Value) -> Result<Self, CodecError> {
        Self::with_payload(EventType::Log, value)
    }

    pub fn capture(options: &CaptureOptions) -> Result<Self, CodecError> {
        Self::with_payload(EventType::Capture, options)
    }

    /// Decode one line into an event.
    pub fn decode(line: &str) -> Result<Self, CodecError> {
        Ok(serde_json::from_str(line)?)
    }

    /// Encode as a single line (without the terminator).
    pub fn encode(&self) -> Result<String, CodecError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode `data` as the record selected by this event's type.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        let data = self
            .data
            .as_deref()
            .ok_or(CodecError::MissingData(self.kind))?;
        Ok(serde_json::from_str(data)?)
    }

    /// Like [`payload`](Self::payload), but an absent `data` yields the
    /// record's default.
    pub fn payload_or_default<T: DeserializeOwned + Default>(&self) -> Result<T, CodecError> {
        match self.data.as_deref() {
            Some(data) => Ok(serde_json::from_str(data)?),
            None => Ok(T::default()),
        }
    }
}

/// Payload of `RUN`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    /// Directory the script runs in; sibling sources are pulled from here.
    pub working_dir: String,

    /// Script source text. Absent means `main.<ext>` in the working
    /// directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_text: Option<String>,

    /// Owning package. Names the `<owner>.<suffix>` RPC services.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
}

/// Payload of `RUN_RESULT`: either the encoded value or the failure message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunResult {
    Value(serde_json::Value),
    Error(String),
}

impl RunResult {
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

/// Payload of `CAPTURE`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CaptureOptions {
    #[serde(default = "default_scale")]
    pub scale: f32,

    #[serde(default = "default_quality")]
    pub quality: i32,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            scale: default_scale(),
            quality: default_quality(),
        }
    }
}

impl CaptureOptions {
    /// Target image size for a screen of `screen_width` x `screen_height`.
    ///
    /// Scale 1, non-positive scales and zero-area results use the native
    /// screen size.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss,
        clippy::float_cmp
    )]
    pub fn target_size(&self, screen_width: u32, screen_height: u32) -> (u32, u32) {
        if self.scale == 1.0 || self.scale <= 0.0 || !self.scale.is_finite() {
            return (screen_width, screen_height);
        }
        let width = (self.scale * screen_width as f32 + 0.5) as u32;
        let height = (self.scale * screen_height as f32 + 0.5) as u32;
        if width == 0 || height == 0 {
            (screen_width, screen_height)
        } else {
            (width, height)
        }
    }

    /// Quality clamped into `0..=100`.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn clamped_quality(&self) -> u8 {
        self.quality.clamp(0, 100) as u8
    }
}

const fn default_scale() -> f32 {
    1.0
}

const fn default_quality() -> i32 {
    100
}

/// The `info` entry of a capture bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureInfo {
    pub rotation: i32,
    pub screen_width: u32,
    pub screen_height: u32,
    pub image_width: u32,
    pub image_height: u32,
    #[serde(default)]
    pub nodes: serde_json::Value,
    #[serde(default)]
    pub active_window: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_type_names_on_the_wire() {
        let json = Event::bare(EventType::StopScript).encode().unwrap();
        assert_eq!(json, r#"{"type":"STOP_SCRIPT"}"#);

        let event = Event::decode(r#"{"type":"RUN_RESULT","data":"{\"value\":1}"}"#).unwrap();
        assert_eq!(event.kind, EventType::RunResult);
        assert_eq!(event.payload::<RunResult>().unwrap(), RunResult::Value(json!(1)));
    }

    #[test]
    fn run_request_uses_camel_case() {
        let event = Event::run(&RunRequest {
            working_dir: "/tmp/w".to_string(),
            source_text: Some("1 + 1".to_string()),
            owner_id: None,
        })
        .unwrap();
        let data = event.data.as_deref().unwrap();
        assert!(data.contains("\"workingDir\":\"/tmp/w\""));
        assert!(data.contains("\"sourceText\""));
        assert!(!data.contains("ownerId"));
    }

    #[test]
    fn run_request_source_text_is_optional() {
        let request: RunRequest = serde_json::from_str(r#"{"workingDir":"/w"}"#).unwrap();
        assert_eq!(request.source_text, None);
        assert_eq!(serde_json::to_string(&request).unwrap(), r#"{"workingDir":"/w"}"#);
    }

    #[test]
    fn run_result_shapes_are_distinct() {
        let ok = serde_json::to_string(&RunResult::Value(json!("boom"))).unwrap();
        let err = serde_json::to_string(&RunResult::Error("boom".into())).unwrap();
        assert_eq!(ok, r#"{"value":"boom"}"#);
        assert_eq!(err, r#"{"error":"boom"}"#);
    }

    #[test]
    fn missing_payload_is_an_error() {
        let event = Event::bare(EventType::Run);
        assert!(matches!(
            event.payload::<RunRequest>(),
            Err(CodecError::MissingData(EventType::Run))
        ));
    }

    #[test]
    fn absent_capture_options_use_defaults() {
        let event = Event::bare(EventType::Capture);
        let options: CaptureOptions = event.payload_or_default().unwrap();
        assert_eq!(options, CaptureOptions::default());

        let event = Event::capture(&CaptureOptions { scale: 0.5, quality: 10 }).unwrap();
        let options: CaptureOptions = event.payload_or_default().unwrap();
        assert_eq!(options.quality, 10);
    }

    #[test]
    fn unknown_event_type_fails_to_decode() {
        assert!(Event::decode(r#"{"type":"REBOOT"}"#).is_err());
        assert!(Event::decode("not json").is_err());
    }

    #[test]
    fn capture_target_size() {
        let native = CaptureOptions { scale: 1.0, quality: 90 };
        assert_eq!(native.target_size(1080, 1920), (1080, 1920));

        let half = CaptureOptions { scale: 0.5, quality: 90 };
        assert_eq!(half.target_size(1080, 1920), (540, 960));

        let zero = CaptureOptions { scale: 0.0, quality: 90 };
        assert_eq!(zero.target_size(1080, 1920), (1080, 1920));

        let tiny = CaptureOptions { scale: 0.0001, quality: 90 };
        assert_eq!(tiny.target_size(1080, 1920), (1080, 1920));
    }

    #[test]
    fn capture_quality_is_clamped() {
        assert_eq!(CaptureOptions { scale: 1.0, quality: 150 }.clamped_quality(), 100);
        assert_eq!(CaptureOptions { scale: 1.0, quality: -3 }.clamped_quality(), 0);
    }

    #[test]
    fn capture_options_defaults() {
        let options: CaptureOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(options, CaptureOptions::default());
    }
}
