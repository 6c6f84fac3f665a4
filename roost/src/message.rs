//! Decoding of the JSON message stream returned by the engine's build endpoint.

use std::{fmt, io, sync::mpsc};

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use log::debug;
use prost::Message as _;
use serde::Deserialize;

use crate::{
    task::CancellationToken,
    trace::{self, SolveEvent},
    Error,
};

/// Aux id of the record carrying the id of the built image.
pub const IMAGE_ID_AUX: &str = "moby.image.id";

/// Aux id of the records carrying BuildKit progress.
pub const TRACE_AUX: &str = "moby.buildkit.trace";

/// Error record of a JSON message, as in `{"errorDetail": {"code": 1, "message": "..."}}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct JsonError {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub message: String,
}

impl fmt::Display for JsonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for JsonError {}

/// The `error` field is a plain string in current engines but an object in some older ones.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ErrorField {
    Message(String),
    Detail(JsonError),
}

/// Partial implementation of the JSON messages written by the engine. See
/// https://github.com/moby/moby/blob/master/pkg/jsonmessage/jsonmessage.go.
#[derive(Debug, Deserialize)]
struct JsonMessage {
    #[serde(default)]
    stream: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default, rename = "errorDetail")]
    error_detail: Option<JsonError>,
    #[serde(default)]
    error: Option<ErrorField>,
    #[serde(default)]
    aux: Option<serde_json::Value>,
}

/// An aux payload and the id it is tagged with.
#[derive(Debug, Clone, PartialEq)]
pub struct Aux {
    pub id: String,
    pub payload: serde_json::Value,
}

/// One decoded unit of the build output.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct StatusEnvelope {
    pub error: Option<JsonError>,
    pub aux: Option<Aux>,
    pub stream: Option<String>,
}

impl From<JsonMessage> for StatusEnvelope {
    fn from(message: JsonMessage) -> Self {
        let JsonMessage {
            stream,
            id,
            error_detail,
            error,
            aux,
        } = message;

        let error = match (error_detail, error) {
            (Some(detail), Some(ErrorField::Message(message))) if detail.message.is_empty() => {
                Some(JsonError {
                    code: detail.code,
                    message,
                })
            }
            (Some(detail), _) => Some(detail),
            (None, Some(ErrorField::Detail(detail))) => Some(detail),
            (None, Some(ErrorField::Message(message))) => Some(JsonError {
                code: None,
                message,
            }),
            (None, None) => None,
        };

        let aux = aux.and_then(|payload| match id {
            Some(id) => Some(Aux { id, payload }),
            // Without a message id the aux object tags itself: `{"ID": "...", "payload": ...}`.
            None => {
                let serde_json::Value::Object(mut object) = payload else {
                    return None;
                };
                let payload = object.remove("payload")?;
                match object.remove("ID")? {
                    serde_json::Value::String(id) => Some(Aux { id, payload }),
                    _ => None,
                }
            }
        });

        StatusEnvelope { error, aux, stream }
    }
}

/// Aux payload of [`IMAGE_ID_AUX`] records.
#[derive(Debug, Deserialize)]
struct BuildResult {
    #[serde(rename = "ID")]
    id: String,
}

/// Forwards solve events to the progress renderer, if there is one.
///
/// Forwarding applies backpressure through the bounded channel. When the receiving end is gone the
/// event is dropped and forwarding stops, so the decoder never blocks on a renderer that is not
/// reading. Dropping the forwarder closes the channel.
#[derive(Debug, Default)]
pub struct TraceForwarder {
    sender: Option<mpsc::SyncSender<SolveEvent>>,
}

impl TraceForwarder {
    pub fn new(sender: Option<mpsc::SyncSender<SolveEvent>>) -> Self {
        Self { sender }
    }

    pub fn disabled() -> Self {
        Self { sender: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.sender.is_some()
    }

    fn forward(&mut self, event: SolveEvent) {
        if let Some(sender) = self.sender.as_ref() {
            if sender.send(event).is_err() {
                debug!("progress renderer stopped reading, no longer forwarding trace records");
                self.sender = None;
            }
        }
    }

    /// Closes the channel. The renderer sees the end of the event stream once it has received
    /// everything that was sent before.
    pub fn close(&mut self) {
        self.sender = None;
    }
}

fn parse_trace(payload: serde_json::Value) -> Option<SolveEvent> {
    let encoded: String = match serde_json::from_value(payload) {
        Ok(value) => value,
        Err(error) => {
            debug!("skipping trace record that is not a string: {error}");
            return None;
        }
    };
    let bytes = match BASE64_STANDARD.decode(encoded) {
        Ok(value) => value,
        Err(error) => {
            debug!("skipping trace record that is not base64: {error}");
            return None;
        }
    };
    match trace::proto::StatusResponse::decode(bytes.as_slice()) {
        Ok(response) => Some(trace::translate(response)),
        Err(error) => {
            debug!("skipping trace record that is not a status response: {error}");
            None
        }
    }
}

/// Reads JSON messages from `reader` until it ends and returns the id of the built image, which is
/// empty if the engine never reported one.
///
/// Fails on the first malformed message or on the first message carrying an error, without reading
/// any further. Malformed aux payloads are skipped. Trace records are only decoded while `trace`
/// is enabled.
pub fn decode_build_output<R: io::Read>(
    reader: R,
    trace: &mut TraceForwarder,
    cancel: &CancellationToken,
) -> Result<String, Error> {
    let mut image_id = String::new();
    let messages =
        serde_json::Deserializer::from_reader(io::BufReader::new(reader)).into_iter::<JsonMessage>();

    for message in messages {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let envelope = StatusEnvelope::from(message.map_err(Error::Decode)?);

        if let Some(error) = envelope.error {
            return Err(Error::Engine(error));
        }

        if let Some(aux) = envelope.aux {
            match aux.id.as_str() {
                IMAGE_ID_AUX => match serde_json::from_value::<BuildResult>(aux.payload) {
                    Ok(result) => {
                        debug!("engine reported image id {:?}", result.id);
                        image_id = result.id;
                    }
                    Err(error) => debug!("skipping malformed build result: {error}"),
                },
                TRACE_AUX if trace.is_enabled() => {
                    if let Some(event) = parse_trace(aux.payload) {
                        trace.forward(event);
                    }
                }
                _ => {}
            }
        } else if let Some(stream) = envelope.stream.as_deref() {
            if log::log_enabled!(log::Level::Debug) {
                let stream = stream.trim_end();
                if !stream.is_empty() {
                    debug!("build output: {stream}");
                }
            }
        }
    }

    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    Ok(image_id)
}
