use crate::error::CallFailure;
use crate::module::SharedMemoryDescriptor;
use serde::ser::SerializeTuple;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::mpsc::Receiver;

pub const CALLER_TO_WORKER_CAP: usize = 1_048_576;
pub const WORKER_TO_CALLER_CAP: usize = 67_108_864;

/// Caller-supplied token linking a call to its eventual response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CorrelationId {
    Number(serde_json::Number),
    Text(String),
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorrelationId::Number(id) => write!(f, "{id}"),
            CorrelationId::Text(id) => f.write_str(id),
        }
    }
}

impl From<i64> for CorrelationId {
    fn from(id: i64) -> Self {
        CorrelationId::Number(id.into())
    }
}

impl From<&str> for CorrelationId {
    fn from(id: &str) -> Self {
        CorrelationId::Text(id.to_string())
    }
}

/// `[callName, correlationId, args]` on the wire.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "(String, CorrelationId, Vec<Value>)")]
pub struct CallRequest {
    pub name: String,
    pub id: CorrelationId,
    pub args: Vec<Value>,
}

impl From<(String, CorrelationId, Vec<Value>)> for CallRequest {
    fn from((name, id, args): (String, CorrelationId, Vec<Value>)) -> Self {
        Self { name, id, args }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "t")]
pub enum ControlMessage {
    #[serde(rename = "trace")]
    Trace { patterns: Vec<String> },

    #[serde(rename = "resource_ready")]
    ResourceReady { key: String },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum CallerEnvelope {
    Call(CallRequest),
    Control(ControlMessage),
    /// A call whose id is readable but whose name or args are not.
    #[serde(skip)]
    Rejected {
        id: CorrelationId,
        failure: CallFailure,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEnvelope {
    Result {
        id: CorrelationId,
        value: Value,
    },
    Failure {
        id: CorrelationId,
        failure: CallFailure,
    },
    Ready {
        shared_memory: Option<SharedMemoryDescriptor>,
        methods: Vec<&'static str>,
    },
    StartupError {
        failure: CallFailure,
    },
}

impl WorkerEnvelope {
    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        match self {
            WorkerEnvelope::Result { id, .. } | WorkerEnvelope::Failure { id, .. } => Some(id),
            WorkerEnvelope::Ready { .. } | WorkerEnvelope::StartupError { .. } => None,
        }
    }
}

impl Serialize for WorkerEnvelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            WorkerEnvelope::Result { id, value } => {
                let mut tuple = serializer.serialize_tuple(3)?;
                tuple.serialize_element("RESULT")?;
                tuple.serialize_element(id)?;
                tuple.serialize_element(value)?;
                tuple.end()
            }
            WorkerEnvelope::Failure { id, failure } => {
                let mut tuple = serializer.serialize_tuple(3)?;
                tuple.serialize_element("ERROR")?;
                tuple.serialize_element(id)?;
                tuple.serialize_element(failure)?;
                tuple.end()
            }
            WorkerEnvelope::Ready {
                shared_memory,
                methods,
            } => {
                let mut tuple = serializer.serialize_tuple(3)?;
                tuple.serialize_element("READY")?;
                tuple.serialize_element(shared_memory)?;
                tuple.serialize_element(methods)?;
                tuple.end()
            }
            WorkerEnvelope::StartupError { failure } => {
                let mut tuple = serializer.serialize_tuple(2)?;
                tuple.serialize_element("ERROR")?;
                tuple.serialize_element(failure)?;
                tuple.end()
            }
        }
    }
}

pub fn writer_loop(mut writer: impl Write, rx: Receiver<WorkerEnvelope>) -> io::Result<()> {
    for envelope in rx {
        let payload = encode_worker_envelope(&envelope)?;
        write_frame(&mut writer, &payload, WORKER_TO_CALLER_CAP)?;
        writer.flush()?;
    }

    Ok(())
}

pub fn reader_loop<F>(mut reader: impl Read, mut on_envelope: F) -> io::Result<()>
where
    F: FnMut(CallerEnvelope),
{
    loop {
        match read_frame(&mut reader, CALLER_TO_WORKER_CAP) {
            Ok(payload) => match decode_caller_envelope(&payload) {
                Ok(envelope) => on_envelope(envelope),
                Err(err) => {
                    tracing::warn!(bytes = payload.len(), "skipping undecodable envelope: {err}");
                }
            },
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(err) => return Err(err),
        }
    }
}

fn encode_worker_envelope(envelope: &WorkerEnvelope) -> io::Result<Vec<u8>> {
    serde_json::to_vec(envelope).map_err(json_error)
}

fn decode_caller_envelope(payload: &[u8]) -> io::Result<CallerEnvelope> {
    serde_json::from_slice(payload).or_else(|err| reject_malformed_call(payload, err))
}

fn reject_malformed_call(payload: &[u8], err: serde_json::Error) -> io::Result<CallerEnvelope> {
    let id = match serde_json::from_slice::<Value>(payload) {
        Ok(Value::Array(mut items)) if items.len() >= 2 => {
            serde_json::from_value::<CorrelationId>(items.swap_remove(1)).ok()
        }
        _ => None,
    };

    match id {
        Some(id) => Ok(CallerEnvelope::Rejected {
            id,
            failure: CallFailure::invalid_arguments(format!(
                "call must be [name, id, [args...]]: {err}"
            )),
        }),
        None => Err(json_error(err)),
    }
}

fn read_frame(reader: &mut impl Read, max_payload: usize) -> io::Result<Vec<u8>> {
    let mut len_buf = [0_u8; 4];
    reader.read_exact(&mut len_buf)?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_payload {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {len} > {max_payload}"),
        ));
    }

    let mut payload = vec![0_u8; len];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

fn write_frame(writer: &mut impl Write, payload: &[u8], max_payload: usize) -> io::Result<()> {
    if payload.len() > max_payload {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {} > {}", payload.len(), max_payload),
        ));
    }

    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "payload exceeds u32"))?;

    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(payload)?;
    Ok(())
}

fn json_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
