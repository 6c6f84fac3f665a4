//! Normalized solve status, translated from the trace records embedded in the build output.

pub mod proto;

use time::OffsetDateTime;

/// One snapshot of build progress. Each event only carries what changed since the previous one,
/// consumers accumulate state across events.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SolveEvent {
    pub vertexes: Vec<Vertex>,
    pub statuses: Vec<VertexStatus>,
    pub logs: Vec<VertexLog>,
}

/// A step in the build graph.
#[derive(Debug, Clone, PartialEq)]
pub struct Vertex {
    pub digest: String,
    pub inputs: Vec<String>,
    pub name: String,
    pub started: Option<OffsetDateTime>,
    pub completed: Option<OffsetDateTime>,
    pub error: Option<String>,
    pub cached: bool,
}

/// Progress of a unit of work within a vertex, e.g. a layer being downloaded.
#[derive(Debug, Clone, PartialEq)]
pub struct VertexStatus {
    pub id: String,
    pub vertex: String,
    pub name: String,
    pub total: i64,
    pub current: i64,
    pub timestamp: OffsetDateTime,
    pub started: Option<OffsetDateTime>,
    pub completed: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
    Other(i64),
}

impl From<i64> for LogStream {
    fn from(value: i64) -> Self {
        match value {
            1 => LogStream::Stdout,
            2 => LogStream::Stderr,
            other => LogStream::Other(other),
        }
    }
}

/// Output written by the process running a vertex.
#[derive(Debug, Clone, PartialEq)]
pub struct VertexLog {
    pub vertex: String,
    pub stream: LogStream,
    pub data: Vec<u8>,
    pub timestamp: OffsetDateTime,
}

fn timestamp(value: Option<prost_types::Timestamp>) -> Option<OffsetDateTime> {
    let value = value?;
    let nanos = i128::from(value.seconds) * 1_000_000_000 + i128::from(value.nanos);
    OffsetDateTime::from_unix_timestamp_nanos(nanos).ok()
}

/// Converts a decoded trace record into a [`SolveEvent`], one entry for every entry in the record.
pub fn translate(response: proto::StatusResponse) -> SolveEvent {
    let proto::StatusResponse {
        vertexes,
        statuses,
        logs,
    } = response;

    SolveEvent {
        vertexes: vertexes
            .into_iter()
            .map(|v| Vertex {
                digest: v.digest,
                inputs: v.inputs,
                name: v.name,
                started: timestamp(v.started),
                completed: timestamp(v.completed),
                error: (!v.error.is_empty()).then_some(v.error),
                cached: v.cached,
            })
            .collect(),
        statuses: statuses
            .into_iter()
            .map(|s| VertexStatus {
                id: s.id,
                vertex: s.vertex,
                name: s.name,
                total: s.total,
                current: s.current,
                timestamp: timestamp(s.timestamp).unwrap_or(OffsetDateTime::UNIX_EPOCH),
                started: timestamp(s.started),
                completed: timestamp(s.completed),
            })
            .collect(),
        logs: logs
            .into_iter()
            .map(|l| VertexLog {
                vertex: l.vertex,
                stream: LogStream::from(l.stream),
                data: l.msg,
                timestamp: timestamp(l.timestamp).unwrap_or(OffsetDateTime::UNIX_EPOCH),
            })
            .collect(),
    }
}
