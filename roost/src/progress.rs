//! Plain-text rendering of build progress, in the style of `docker build --progress=plain`.

use std::{
    collections::{HashMap, HashSet},
    io::{self, Write},
    sync::mpsc,
};

use time::OffsetDateTime;

use crate::{
    trace::{SolveEvent, Vertex, VertexLog, VertexStatus},
    Error,
};

/// Consumes solve events until the sending side of the channel is closed.
pub trait Render: Sync {
    fn render(&self, events: mpsc::Receiver<SolveEvent>) -> Result<(), Error>;
}

/// Renders to stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainRenderer;

impl Render for PlainRenderer {
    fn render(&self, events: mpsc::Receiver<SolveEvent>) -> Result<(), Error> {
        // `Stderr` locks per write so log records from other threads can interleave.
        let mut printer = Printer::new(io::stderr());
        for event in events {
            printer.print(&event).map_err(Error::Render)?;
        }
        printer.finish().map_err(Error::Render)
    }
}

#[derive(Debug, Default)]
struct VertexState {
    index: usize,
    name: String,
    started: Option<OffsetDateTime>,
    announced: bool,
    finished: bool,
    /// Log output after the last line break, printed once the line is complete.
    partial: Vec<u8>,
    partial_at: Option<OffsetDateTime>,
}

fn elapsed(started: Option<OffsetDateTime>, at: OffsetDateTime) -> f64 {
    started
        .map(|started| (at - started).as_seconds_f64().max(0.0))
        .unwrap_or_default()
}

/// Accumulates vertex state across events and prints what changed.
pub struct Printer<W> {
    out: W,
    vertexes: HashMap<String, VertexState>,
    finished_statuses: HashSet<String>,
    next_index: usize,
}

impl<W: Write> Printer<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            vertexes: HashMap::new(),
            finished_statuses: HashSet::new(),
            next_index: 1,
        }
    }

    #[cfg(test)]
    fn into_inner(self) -> W {
        self.out
    }

    fn state(&mut self, digest: &str) -> &mut VertexState {
        let next_index = &mut self.next_index;
        self.vertexes
            .entry(digest.to_owned())
            .or_insert_with(|| {
                let index = *next_index;
                *next_index += 1;
                VertexState {
                    index,
                    ..Default::default()
                }
            })
    }

    fn announce(&mut self, digest: &str) -> io::Result<usize> {
        let state = self.state(digest);
        let index = state.index;
        if !state.announced {
            state.announced = true;
            let name = if state.name.is_empty() {
                digest.to_owned()
            } else {
                state.name.clone()
            };
            writeln!(self.out, "#{index} {name}")?;
        }
        Ok(index)
    }

    pub fn print(&mut self, event: &SolveEvent) -> io::Result<()> {
        for vertex in &event.vertexes {
            self.print_vertex(vertex)?;
        }
        for status in &event.statuses {
            self.print_status(status)?;
        }
        for log in &event.logs {
            self.print_log(log)?;
        }
        self.out.flush()
    }

    /// Prints the incomplete last lines of all vertexes.
    pub fn finish(&mut self) -> io::Result<()> {
        let mut pending: Vec<(usize, String)> = self
            .vertexes
            .iter()
            .filter(|(_, state)| !state.partial.is_empty())
            .map(|(digest, state)| (state.index, digest.clone()))
            .collect();
        pending.sort();
        for (_, digest) in pending {
            self.flush_partial(&digest)?;
        }
        self.out.flush()
    }

    fn flush_partial(&mut self, digest: &str) -> io::Result<()> {
        let state = self.state(digest);
        if state.partial.is_empty() {
            return Ok(());
        }
        let partial = std::mem::take(&mut state.partial);
        let elapsed = state
            .partial_at
            .map(|at| elapsed(state.started, at))
            .unwrap_or_default();
        let index = state.index;

        let line = String::from_utf8_lossy(&partial);
        writeln!(self.out, "#{index} {elapsed:.3} {}", line.trim_end_matches('\r'))
    }

    fn print_vertex(&mut self, vertex: &Vertex) -> io::Result<()> {
        let state = self.state(&vertex.digest);
        if !vertex.name.is_empty() {
            state.name.clone_from(&vertex.name);
        }
        if vertex.started.is_some() {
            state.started = vertex.started;
        }
        if state.finished {
            return Ok(());
        }

        if vertex.started.is_none() && !vertex.cached && vertex.error.is_none() {
            // Queued but not started, nothing to show yet.
            return Ok(());
        }

        let index = self.announce(&vertex.digest)?;
        let done = vertex.cached || vertex.error.is_some() || vertex.completed.is_some();
        if done {
            self.flush_partial(&vertex.digest)?;
        }

        let finished = if vertex.cached {
            writeln!(self.out, "#{index} CACHED")?;
            true
        } else if let Some(error) = vertex.error.as_deref() {
            writeln!(self.out, "#{index} ERROR: {error}")?;
            true
        } else if let (Some(started), Some(completed)) = (vertex.started, vertex.completed) {
            let seconds = (completed - started).as_seconds_f64().max(0.0);
            writeln!(self.out, "#{index} DONE {seconds:.1}s")?;
            true
        } else {
            false
        };

        if finished {
            self.state(&vertex.digest).finished = true;
        }
        Ok(())
    }

    fn print_status(&mut self, status: &VertexStatus) -> io::Result<()> {
        if status.completed.is_none() || self.finished_statuses.contains(&status.id) {
            return Ok(());
        }
        self.finished_statuses.insert(status.id.clone());

        let index = self.announce(&status.vertex)?;
        let name = if status.name.is_empty() {
            &status.id
        } else {
            &status.name
        };
        if status.total > 0 {
            writeln!(
                self.out,
                "#{index} {name} {current} / {total} done",
                current = status.current,
                total = status.total
            )
        } else {
            writeln!(self.out, "#{index} {name} done")
        }
    }

    fn print_log(&mut self, log: &VertexLog) -> io::Result<()> {
        let index = self.announce(&log.vertex)?;
        let state = self.state(&log.vertex);
        state.partial.extend_from_slice(&log.data);
        state.partial_at = Some(log.timestamp);
        let Some(end) = state.partial.iter().rposition(|&byte| byte == b'\n') else {
            return Ok(());
        };
        let rest = state.partial.split_off(end + 1);
        let complete = std::mem::replace(&mut state.partial, rest);
        let elapsed = elapsed(state.started, log.timestamp);

        let text = String::from_utf8_lossy(&complete);
        for line in text.lines() {
            writeln!(self.out, "#{index} {elapsed:.3} {line}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use time::{macros::datetime, Duration};

    use super::*;
    use crate::trace::LogStream;

    const T0: OffsetDateTime = datetime!(2024-01-01 12:00:00 UTC);

    fn vertex(digest: &str, name: &str) -> Vertex {
        Vertex {
            digest: digest.to_owned(),
            inputs: Vec::new(),
            name: name.to_owned(),
            started: None,
            completed: None,
            error: None,
            cached: false,
        }
    }

    fn render(events: &[SolveEvent]) -> String {
        let mut printer = Printer::new(Vec::new());
        for event in events {
            printer.print(event).unwrap();
        }
        printer.finish().unwrap();
        String::from_utf8(printer.into_inner()).unwrap()
    }

    #[test]
    fn accumulates_vertex_state() {
        let queued = vertex("sha256:a", "[1/2] FROM alpine");
        let started = Vertex {
            started: Some(T0),
            ..queued.clone()
        };
        let log = VertexLog {
            vertex: "sha256:a".to_owned(),
            stream: LogStream::Stdout,
            data: b"hello\nworld\n".to_vec(),
            timestamp: T0 + Duration::milliseconds(250),
        };
        let completed = Vertex {
            completed: Some(T0 + Duration::milliseconds(1500)),
            ..started.clone()
        };

        let output = render(&[
            SolveEvent {
                vertexes: vec![queued],
                ..Default::default()
            },
            SolveEvent {
                vertexes: vec![started],
                ..Default::default()
            },
            SolveEvent {
                logs: vec![log],
                ..Default::default()
            },
            SolveEvent {
                vertexes: vec![completed.clone()],
                ..Default::default()
            },
            // Repeated completion is not printed twice.
            SolveEvent {
                vertexes: vec![completed],
                ..Default::default()
            },
        ]);

        assert_eq!(
            output,
            "#1 [1/2] FROM alpine\n\
             #1 0.250 hello\n\
             #1 0.250 world\n\
             #1 DONE 1.5s\n"
        );
    }

    #[test]
    fn lines_split_across_log_events() {
        let started = Vertex {
            started: Some(T0),
            ..vertex("sha256:a", "[1/1] RUN make")
        };
        let log = |data: &[u8], millis| VertexLog {
            vertex: "sha256:a".to_owned(),
            stream: LogStream::Stdout,
            data: data.to_vec(),
            timestamp: T0 + Duration::milliseconds(millis),
        };

        let output = render(&[
            SolveEvent {
                vertexes: vec![started.clone()],
                ..Default::default()
            },
            SolveEvent {
                logs: vec![log(b"compil", 100), log(b"ing\r\nlink", 200)],
                ..Default::default()
            },
            SolveEvent {
                logs: vec![log(b"ing\n", 300)],
                ..Default::default()
            },
            SolveEvent {
                logs: vec![log(b"warning: unused", 400)],
                ..Default::default()
            },
            SolveEvent {
                vertexes: vec![Vertex {
                    completed: Some(T0 + Duration::milliseconds(500)),
                    ..started
                }],
                ..Default::default()
            },
        ]);

        assert_eq!(
            output,
            "#1 [1/1] RUN make\n\
             #1 0.200 compiling\n\
             #1 0.300 linking\n\
             #1 0.400 warning: unused\n\
             #1 DONE 0.5s\n"
        );
    }

    #[test]
    fn incomplete_line_is_printed_when_the_stream_ends() {
        let output = render(&[SolveEvent {
            vertexes: vec![Vertex {
                started: Some(T0),
                ..vertex("sha256:a", "[1/1] RUN echo -n done")
            }],
            logs: vec![VertexLog {
                vertex: "sha256:a".to_owned(),
                stream: LogStream::Stdout,
                data: b"done".to_vec(),
                timestamp: T0 + Duration::seconds(1),
            }],
            ..Default::default()
        }]);

        assert_eq!(output, "#1 [1/1] RUN echo -n done\n#1 1.000 done\n");
    }

    #[test]
    fn cached_and_failed_vertexes() {
        let cached = Vertex {
            cached: true,
            ..vertex("sha256:a", "[1/2] FROM alpine")
        };
        let failed = Vertex {
            started: Some(T0),
            error: Some("process \"/bin/sh -c make\" did not complete".to_owned()),
            ..vertex("sha256:b", "[2/2] RUN make")
        };

        let output = render(&[SolveEvent {
            vertexes: vec![cached, failed],
            ..Default::default()
        }]);

        assert_eq!(
            output,
            "#1 [1/2] FROM alpine\n\
             #1 CACHED\n\
             #2 [2/2] RUN make\n\
             #2 ERROR: process \"/bin/sh -c make\" did not complete\n"
        );
    }

    #[test]
    fn completed_statuses_are_printed_once() {
        let status = VertexStatus {
            id: "sha256:layer".to_owned(),
            vertex: "sha256:a".to_owned(),
            name: "extracting sha256:layer".to_owned(),
            total: 0,
            current: 0,
            timestamp: T0,
            started: Some(T0),
            completed: None,
        };
        let done = VertexStatus {
            completed: Some(T0),
            total: 20,
            current: 20,
            ..status.clone()
        };

        let output = render(&[
            SolveEvent {
                vertexes: vec![Vertex {
                    started: Some(T0),
                    ..vertex("sha256:a", "[1/1] FROM alpine")
                }],
                statuses: vec![status],
                ..Default::default()
            },
            SolveEvent {
                statuses: vec![done.clone(), done],
                ..Default::default()
            },
        ]);

        assert_eq!(
            output,
            "#1 [1/1] FROM alpine\n\
             #1 extracting sha256:layer 20 / 20 done\n"
        );
    }

    #[test]
    fn plain_renderer_stops_when_channel_closes() {
        let (sender, receiver) = mpsc::sync_channel(1);
        sender.send(SolveEvent::default()).unwrap();
        drop(sender);
        PlainRenderer.render(receiver).unwrap();
    }
}
