use std::{fmt, io};

use crate::message::JsonError;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failure of a build, or of one of the participants running while the build is in progress.
#[derive(Debug)]
pub enum Error {
    /// The build output is not a valid stream of JSON messages.
    Decode(serde_json::Error),
    /// The engine reported an error in the build output. Displays the engine's message verbatim.
    Engine(JsonError),
    /// The build output ended cleanly without ever reporting the id of the built image.
    MissingImageId,
    /// The session tunnel could not be established or failed while the build was running.
    Session(io::Error),
    /// A call to the build engine failed.
    Request(BoxError),
    /// The build context could not be prepared.
    Context(io::Error),
    /// Build progress could not be written.
    Render(io::Error),
    /// A build configuration could not be loaded.
    Config(BoxError),
    /// A build configuration depends on itself, possibly through other configurations.
    DependencyCycle(Vec<String>),
    /// The build was cancelled before it finished.
    Cancelled,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Decode(error) => write!(f, "failed to decode build output: {error}"),
            Error::Engine(error) => error.fmt(f),
            Error::MissingImageId => f.write_str("build finished without reporting an image id"),
            Error::Session(error) => write!(f, "build session failed: {error}"),
            Error::Request(error) => write!(f, "build engine request failed: {error}"),
            Error::Context(error) => write!(f, "failed to prepare build context: {error}"),
            Error::Render(error) => write!(f, "failed to display build progress: {error}"),
            Error::Config(error) => error.fmt(f),
            Error::DependencyCycle(chain) => {
                write!(f, "image dependencies form a cycle: {}", chain.join(" -> "))
            }
            Error::Cancelled => f.write_str("build was cancelled"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Decode(error) => Some(error),
            Error::Session(error) | Error::Context(error) | Error::Render(error) => Some(error),
            Error::Request(error) | Error::Config(error) => Some(error.as_ref()),
            _ => None,
        }
    }
}
