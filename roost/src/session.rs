//! The session tunnel: a connection the engine keeps open to the client for the duration of a build.

mod health;

use std::{
    collections::BTreeMap,
    convert::Infallible,
    fmt,
    future::{self, Ready},
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use http_body_util::{combinators::WithTrailers, BodyExt, Full};
use hyper::{
    body::{Bytes, Incoming},
    header::{HeaderValue, CONTENT_TYPE},
    server::conn::http2,
    service::service_fn,
    HeaderMap, Request, Response,
};
use hyper_util::rt::{TokioExecutor, TokioIo};
use log::{debug, warn};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::Notify,
};

use crate::{id, task::CancellationToken, BoxError, Error};

use self::health::{HealthCheckRequest, HealthCheckResponse, ServingStatus};

/// Endpoint of the engine API that upgrades to a session connection.
pub const SESSION_ENDPOINT: &str = "/session";

/// Protocol requested when upgrading the session connection.
pub const SESSION_PROTOCOL: &str = "h2c";

pub const HEADER_SESSION_UUID: &str = "X-Docker-Expose-Session-Uuid";
pub const HEADER_SESSION_NAME: &str = "X-Docker-Expose-Session-Name";
pub const HEADER_SESSION_SHARED_KEY: &str = "X-Docker-Expose-Session-Sharedkey";
pub const HEADER_SESSION_METHOD: &str = "X-Docker-Expose-Session-Grpc-Method";

/// Method the engine uses to check whether the session is alive.
pub const HEALTH_CHECK_METHOD: &str = "/grpc.health.v1.Health/Check";

const GRPC_STATUS: &str = "grpc-status";
const GRPC_MESSAGE: &str = "grpc-message";
const GRPC_OK: &str = "0";
const GRPC_UNIMPLEMENTED: &str = "12";
const GRPC_INTERNAL: &str = "13";

/// Headers sent along with the upgrade request, a header may occur multiple times.
pub type Metadata = BTreeMap<String, Vec<String>>;

/// A raw bidirectional connection to the engine, over which the engine calls the session's
/// services.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Connection for T {}

/// Shared between the session and the cancellation token, so the connection is shut down at most
/// once.
#[derive(Default)]
struct CloseOnce {
    closed: AtomicBool,
    notify: Notify,
}

impl CloseOnce {
    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Stores a permit if the server is not waiting yet.
        self.notify.notify_one();
    }

    async fn closed(&self) {
        self.notify.notified().await;
    }
}

enum State {
    Idle,
    Live(Arc<CloseOnce>),
    Closed,
}

/// A build session. The engine correlates the build request with this session through its id.
pub struct Session {
    id: String,
    name: String,
    shared_key: String,
    state: Mutex<State>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Session {
    pub fn new(name: &str, shared_key: &str) -> Self {
        Self {
            id: id::random_id(),
            name: name.to_owned(),
            shared_key: shared_key.to_owned(),
            state: Mutex::new(State::Idle),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.state(), State::Closed)
    }

    pub fn metadata(&self) -> Metadata {
        [
            (HEADER_SESSION_UUID, vec![self.id.clone()]),
            (HEADER_SESSION_NAME, vec![self.name.clone()]),
            (HEADER_SESSION_SHARED_KEY, vec![self.shared_key.clone()]),
            (HEADER_SESSION_METHOD, vec![HEALTH_CHECK_METHOD.to_owned()]),
        ]
        .into_iter()
        .map(|(key, values)| (key.to_owned(), values))
        .collect()
    }

    /// Dials the engine and keeps the connection open until the session is closed, the token is
    /// cancelled or the connection fails.
    ///
    /// The build request may reach the engine before the connection is established; the engine
    /// waits for the session to attach. If the session is closed before or while dialing, the
    /// connection is dropped right away and this returns `Ok`.
    pub fn run<D>(&self, dial: D, cancel: &CancellationToken) -> Result<(), Error>
    where
        D: FnOnce(&str, &Metadata) -> Result<Box<dyn Connection>, BoxError>,
    {
        if self.is_closed() {
            debug!("session {} closed before it was dialed", self.id);
            return Ok(());
        }

        debug!("dialing session {}", self.id);
        let connection = dial(SESSION_PROTOCOL, &self.metadata())
            .map_err(|error| Error::Session(io::Error::other(error)))?;

        let close_once = Arc::new(CloseOnce::default());

        {
            let mut state = self.state();
            if matches!(*state, State::Closed) {
                drop(state);
                debug!("session {} closed while it was dialed", self.id);
                return Ok(());
            }
            if matches!(*state, State::Live(_)) {
                return Err(Error::Session(io::Error::other(
                    "session is already running",
                )));
            }
            *state = State::Live(Arc::clone(&close_once));
        }

        let _registration = cancel.on_cancel({
            let close_once = Arc::clone(&close_once);
            move || close_once.close()
        });

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(Error::Session)?;
        let result = runtime.block_on(serve(connection, &close_once));

        if self.is_closed() {
            debug!("session {} closed", self.id);
            Ok(())
        } else if cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            result.map_err(|error| Error::Session(io::Error::other(error)))
        }
    }

    /// Closes the session. Returns true if this call closed it, and false if it was already closed.
    pub fn close(&self) -> bool {
        let previous = std::mem::replace(&mut *self.state(), State::Closed);
        match previous {
            State::Idle => true,
            State::Live(close_once) => {
                close_once.close();
                true
            }
            State::Closed => false,
        }
    }
}

/// Serves the session's gRPC services over h2c until the engine hangs up or the session is
/// closed. Closing drops the connection.
async fn serve(
    connection: Box<dyn Connection>,
    close_once: &CloseOnce,
) -> Result<(), hyper::Error> {
    let server = http2::Builder::new(TokioExecutor::new())
        .serve_connection(TokioIo::new(connection), service_fn(handle));
    tokio::select! {
        result = server => result,
        () = close_once.closed() => Ok(()),
    }
}

type ResponseBody = WithTrailers<Full<Bytes>, Ready<Option<Result<HeaderMap, Infallible>>>>;

async fn handle(request: Request<Incoming>) -> Result<Response<ResponseBody>, hyper::Error> {
    let method = request.uri().path().to_owned();
    let body = request.into_body().collect().await?.to_bytes();
    debug!("session call {method}");

    let (message, status) = match method.as_str() {
        HEALTH_CHECK_METHOD => match health::decode_frame::<HealthCheckRequest>(&body) {
            Ok(_) => (
                health::encode_frame(&HealthCheckResponse {
                    status: ServingStatus::Serving as i32,
                }),
                Ok(()),
            ),
            Err(error) => (Bytes::new(), Err((GRPC_INTERNAL, error))),
        },
        _ => {
            warn!("engine called unsupported session method {method}");
            (
                Bytes::new(),
                Err((GRPC_UNIMPLEMENTED, format!("unknown method {method}"))),
            )
        }
    };

    let mut trailers = HeaderMap::new();
    match status {
        Ok(()) => {
            trailers.insert(GRPC_STATUS, HeaderValue::from_static(GRPC_OK));
        }
        Err((code, error)) => {
            trailers.insert(GRPC_STATUS, HeaderValue::from_static(code));
            if let Ok(value) = HeaderValue::try_from(error) {
                trailers.insert(GRPC_MESSAGE, value);
            }
        }
    }

    let mut response =
        Response::new(Full::new(message).with_trailers(future::ready(Some(Ok(trailers)))));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/grpc"));
    Ok(response)
}
