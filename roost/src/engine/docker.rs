use std::{
    fs,
    io::{self, Read},
    path::PathBuf,
};

use hyper::body::Bytes;
use log::debug;
use reqwest::{
    header::{CONNECTION, CONTENT_TYPE, UPGRADE},
    StatusCode,
};
use tokio::runtime::{Handle, Runtime};

use super::{BuildRequest, Engine, ImageSummary};
use crate::{
    auth,
    session::{Connection, Metadata},
    version::VERSION,
    BoxError,
};

#[cfg(unix)]
pub const DEFAULT_DOCKER_HOST: &str = "unix:///var/run/docker.sock";
#[cfg(not(unix))]
pub const DEFAULT_DOCKER_HOST: &str = "tcp://127.0.0.1:2375";

/// Oldest engine API version that supports BuildKit builds with sessions.
const API_VERSION: &str = "1.39";

fn user_agent() -> String {
    format!("roost/{VERSION}")
}

/// Where the engine listens.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Host {
    Tcp(String),
    Unix(PathBuf),
}

fn parse_host(host: &str) -> Result<Host, BoxError> {
    const EXPECTED: &str = "expected unix:///path/to/socket or tcp://host:port";
    match host.split_once("://") {
        Some(("tcp" | "http", address)) if !address.trim_end_matches('/').is_empty() => {
            Ok(Host::Tcp(address.trim_end_matches('/').to_owned()))
        }
        Some(("unix", path)) if !path.is_empty() => Ok(Host::Unix(PathBuf::from(path))),
        Some((scheme, _)) => Err(format!(
            "unsupported engine address {host:?} with scheme {scheme:?}, {EXPECTED}"
        )
        .into()),
        None => Err(format!("invalid engine address {host:?}, {EXPECTED}").into()),
    }
}

/// Client for the Docker engine API. Requests run on a runtime owned by the client, so the
/// blocking [`Engine`] calls can be made from any thread outside of it.
pub struct Docker {
    base_url: String,
    client: reqwest::Client,
    runtime: Runtime,
}

impl Docker {
    /// `host` takes the form of `DOCKER_HOST`, e.g. `unix:///var/run/docker.sock` or
    /// `tcp://127.0.0.1:2375`.
    pub fn new(host: &str) -> Result<Self, BoxError> {
        let host = parse_host(host)?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("roost-engine")
            .enable_all()
            .build()?;
        let _guard = runtime.enter();

        // Builds take as long as they take, cancellation is up to the caller. No timeout is set.
        let builder = reqwest::Client::builder().user_agent(user_agent());
        let (builder, base_url) = match host {
            Host::Tcp(address) => (builder, format!("http://{address}")),
            #[cfg(unix)]
            Host::Unix(path) => (builder.unix_socket(path), "http://localhost".to_owned()),
            #[cfg(not(unix))]
            Host::Unix(path) => {
                return Err(format!("unix sockets are not supported: {}", path.display()).into())
            }
        };
        let client = builder.build()?;

        Ok(Self {
            base_url,
            client,
            runtime,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v{API_VERSION}{path}", self.base_url)
    }

    fn upgrade_request(
        &self,
        endpoint: &str,
        proto: &str,
        metadata: &Metadata,
    ) -> Result<reqwest::Request, BoxError> {
        let mut builder = self
            .client
            .post(self.url(endpoint))
            .header(CONNECTION, "Upgrade")
            .header(UPGRADE, proto);
        for (name, values) in metadata {
            for value in values {
                builder = builder.header(name.as_str(), value.as_str());
            }
        }
        Ok(builder.build()?)
    }
}

/// Query parameters of the build endpoint.
pub fn build_query(request: &BuildRequest) -> Result<Vec<(&'static str, String)>, BoxError> {
    let BuildRequest {
        tags,
        build_args,
        no_cache,
        pull_parent,
        dockerfile,
        remote_context,
        session_id,
        build_id,
        auth_configs: _,
    } = request;

    let mut query: Vec<(&'static str, String)> =
        tags.iter().map(|tag| ("t", tag.clone())).collect();
    if !build_args.is_empty() {
        query.push(("buildargs", serde_json::to_string(build_args)?));
    }
    if *no_cache {
        query.push(("nocache", "1".to_owned()));
    }
    if *pull_parent {
        query.push(("pull", "1".to_owned()));
    }
    query.push(("rm", "1".to_owned()));
    query.push(("forcerm", "1".to_owned()));
    query.push(("dockerfile", dockerfile.clone()));
    if let Some(remote) = remote_context {
        query.push(("remote", remote.clone()));
    }
    query.push(("session", session_id.clone()));
    query.push(("buildid", build_id.clone()));
    // Selects the BuildKit builder.
    query.push(("version", "2".to_owned()));
    Ok(query)
}

/// Partial implementation of the error body returned by the engine.
#[derive(serde::Deserialize)]
struct ErrorResponse {
    message: String,
}

async fn require_success(response: reqwest::Response) -> Result<reqwest::Response, BoxError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorResponse>(&body) {
        Ok(error) => Err(format!("engine responded with {status}: {}", error.message).into()),
        Err(_) => Err(format!("engine responded with {status}: {}", body.trim()).into()),
    }
}

/// Reads a streamed response body from a thread outside the runtime.
struct BodyReader {
    handle: Handle,
    response: reqwest::Response,
    chunk: Bytes,
}

impl Read for BodyReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.chunk.is_empty() {
            match self
                .handle
                .block_on(self.response.chunk())
                .map_err(io::Error::other)?
            {
                Some(chunk) => self.chunk = chunk,
                None => return Ok(0),
            }
        }
        let chunk = self.chunk.split_to(buf.len().min(self.chunk.len()));
        buf[..chunk.len()].copy_from_slice(&chunk);
        Ok(chunk.len())
    }
}

impl Engine for Docker {
    fn image_build(
        &self,
        request: &BuildRequest,
        context: Option<fs::File>,
    ) -> Result<Box<dyn Read + Send>, BoxError> {
        let query = build_query(request)?;
        if log::log_enabled!(log::Level::Debug) {
            debug!("submitting build with {query:?}");
        }

        let mut builder = self
            .client
            .post(self.url("/build"))
            .query(&query)
            .header(CONTENT_TYPE, "application/x-tar");
        if !request.auth_configs.is_empty() {
            builder = builder.header(
                "X-Registry-Config",
                auth::encode_header(&request.auth_configs)?,
            );
        }
        let body = match context {
            Some(file) => reqwest::Body::from(tokio::fs::File::from_std(file)),
            None => reqwest::Body::from(Vec::new()),
        };

        let response = self.runtime.block_on(async {
            let response = builder.body(body).send().await?;
            require_success(response).await
        })?;
        Ok(Box::new(BodyReader {
            handle: self.runtime.handle().clone(),
            response,
            chunk: Bytes::new(),
        }))
    }

    fn dial_hijack(
        &self,
        endpoint: &str,
        proto: &str,
        metadata: &Metadata,
    ) -> Result<Box<dyn Connection>, BoxError> {
        let request = self.upgrade_request(endpoint, proto, metadata)?;
        let path = request.url().path().to_owned();

        self.runtime.block_on(async {
            let response = self.client.execute(request).await?;
            let status = response.status();
            if status != StatusCode::SWITCHING_PROTOCOLS {
                return Err(format!("engine refused to upgrade {path}: {status}").into());
            }
            let upgraded = response.upgrade().await?;
            debug!("upgraded {path} to {proto}");
            Ok::<Box<dyn Connection>, BoxError>(Box::new(upgraded))
        })
    }

    fn image_list(&self, reference: &str) -> Result<Vec<ImageSummary>, BoxError> {
        let filters = serde_json::json!({ "reference": [reference] }).to_string();
        let request = self
            .client
            .get(self.url("/images/json"))
            .query(&[("filters", filters)]);
        let body = self.runtime.block_on(async {
            let response = require_success(request.send().await?).await?;
            Ok::<_, BoxError>(response.bytes().await?)
        })?;
        Ok(serde_json::from_slice(&body)?)
    }
}
