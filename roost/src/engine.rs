mod docker;

use std::{collections::BTreeMap, fs, io};

pub use docker::*;
use serde::Deserialize;

use crate::{
    auth::AuthConfigs,
    session::{Connection, Metadata},
    BoxError,
};

/// Parameters of a single build. Immutable once submitted.
#[derive(Debug, Clone, Default)]
pub struct BuildRequest {
    pub tags: Vec<String>,
    pub build_args: BTreeMap<String, Option<String>>,
    pub no_cache: bool,
    pub pull_parent: bool,
    /// Path of the Dockerfile relative to the context root.
    pub dockerfile: String,
    /// Context the engine fetches itself. When absent, the context is uploaded with the request.
    pub remote_context: Option<String>,
    pub session_id: String,
    /// Unique per build, lets the engine tell builds of the same session apart.
    pub build_id: String,
    pub auth_configs: AuthConfigs,
}

/// Partial implementation of the image summary returned by the engine's image list endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageSummary {
    pub id: String,
    #[serde(default)]
    pub repo_tags: Option<Vec<String>>,
    /// Seconds since the unix epoch.
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub size: i64,
}

/// The calls this crate makes to the build engine.
pub trait Engine: Sync {
    /// Submits a build and returns the streamed build output. `context` is the archive to upload
    /// when the request has no remote context.
    fn image_build(
        &self,
        request: &BuildRequest,
        context: Option<fs::File>,
    ) -> Result<Box<dyn io::Read + Send>, BoxError>;

    /// Opens a raw connection to `endpoint`, upgraded to `proto`.
    fn dial_hijack(
        &self,
        endpoint: &str,
        proto: &str,
        metadata: &Metadata,
    ) -> Result<Box<dyn Connection>, BoxError>;

    /// Lists the images matching `reference`.
    fn image_list(&self, reference: &str) -> Result<Vec<ImageSummary>, BoxError>;
}
