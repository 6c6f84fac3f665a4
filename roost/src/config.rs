//! Named image build configurations, read from a YAML file such as:
//!
//! ```yaml
//! images:
//!   base:
//!     name: example/base:latest
//!     steps:
//!       - FROM alpine:3.20
//!       - RUN apk add --no-cache curl
//!   app:
//!     name: example/app:latest
//!     context: ./app
//!     args:
//!       VERSION: "1.0"
//!     dependencies: [base]
//! ```

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use log::debug;
use serde::Deserialize;

use crate::{context, BoxError};

pub const DEFAULT_CONFIG_FILE: &str = "roost.yml";

/// How to build one image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildConfig {
    /// Key of the configuration in the configuration file.
    #[serde(skip)]
    pub name: String,

    /// Reference the image is tagged with and looked up by.
    #[serde(default, rename = "name")]
    pub image_name: Option<String>,

    /// Local directory or remote context. Defaults to the working directory.
    #[serde(default)]
    pub context: Option<String>,

    #[serde(default)]
    pub dockerfile: Option<String>,

    /// Dockerfile instructions, used instead of a Dockerfile from the context.
    #[serde(default)]
    pub steps: Vec<String>,

    /// Build arguments. An argument without a value is taken from the engine's environment.
    #[serde(default)]
    pub args: BTreeMap<String, Option<String>>,

    #[serde(default)]
    pub no_cache: bool,

    /// Always attempt to pull a newer version of the base images.
    #[serde(default, rename = "pull")]
    pub force_pull: bool,

    /// Configurations that are materialized before this one is built.
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Build even if an image with the configured name exists. Not part of the file, set from the
    /// command line.
    #[serde(skip)]
    pub force_rebuild: bool,
}

/// Resolves configuration names to configurations.
pub trait LoadConfig: Sync {
    fn load_image(&self, name: &str) -> Result<BuildConfig, BoxError>;
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileContents {
    #[serde(default)]
    images: BTreeMap<String, BuildConfig>,
}

/// The parsed configuration file.
#[derive(Debug, Default)]
pub struct ConfigFile {
    path: PathBuf,
    images: BTreeMap<String, BuildConfig>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self, BoxError> {
        let contents = fs::read_to_string(path)
            .map_err(|error| format!("failed to read {}: {error}", path.display()))?;
        let base = path.parent().unwrap_or_else(|| Path::new(""));
        let mut file = Self::parse(&contents, base)
            .map_err(|error| format!("failed to parse {}: {error}", path.display()))?;
        file.path = path.to_owned();
        debug!(
            "loaded {} image configurations from {}",
            file.images.len(),
            path.display()
        );
        Ok(file)
    }

    /// Parses configurations. Relative local contexts are resolved against `base`.
    pub fn parse(contents: &str, base: &Path) -> Result<Self, serde_yaml::Error> {
        let FileContents { mut images } = serde_yaml::from_str(contents)?;

        for (name, config) in &mut images {
            config.name.clone_from(name);

            let context = config.context.as_deref().unwrap_or(".");
            if !context::is_remote(context) && Path::new(context).is_relative() {
                config.context = Some(base.join(context).to_string_lossy().into_owned());
            }
        }

        Ok(Self {
            path: PathBuf::new(),
            images,
        })
    }

    #[cfg(test)]
    fn names(&self) -> impl Iterator<Item = &str> {
        self.images.keys().map(String::as_str)
    }
}

impl LoadConfig for ConfigFile {
    fn load_image(&self, name: &str) -> Result<BuildConfig, BoxError> {
        self.images.get(name).cloned().ok_or_else(|| {
            if self.path.as_os_str().is_empty() {
                format!("no image configuration named {name:?}").into()
            } else {
                format!(
                    "no image configuration named {name:?} in {}",
                    self.path.display()
                )
                .into()
            }
        })
    }
}
