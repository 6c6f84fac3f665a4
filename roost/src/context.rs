//! Preparation of the build context that is sent to the engine.

use std::{
    fs,
    io::{self, Seek},
    path::PathBuf,
};

use log::debug;

use crate::{config::BuildConfig, id};

pub const DEFAULT_DOCKERFILE: &str = "Dockerfile";

const INLINE_DOCKERFILE_PREFIX: &str = ".roost.Dockerfile.";

/// Returns true if the context refers to something the engine fetches itself, rather than a local
/// directory.
pub fn is_remote(context: &str) -> bool {
    ["http://", "https://", "git://", "git@", "github.com/"]
        .iter()
        .any(|prefix| context.starts_with(prefix))
}

#[derive(Debug)]
enum Source {
    /// A tar archive of a local directory. The file is removed when dropped.
    Archive(tempfile::NamedTempFile),
    Remote(String),
}

/// A build context ready to be sent to the engine. Temporary files backing the context are removed
/// when this is dropped.
#[derive(Debug)]
pub struct BuildContext {
    source: Source,
    dockerfile: String,
}

impl BuildContext {
    /// Name of the Dockerfile, relative to the root of the context.
    pub fn dockerfile(&self) -> &str {
        &self.dockerfile
    }

    pub fn remote(&self) -> Option<&str> {
        match &self.source {
            Source::Remote(remote) => Some(remote),
            Source::Archive(_) => None,
        }
    }

    /// Opens the archive to be uploaded as the request body, if the context is local.
    pub fn archive(&self) -> io::Result<Option<fs::File>> {
        match &self.source {
            Source::Archive(file) => {
                let mut file = file.reopen()?;
                file.rewind()?;
                Ok(Some(file))
            }
            Source::Remote(_) => Ok(None),
        }
    }

    /// Location of the archive on disk, if the context is local.
    #[cfg(test)]
    fn archive_path(&self) -> Option<&std::path::Path> {
        match &self.source {
            Source::Archive(file) => Some(file.path()),
            Source::Remote(_) => None,
        }
    }
}

/// Packs the configured context directory, or refers to the configured remote context.
///
/// Inline Dockerfile steps are written into the archive under a unique name, which then becomes the
/// Dockerfile of the build.
pub fn prepare(config: &BuildConfig) -> io::Result<BuildContext> {
    let context = config.context.as_deref().unwrap_or(".");

    if is_remote(context) {
        if !config.steps.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("inline Dockerfile steps require a local build context, but {context:?} is remote"),
            ));
        }
        debug!("using remote build context {context:?}");
        return Ok(BuildContext {
            source: Source::Remote(context.to_owned()),
            dockerfile: config
                .dockerfile
                .clone()
                .unwrap_or_else(|| DEFAULT_DOCKERFILE.to_owned()),
        });
    }

    let directory = PathBuf::from(context);
    if !directory.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("build context {} is not a directory", directory.display()),
        ));
    }

    let file = tempfile::Builder::new()
        .prefix("roost-context-")
        .suffix(".tar")
        .tempfile()?;

    let mut archive = tar::Builder::new(file);
    archive.follow_symlinks(false);
    archive.append_dir_all(".", &directory)?;

    let dockerfile = if config.steps.is_empty() {
        config
            .dockerfile
            .clone()
            .unwrap_or_else(|| DEFAULT_DOCKERFILE.to_owned())
    } else {
        let name = format!("{INLINE_DOCKERFILE_PREFIX}{}", &id::random_id()[..12]);
        let mut contents = config.steps.join("\n");
        contents.push('\n');

        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        archive.append_data(&mut header, &name, contents.as_bytes())?;
        name
    };

    let file = archive.into_inner()?;
    debug!(
        "packed build context {} into {}",
        directory.display(),
        file.path().display()
    );

    Ok(BuildContext {
        source: Source::Archive(file),
        dockerfile,
    })
}
