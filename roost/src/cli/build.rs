use std::path::Path;

use log::debug;

use crate::{
    auth,
    config::{ConfigFile, LoadConfig},
    engine::Engine,
    image::Image,
    task::CancellationToken,
    Result,
};

#[derive(Debug, clap::Args)]
pub struct BuildArgs {
    /// Name of the image configuration.
    pub name: String,

    /// Build even if the image exists. Applies to the dependencies too.
    #[arg(long = "force-rebuild")]
    pub force_rebuild: bool,

    /// Do not use the build cache.
    #[arg(long = "no-cache")]
    pub no_cache: bool,

    /// Always attempt to pull newer versions of the base images.
    #[arg(long = "pull")]
    pub pull: bool,
}

#[derive(Debug, Clone, Copy)]
pub enum Mode {
    Build,
    Get,
}

pub fn build(
    engine: &dyn Engine,
    file: &Path,
    args: BuildArgs,
    mode: Mode,
    cancel: &CancellationToken,
) -> Result<()> {
    let configs = ConfigFile::load(file)?;
    let auth_configs = auth::load()?;
    debug!("using credentials for {} registries", auth_configs.len());

    let mut config = configs.load_image(&args.name)?;
    config.force_rebuild |= args.force_rebuild;
    config.no_cache |= args.no_cache;
    config.force_pull |= args.pull;

    let image = Image::new(engine, &configs, &auth_configs, config, cancel);
    let id = match mode {
        Mode::Build => image.build()?,
        Mode::Get => image.get()?,
    };

    println!("{id}");
    Ok(())
}
