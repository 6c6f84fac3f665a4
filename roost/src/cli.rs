mod build;
mod images;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::{
    config::DEFAULT_CONFIG_FILE,
    engine::{Docker, DEFAULT_DOCKER_HOST},
    version::VERSION,
    Result,
};

pub use crate::task::CancellationToken;

#[derive(Debug, Parser)]
#[command(version = VERSION, about)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Image configuration file.
    #[arg(long = "file", short = 'f', global = true, default_value = DEFAULT_CONFIG_FILE)]
    file: PathBuf,

    /// Address of the build engine.
    #[arg(long = "host", global = true, env = "DOCKER_HOST", default_value = DEFAULT_DOCKER_HOST)]
    host: String,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Build an image after materializing its dependencies
    #[command(arg_required_else_help = true)]
    Build(build::BuildArgs),

    /// Print the id of an image, building it if it does not exist yet
    #[command(arg_required_else_help = true)]
    Get(build::BuildArgs),

    /// List the images matching a reference
    #[command(arg_required_else_help = true)]
    Images { reference: String },
}

impl Cli {
    pub fn run(self, cancel: &CancellationToken) -> Result<()> {
        let docker = Docker::new(&self.host)?;

        match self.command {
            Commands::Build(args) => {
                build::build(&docker, &self.file, args, build::Mode::Build, cancel)?;
            }
            Commands::Get(args) => {
                build::build(&docker, &self.file, args, build::Mode::Get, cancel)?;
            }
            Commands::Images { reference } => {
                images::images(&docker, &reference)?;
            }
        }

        Ok(())
    }
}
