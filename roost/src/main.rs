use clap::Parser;
use log::warn;

use roost::cli::CancellationToken;

fn main() {
    // Must run before ctrlc spawns its signal thread.
    time_local::init();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cancel = CancellationToken::new();
    let handler = {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || {
            if cancel.is_cancelled() {
                std::process::exit(130);
            }
            warn!("Cancelling, press Ctrl-C again to exit immediately");
            cancel.cancel();
        })
    };
    if let Err(error) = handler {
        warn!("Failed to install Ctrl-C handler: {error}");
    }

    if let Err(error) = roost::cli::Cli::parse().run(&cancel) {
        const BOLD_RED: &str = "\x1b[1;31m";
        const BOLD: &str = "\x1b[1m";
        const RESET: &str = "\x1b[0m";
        eprintln!("{BOLD_RED}error{RESET}{BOLD}:{RESET} {error}");
        std::process::exit(1);
    }
}
