mod cli;
mod config;
mod dockerfile;
mod error;
mod registry;
mod sandbox;
mod store;

use clap::Parser;

use cli::Cli;

fn main() {
    let cli = Cli::parse();

    if let Err(e) = cli::init_logging(cli.debug) {
        eprintln!("shoebox: failed to initialize logging: {e:#}");
        std::process::exit(1);
    }

    let config = match cli::resolve_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("shoebox: failed to resolve configuration: {e:#}");
            std::process::exit(1);
        }
    };

    std::process::exit(cli::run(cli, config));
}
