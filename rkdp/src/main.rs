use clap::Parser;
use rkdp::cli::{Cli, Commands};
use rkdp::version::Version;
use rkdp::{Config, daemon};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), anyhow::Error> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => daemon::run(Config::from(args)),
        Commands::Version => {
            println!("{}", Version::current());
            Ok(())
        }
    }
}
