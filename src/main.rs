use anyhow::Result;
use clap::Parser;
use devflow::cli::{run, Cli};
use tracing_subscriber::EnvFilter;

fn init_tracing(verbose: bool) {
    let default_filter = if verbose {
        "devflow=debug,info"
    } else {
        "devflow=info,warn"
    };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(verbose)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let code = run(cli).await?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
