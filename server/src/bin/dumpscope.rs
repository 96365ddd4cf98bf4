use anyhow::Result;
use dumpscope::cli;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_tracing(cli: &cli::Cli) -> Result<()> {
    let filter = if cli.trace {
        EnvFilter::new("debug,dumpscope=trace")
    } else if cli.debug {
        EnvFilter::new("warn,dumpscope=debug")
    } else if cli.verbose {
        EnvFilter::new("warn,dumpscope=info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(cli.debug || cli.trace)
                .compact(),
        )
        .init();

    Ok(())
}

fn main() -> Result<()> {
    let cli = cli::parse();
    init_tracing(&cli)?;
    let code = cli::run(cli)?;
    std::process::exit(code);
}
