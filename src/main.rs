use anyhow::Result;
use clap::Parser;
use tabproxy::commands;
use tabproxy::config::{ServerConfig, ServiceConfig};

/// tabproxy - REST proxy for browser-driven LLM chat sessions
///
/// Forwards tab and chat requests to an LLM session service, retrying
/// transient failures and streaming chat replies as JSON lines.
///
/// Examples:
///   tabproxy serve --api-key secret=alice    # Serve on 0.0.0.0:5815
///   tabproxy probe --llm-url http://host:3212 # Check the LLM service
#[derive(Parser, Debug)]
#[command(author, version = env!("TABPROXY_VERSION"), about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    service: ServiceConfig,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the proxy server
    Serve(ServeArgs),

    /// Check that the LLM service is reachable and healthy
    Probe,
}

#[derive(clap::Args, Debug)]
struct ServeArgs {
    #[command(flatten)]
    server: ServerConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => commands::serve(cli.service, args.server).await?,
        Commands::Probe => commands::probe(cli.service).await?,
    }
    Ok(())
}
