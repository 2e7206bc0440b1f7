//! Entrypoint of the vespa-feed binary

use dotenvy::dotenv;
use vespa_feed_clap_blocks::tokio::TokioRuntimeConfig;

mod commands {
    pub(crate) mod feed;
}

enum ReturnCode {
    Failure = 1,
}

#[derive(Debug, clap::Parser)]
#[clap(
    name = "vespa-feed",
    version,
    about = "Feeds documents to a document API endpoint",
    long_about = r#"Feeds documents to a document API endpoint

Examples:
    # Feed a JSON array or a stream of JSON objects from a file
    vespa-feed feed --target http://localhost:8080 docs.json

    # Feed from stdin, printing the outcome of every operation
    cat docs.jsonl | vespa-feed feed --verbose-results -

    # Feed with debug logging
    LOG_FILTER=debug vespa-feed feed docs.json
"#
)]
struct Config {
    #[clap(flatten)]
    runtime_config: TokioRuntimeConfig,

    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, clap::Parser)]
enum Command {
    /// Feed documents read from a file or stdin
    Feed(commands::feed::Config),
}

fn main() -> Result<(), std::io::Error> {
    // load all environment variables from .env before doing anything
    load_dotenv();

    let config: Config = clap::Parser::parse();

    let tokio_runtime = config.runtime_config.builder()?.build()?;

    tokio_runtime.block_on(async move {
        match config.command {
            None => println!("command required, -h/--help for help"),
            Some(Command::Feed(config)) => {
                if let Err(e) = config.logging_config.install_global_subscriber() {
                    eprintln!("Initializing logs failed: {e}");
                    std::process::exit(ReturnCode::Failure as _);
                }
                if let Err(e) = commands::feed::command(config).await {
                    eprintln!("Feed command failed: {e:#}");
                    std::process::exit(ReturnCode::Failure as _)
                }
            }
        }
    });

    Ok(())
}

/// Source the .env file before initialising the Config struct - this sets
/// any envs in the file, which the Config struct then uses.
///
/// Precedence is given to existing env variables.
fn load_dotenv() {
    match dotenv() {
        Ok(_) => {}
        Err(dotenvy::Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
            // a missing env file is not an error, defaults apply
        }
        Err(e) => {
            eprintln!("FATAL Error loading config from: {e}");
            eprintln!("Aborting");
            std::process::exit(ReturnCode::Failure as _);
        }
    };
}
