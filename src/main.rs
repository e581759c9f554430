// src/main.rs

use taskhost::cli::{self, Command};
use taskhost::logging::{self, ProcessRole};
use taskhost::run;

#[tokio::main]
async fn main() {
    match run_main().await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("taskhost error: {err:?}");
            std::process::exit(1);
        }
    }
}

async fn run_main() -> anyhow::Result<i32> {
    let args = cli::parse();
    let role = match args.command {
        Command::Helper { .. } => ProcessRole::Helper,
        _ => ProcessRole::Host,
    };
    logging::init_logging(args.log_level, role)?;
    run(args).await
}
