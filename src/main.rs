use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;

use automanager::ai::{LanguageModel, OllamaClient};
use automanager::{logging, AppConfig, Assistant};

mod cli;

use cli::repl::Repl;
use cli::Cli;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match AppConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::from(2);
        }
    };
    if let Some(root) = cli.root {
        config.root = root;
    }
    if let Some(cwd) = cli.cwd {
        config.working_directory = Some(cwd);
    }
    if let Some(level) = cli.log_level {
        config.log.level = level;
    }
    if let Err(e) = config.validate() {
        eprintln!("{}", e);
        return ExitCode::from(2);
    }

    if let Err(e) = logging::init_tracing(&config.log) {
        eprintln!("{}", e);
    }

    let model: Arc<dyn LanguageModel> = match OllamaClient::new(&config.model) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::from(2);
        }
    };
    let assistant = match Assistant::new(&config, model) {
        Ok(assistant) => assistant,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut repl = Repl::new(assistant, cli.yes);
    match cli.exec {
        Some(request) => {
            if repl.handle_request(&request).await {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        None => {
            repl.run().await;
            ExitCode::SUCCESS
        }
    }
}
