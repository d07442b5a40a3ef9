use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use log::{error, info};

use ttychat::app::ChatSession;
use ttychat::config::{CliArgs, Config};
use ttychat::llm::openai::OpenAiClient;
use ttychat::SerialChannel;

fn main() -> ExitCode {
    env_logger::init();

    let args = CliArgs::parse();
    let config = match Config::load_with_args(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ttychat: {e}");
            return ExitCode::from(2);
        }
    };

    let channel = match SerialChannel::open(&config.device) {
        Ok(channel) => Arc::new(channel),
        Err(e) => {
            error!("{e}");
            eprintln!("ttychat: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        "starting session on {} at {}x{} (refresh {} ms, model {})",
        config.device.display(),
        config.cols,
        config.rows,
        config.refresh_ms,
        config.model
    );

    let client = Box::new(OpenAiClient::from_env(&config.model));
    ChatSession::new(&config, channel, client).run();
    ExitCode::SUCCESS
}
