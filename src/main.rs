use clap::Parser;
use devserve::cli::{CliArgs, CliResult, create_handler_from_args};
use devserve::config::GlobalConfig;
use devserve::logging;
use std::process;

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();

    let mut global_config = match GlobalConfig::load().await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Warning: Failed to load global configuration, using defaults: {e}");
            GlobalConfig::default()
        }
    };

    if args.verbose && !matches!(global_config.logging.level.as_str(), "debug" | "trace") {
        global_config.logging.level = "debug".to_string();
    }

    if let Err(e) = logging::init_logging(&global_config) {
        eprintln!("Warning: Failed to initialize logging: {e}");
    }

    let handler = create_handler_from_args(global_config, &args);

    let result = match handler.handle_command(args).await {
        Ok(result) => result,
        Err(e) => CliResult::Error(e.to_string()),
    };

    match &result {
        CliResult::Success(msg) => println!("{msg}"),
        CliResult::Error(_) => eprintln!("{result}"),
    }
    process::exit(result.exit_code());
}
