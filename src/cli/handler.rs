
use crate::cli::commands::{BuildArgs, CliArgs, CliResult, Commands, DevArgs};
use crate::config::GlobalConfig;
use crate::dev::session::{self, SessionArgs};
use crate::error::Result;
use crate::process::StartOptions;

/// Runs a parsed command line against the loaded configuration
pub struct CliHandler {
    pub config: GlobalConfig,
    pub verbose: bool,
}

impl CliHandler {
    pub fn new(config: GlobalConfig) -> Self {
        Self {
            config,
            verbose: false,
        }
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Main entry point for handling CLI commands
    pub async fn handle_command(&self, args: CliArgs) -> Result<CliResult> {
        match &args.command {
            Commands::Dev(dev) => self.handle_dev(dev).await,
            Commands::Build(build) => self.handle_build(build).await,
        }
    }

    async fn handle_dev(&self, args: &DevArgs) -> Result<CliResult> {
        let session_args = Self::dev_session_args(args)?;
        let code = session::run_dev(&self.config, &session_args).await?;

        Ok(if code == 0 {
            CliResult::Success("Dev server stopped".to_string())
        } else {
            CliResult::Error("Server could not be kept running".to_string())
        })
    }

    async fn handle_build(&self, args: &BuildArgs) -> Result<CliResult> {
        let session_args = SessionArgs {
            dir: args.project.dir.clone(),
            root: args.project.root.clone(),
            tools: args.project.tools.clone(),
            ..SessionArgs::default()
        };
        let outcome = session::run_build(&self.config, &session_args).await?;

        let mut message = format!("Build complete: {}", outcome.output_dir.display());
        if self.verbose {
            for (name, source) in outcome.install_set.iter() {
                message.push_str(&format!("\n  {name} {source}"));
            }
        }
        Ok(CliResult::Success(message))
    }

    pub fn dev_session_args(args: &DevArgs) -> Result<SessionArgs> {
        let custom_args = match &args.custom_args {
            Some(raw) => session::parse_custom_args(raw)?,
            None => Vec::new(),
        };

        Ok(SessionArgs {
            dir: args.project.dir.clone(),
            root: args.project.root.clone(),
            port: args.port,
            tools: args.project.tools.clone(),
            env_file: args.env.clone(),
            start: StartOptions {
                inspect: args.inspect,
                inspect_brk: args.inspect_brk,
                custom_args,
            },
        })
    }
}

/// Create a handler with the verbosity requested on the command line
pub fn create_handler_from_args(config: GlobalConfig, args: &CliArgs) -> CliHandler {
    CliHandler::new(config).with_verbose(args.verbose)
}
