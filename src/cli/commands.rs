#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dev_args_parsing() {
        let args = CliArgs::try_parse_from([
            "devserve",
            "dev",
            "--dir",
            "src/api",
            "--port",
            "5000",
            "--tools",
            "lib/tools/*",
            "--tools",
            "extra/*",
            "--env",
            ".env.test",
            "--inspect",
        ])
        .unwrap();
        match args.command {
            Commands::Dev(dev) => {
                assert_eq!(dev.project.dir, Some(PathBuf::from("src/api")));
                assert_eq!(dev.port, Some(5000));
                assert_eq!(dev.project.tools, vec!["lib/tools/*", "extra/*"]);
                assert_eq!(dev.env, Some(".env.test".to_string()));
                assert!(dev.inspect);
                assert!(!dev.inspect_brk);
                assert!(dev.custom_args.is_none());
            }
            _ => panic!("Expected Dev command"),
        }
    }

    #[test]
    fn test_comma_separated_tools() {
        let args =
            CliArgs::try_parse_from(["devserve", "build", "--tools", "a/*,b/*", "--root", "/w"])
                .unwrap();
        match args.command {
            Commands::Build(build) => {
                assert_eq!(build.project.tools, vec!["a/*", "b/*"]);
                assert_eq!(build.project.root, Some(PathBuf::from("/w")));
            }
            _ => panic!("Expected Build command"),
        }
    }

    #[test]
    fn test_custom_args_take_a_single_value() {
        let args = CliArgs::try_parse_from([
            "devserve",
            "dev",
            "--custom-args",
            "--enable-source-maps --trace-warnings",
        ])
        .unwrap();
        match args.command {
            Commands::Dev(dev) => assert_eq!(
                dev.custom_args.as_deref(),
                Some("--enable-source-maps --trace-warnings")
            ),
            _ => panic!("Expected Dev command"),
        }
    }

    #[test]
    fn test_invalid_port_is_rejected() {
        assert!(CliArgs::try_parse_from(["devserve", "dev", "--port", "http"]).is_err());
    }
}

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// devserve - bundle a Node server and keep it running while you edit
#[derive(Parser, Debug)]
#[command(name = "devserve")]
#[command(about = "Bundles a Node server with its workspace packages and supervises it")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct CliArgs {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build, start and watch the development server
    Dev(DevArgs),

    /// Bundle the server and install its dependencies once
    Build(BuildArgs),
}

/// Where the project lives.
#[derive(Args, Debug, Clone, Default)]
pub struct ProjectArgs {
    /// Server source directory (defaults to src/server)
    #[arg(short, long)]
    pub dir: Option<PathBuf>,

    /// Project root (defaults to current directory)
    #[arg(short, long)]
    pub root: Option<PathBuf>,

    /// Extra tool path patterns, comma separated or repeated
    #[arg(short, long, value_delimiter = ',')]
    pub tools: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct DevArgs {
    #[command(flatten)]
    pub project: ProjectArgs,

    /// Port for the server
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Env file to load instead of .env, .env.local and .env.development
    #[arg(short, long)]
    pub env: Option<String>,

    /// Start node with --inspect
    #[arg(long)]
    pub inspect: bool,

    /// Start node with --inspect-brk
    #[arg(long = "inspect-brk")]
    pub inspect_brk: bool,

    /// Extra node arguments, as one shell-quoted string
    #[arg(long = "custom-args", allow_hyphen_values = true)]
    pub custom_args: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct BuildArgs {
    #[command(flatten)]
    pub project: ProjectArgs,
}

/// Outcome of a command, printed by the binary
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliResult {
    Success(String),
    Error(String),
}

impl CliResult {
    pub fn exit_code(&self) -> i32 {
        match self {
            CliResult::Success(_) => 0,
            CliResult::Error(_) => 1,
        }
    }
}

impl std::fmt::Display for CliResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliResult::Success(msg) => write!(f, "{msg}"),
            CliResult::Error(msg) => write!(f, "Error: {msg}"),
        }
    }
}
