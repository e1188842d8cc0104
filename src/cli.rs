use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use crate::output::OutputFormat;
use crate::session::RELAY_ENV;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "ecs",
    version,
    about = "A kubectl-style command line for Amazon ECS clusters."
)]
pub struct CliArgs {
    /// Context registry file (defaults to $ECS_CONFIG, then ~/.ecs/config.yaml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// tracing filter (for example: warn,debug,trace)
    #[arg(long, global = true, default_value = "warn")]
    pub log_filter: String,

    /// Session relay executable used by exec and port-forward
    #[arg(long, global = true, env = RELAY_ENV)]
    pub relay: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Modify ecs configuration
    #[command(subcommand)]
    Config(ConfigCommand),

    /// Display one or many resources
    #[command(subcommand)]
    Get(GetCommand),

    /// Show details of a specific resource
    #[command(subcommand)]
    Describe(DescribeCommand),

    /// Set the desired count of a service
    Scale {
        service: String,

        #[arg(long)]
        replicas: u32,
    },

    /// Delete (stop) resources
    #[command(subcommand)]
    Delete(DeleteCommand),

    /// Print the logs of a task container
    Logs {
        task: String,

        /// Follow log output
        #[arg(short, long)]
        follow: bool,

        /// Only return logs newer than a relative duration like 5s, 2m, or 3h [default: 10m]
        #[arg(long, value_parser = parse_duration)]
        since: Option<Duration>,

        #[command(flatten)]
        container: ContainerArg,
    },

    /// Execute a command in a running container
    Exec {
        task: String,

        #[command(flatten)]
        container: ContainerArg,

        /// Command to run, after `--`
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// Forward a local port to a port in a container
    PortForward {
        task: String,

        /// LOCAL_PORT:CONTAINER_PORT
        mapping: String,

        #[command(flatten)]
        container: ContainerArg,
    },

    /// Print version information
    Version,
}

#[derive(Debug, Clone, Args)]
pub struct ContainerArg {
    /// Container name (auto-detected when the task has a single one)
    #[arg(short = 'c', long = "container")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum ConfigCommand {
    /// Create or update a context and make it current
    SetContext {
        name: String,

        #[arg(long)]
        cluster: String,

        #[arg(long, default_value = "default")]
        profile: String,

        #[arg(long, default_value = "us-east-1")]
        region: String,
    },

    /// List all contexts
    GetContexts,

    /// Switch the current context
    UseContext { name: String },

    /// Delete a context
    DeleteContext { name: String },

    /// Display the current context
    CurrentContext,

    /// Display the whole registry
    View,
}

#[derive(Debug, Clone, Subcommand)]
pub enum GetCommand {
    /// List services
    #[command(visible_aliases = ["svc", "svcs", "service"])]
    Services {
        #[arg(short, long, value_enum, default_value_t)]
        output: OutputFormat,
    },

    /// List tasks
    #[command(visible_alias = "task")]
    Tasks {
        #[arg(short, long, value_enum, default_value_t)]
        output: OutputFormat,
    },

    /// List container instances
    #[command(visible_aliases = ["node", "no"])]
    Nodes {
        #[arg(short, long, value_enum, default_value_t)]
        output: OutputFormat,
    },
}

#[derive(Debug, Clone, Subcommand)]
pub enum DescribeCommand {
    /// Describe services (all when no name is given)
    #[command(visible_aliases = ["svc", "service"])]
    Services {
        names: Vec<String>,

        #[arg(short, long, value_enum, default_value_t)]
        output: OutputFormat,
    },

    /// Describe a single task
    Task {
        task: String,

        #[arg(short, long, value_enum, default_value_t)]
        output: OutputFormat,
    },
}

#[derive(Debug, Clone, Subcommand)]
pub enum DeleteCommand {
    /// Stop a task
    Task { task: String },
}

/// Parses `30s`, `10m`, `1h`, `2d` and concatenations such as `1h30m`.
pub fn parse_duration(value: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(value.trim())
}
