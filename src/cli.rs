//! CLI argument parsing for jmx-collector
//!
//! # Options
//!
//! - `--config` / `-c`: Configuration file path (default: config.yaml, env: JMX_COLLECTOR_CONFIG)
//! - `--port` / `-p`: Server port (overrides config file, env: JMX_COLLECTOR_PORT)
//! - `--log-level` / `-l`: Log level (trace/debug/info/warn/error, env: JMX_COLLECTOR_LOG_LEVEL)
//! - `--log-format`: Log output format (text/json, overrides config file)
//!
//! # Commands
//!
//! - `collect` (default): run the collection loop
//! - `list <action>`: print what a match pass selects, then exit
//! - `validate`: check the configuration without connecting anywhere

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::config::LogFormat;
use crate::instance::Action;

/// jmx-collector - periodic JMX metrics collection agent
///
/// Discovers MBeans through Jolokia, selects attributes with declarative
/// include/exclude filters and reports them as metric points.
#[derive(Parser, Debug)]
#[command(name = "jmx-collector")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        value_name = "FILE",
        default_value = "config.yaml",
        env = "JMX_COLLECTOR_CONFIG",
        global = true
    )]
    pub config: PathBuf,

    /// Server port (overrides config file)
    #[arg(short, long, value_name = "PORT", env = "JMX_COLLECTOR_PORT", global = true)]
    pub port: Option<u16>,

    /// Log level
    #[arg(
        short,
        long,
        value_enum,
        default_value = "info",
        env = "JMX_COLLECTOR_LOG_LEVEL",
        global = true
    )]
    pub log_level: LogLevel,

    /// Log output format (overrides config file)
    #[arg(long, value_enum, global = true)]
    pub log_format: Option<LogFormat>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

impl Cli {
    /// Selected command, `collect` when none is given
    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Collect)
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the collection loop
    Collect,

    /// Print the attributes a match pass selects and exit
    List {
        #[arg(value_enum)]
        action: ListAction,

        #[arg(long, value_enum, default_value = "text")]
        output_format: OutputFormat,
    },

    /// Validate the configuration and exit
    Validate {
        #[arg(long, value_enum, default_value = "text")]
        output_format: OutputFormat,
    },
}

/// Listing actions
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum ListAction {
    #[value(name = "list_everything")]
    ListEverything,
    #[value(name = "list_collected_attributes")]
    ListCollectedAttributes,
    #[value(name = "list_matching_attributes")]
    ListMatchingAttributes,
    #[value(name = "list_not_matching_attributes")]
    ListNotMatchingAttributes,
    #[value(name = "list_limited_attributes")]
    ListLimitedAttributes,
}

impl From<ListAction> for Action {
    fn from(action: ListAction) -> Self {
        match action {
            ListAction::ListEverything => Action::ListEverything,
            ListAction::ListCollectedAttributes => Action::ListCollectedAttributes,
            ListAction::ListMatchingAttributes => Action::ListMatchingAttributes,
            ListAction::ListNotMatchingAttributes => Action::ListNotMatchingAttributes,
            ListAction::ListLimitedAttributes => Action::ListLimitedAttributes,
        }
    }
}

/// Log level options
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    /// Trace level - most verbose
    Trace,
    /// Debug level
    Debug,
    /// Info level - default
    Info,
    /// Warn level
    Warn,
    /// Error level - least verbose
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

/// Output format options for `list` and `validate`
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output
    Json,
    /// YAML output
    Yaml,
}
