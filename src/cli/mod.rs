//! Command line interface for Skylink.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Skylink - vehicle communication links for ground stations
#[derive(Parser, Debug)]
#[command(
    name = "skylink",
    author,
    version,
    about = "Vehicle communication link layer for MAVLink ground stations",
    long_about = r#"
Skylink opens and supervises the links between a ground station and its
vehicles:

  - Serial telemetry radios and USB autopilots
  - UDP listeners (port 14550) and TCP clients (SITL)
  - Recorded telemetry log replay
  - Simulated vehicles for testing

QUICK START:
  skylink config --output skylink.toml
  skylink --config skylink.toml monitor
"#
)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true, default_value = "warn")]
    pub log_level: String,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect the configured links and print their events
    Monitor(MonitorArgs),

    /// List configured links
    Links,

    /// Show example configuration
    Config(ConfigArgs),
}

/// Monitor command arguments
#[derive(Args, Debug)]
pub struct MonitorArgs {
    /// Only connect links with these names (can be specified multiple times)
    #[arg(short = 'n', long = "link")]
    pub links: Vec<String>,

    /// Print every routed frame
    #[arg(long)]
    pub frames: bool,

    /// Seconds between statistics summaries (0 disables)
    #[arg(long, default_value = "5")]
    pub stats_interval: u64,

    /// Do not attach vehicles heard on a link (disables liveness tracking)
    #[arg(long)]
    pub no_attach: bool,
}

/// Config command arguments
#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// Output path
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

/// Output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Format byte count for display.
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;

    if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_monitor() {
        let cli = Cli::parse_from([
            "skylink", "--config", "links.toml", "monitor", "-n", "radio", "--frames",
        ]);
        assert_eq!(cli.config, Some(PathBuf::from("links.toml")));
        match cli.command {
            Commands::Monitor(args) => {
                assert_eq!(args.links, vec!["radio".to_string()]);
                assert!(args.frames);
                assert_eq!(args.stats_interval, 5);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.00 MB");
    }
}
