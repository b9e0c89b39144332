//! Command-line interface argument parsing.
//!
//! This module handles all CLI argument parsing using clap,
//! including validation and default values.

use clap::Parser;
use std::path::PathBuf;

/// Crowdpipe - YAML-driven crowdsourcing pipelines
///
/// Provision projects, pools and trainings on a crowdsourcing platform
/// from declarative YAML, then route completed assignments between pools
/// until the pipeline drains.
///
/// Examples:
///   crowdpipe --pipeline pipeline.yaml
///   crowdpipe --pipeline pipeline.yaml --credentials creds.json --allow-low-reward
///   crowdpipe --pipeline pipeline.yaml --dry-run
///   crowdpipe --suggest-reward 30
///   crowdpipe --init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    /// Pipeline YAML file describing tasks and actions
    ///
    /// Not required when using --init-config or --suggest-reward.
    #[arg(
        short,
        long,
        value_name = "FILE",
        required_unless_present_any = ["init_config", "suggest_reward"]
    )]
    pub pipeline: Option<PathBuf>,

    /// Credentials file (JSON with token, mode and API URLs)
    #[arg(short, long, default_value = "creds.json", value_name = "FILE")]
    pub credentials: PathBuf,

    /// OAuth token for the platform API
    ///
    /// Overrides the token in the credentials file.
    #[arg(long, env = "CROWDPIPE_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Seconds between poll cycles
    #[arg(long, default_value = "15", value_name = "SECS")]
    pub poll_interval: u64,

    /// Proceed even when a pool's reward fails the fair-wage check
    #[arg(long)]
    pub allow_low_reward: bool,

    /// Keep running after the sequence completes
    #[arg(long)]
    pub no_exit: bool,

    /// Validate the pipeline and print the pool table without any API calls
    #[arg(long)]
    pub dry_run: bool,

    /// Generate starter pipeline and task configuration files
    #[arg(long)]
    pub init_config: bool,

    /// Print a fair reward per assignment for the given seconds per task
    /// suite and exit
    #[arg(long, value_name = "SECS")]
    pub suggest_reward: Option<u32>,

    /// Enable verbose logging output
    #[arg(short, long)]
    pub verbose: bool,

    /// Run in quiet mode (minimal output)
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        if self.poll_interval == 0 {
            return Err("Poll interval must be at least 1 second".to_string());
        }

        if let Some(seconds) = self.suggest_reward {
            if seconds == 0 {
                return Err("Seconds per task suite must be at least 1".to_string());
            }
        }

        if self.init_config || self.suggest_reward.is_some() {
            return Ok(());
        }

        if let Some(ref pipeline) = self.pipeline {
            if !pipeline.exists() {
                return Err(format!("Pipeline file does not exist: {}", pipeline.display()));
            }
        }

        if !self.dry_run && self.token.is_none() && !self.credentials.exists() {
            return Err(format!(
                "Credentials file does not exist: {} (or set CROWDPIPE_TOKEN)",
                self.credentials.display()
            ));
        }

        Ok(())
    }

    /// Returns the log level based on verbosity settings.
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_args() -> Args {
        Args {
            pipeline: Some(PathBuf::from("pipeline.yaml")),
            credentials: PathBuf::from("creds.json"),
            token: Some("token".to_string()),
            poll_interval: 15,
            allow_low_reward: false,
            no_exit: false,
            dry_run: true,
            init_config: false,
            suggest_reward: None,
            verbose: false,
            quiet: false,
        }
    }

    #[test]
    fn test_validation_conflicting_options() {
        let mut args = make_args();
        args.verbose = true;
        args.quiet = true;
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_validation_poll_interval() {
        let mut args = make_args();
        args.poll_interval = 0;
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_validation_missing_pipeline() {
        let mut args = make_args();
        args.pipeline = Some(PathBuf::from("/nonexistent/pipeline.yaml"));
        assert!(args.validate().is_err());

        // Utility flags skip the pipeline check entirely.
        args.suggest_reward = Some(30);
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_log_level() {
        let mut args = make_args();
        assert_eq!(args.log_level(), tracing::Level::INFO);

        args.verbose = true;
        assert_eq!(args.log_level(), tracing::Level::DEBUG);

        args.verbose = false;
        args.quiet = true;
        assert_eq!(args.log_level(), tracing::Level::ERROR);
    }
}
