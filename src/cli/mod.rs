//! Command-line interface for htraced.

use crate::core::{Config, HtracedError, Result};
use crate::server::Daemon;
use clap::Parser;
use std::path::PathBuf;

/// Trace span daemon with sharded on-disk storage.
#[derive(Parser, Debug)]
#[command(name = "htraced")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path (key=value lines)
    #[arg(short, long, env = "HTRACED_CONF_FILE")]
    pub config: Option<PathBuf>,

    /// Configuration overrides: -Dkey=value, or -Dkey for key=true
    #[arg(short = 'D', value_name = "KEY[=VALUE]")]
    pub defines: Vec<String>,

    /// Validate configuration and exit
    #[arg(long)]
    pub check_config: bool,
}

impl Cli {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Cli::parse()
    }

    /// Load configuration with proper precedence:
    /// 1. -D defines (highest priority)
    /// 2. Config file
    /// 3. Defaults (lowest priority)
    pub fn load_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::new(),
        };
        config.apply_defines(&self.defines);
        Ok(config)
    }

    /// Initialize logging based on configuration.
    pub fn init_logging(&self, config: &Config) -> Result<()> {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.log_level()));

        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .compact();

        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init()
            .map_err(|e| HtracedError::config(format!("Failed to initialize logging: {}", e)))?;

        Ok(())
    }
}

/// Execute the htraced daemon.
pub async fn execute(cli: Cli) -> Result<()> {
    let config = cli.load_config()?;
    cli.init_logging(&config)?;

    if cli.check_config {
        config.validate()?;
        println!("Configuration is valid!");
        println!("  web address:  {}", config.web_address());
        println!("  hrpc address: {}", config.hrpc_address());
        println!("  shard dirs:   {}", config.data_store_directories().join(";"));
        return Ok(());
    }

    let daemon = Daemon::new(config)?;
    daemon.run().await
}
