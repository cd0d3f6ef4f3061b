//! Configuration for gatewayd

use clap::Parser;
use std::path::PathBuf;

/// gatewayd - Zigbee gateway automation daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "gatewayd")]
#[command(about = "Zigbee gateway rules engine and automation store daemon")]
pub struct Config {
    /// Data directory for the durable automation store
    #[arg(short, long, default_value = "./data/gatewayd", env = "GATEWAYD_DATA_DIR")]
    pub data_dir: PathBuf,

    /// Capacity of the rules-engine event queue
    #[arg(long, default_value_t = 16)]
    pub queue_capacity: usize,

    /// Tolerance for numeric equality in rule conditions
    #[arg(long, default_value_t = 1e-6)]
    pub eq_epsilon: f64,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.queue_capacity == 0 {
            anyhow::bail!("queue capacity must be at least 1");
        }
        if !self.eq_epsilon.is_finite() || self.eq_epsilon < 0.0 {
            anyhow::bail!("eq-epsilon must be a non-negative finite number");
        }
        if self.log_format != "pretty" && self.log_format != "json" {
            anyhow::bail!("log format must be 'pretty' or 'json'");
        }
        Ok(())
    }
}
