//! gatewayd - Zigbee gateway automation daemon
//!
//! Hosts the event bus, device-state cache, durable automation store and
//! the rules engine worker. The radio stack attaches behind the
//! [`gatewayd::zigbee::ZigbeeCommands`] boundary; without one, commands
//! are traced by the log driver.

use clap::Parser;
use gateway_core::{EventBus, StateCache};
use gatewayd::config::Config;
use gatewayd::engine::{EngineOptions, RulesEngine};
use gatewayd::store::RuleStore;
use gatewayd::zigbee::LogDriver;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();

    // Initialize logging
    let default_level = if config.verbose { "debug" } else { "info" };
    let filter = EnvFilter::from_default_env()
        .add_directive(format!("gatewayd={default_level}").parse().unwrap())
        .add_directive(format!("gateway_core={default_level}").parse().unwrap());
    if config.log_format == "json" {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {e}");
        return ExitCode::FAILURE;
    }

    info!(
        "gatewayd v{} - Zigbee gateway automation daemon",
        env!("CARGO_PKG_VERSION")
    );

    let store = match RuleStore::open(&config.data_dir) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("Failed to open rule store: {e}");
            return ExitCode::FAILURE;
        }
    };

    let bus = Arc::new(EventBus::new());
    let states = Arc::new(StateCache::new());
    let engine = RulesEngine::start(
        bus.clone(),
        store,
        states,
        Arc::new(LogDriver),
        EngineOptions {
            queue_capacity: config.queue_capacity,
            eq_epsilon: config.eq_epsilon,
        },
    );

    bus.publish("system.boot", "system", "", 0, "gateway ready", "");

    tokio::signal::ctrl_c().await.ok();
    info!("Received shutdown signal");
    engine.stop().await;

    ExitCode::SUCCESS
}
