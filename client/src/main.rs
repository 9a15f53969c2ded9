#![doc = include_str!("../README.md")]

use crate::{cli::CliOpts, config::RuntimeConfig};
use clap::Parser;
use color_eyre::{
	eyre::{eyre, WrapErr},
	Result,
};
use ebft_sync_core::{
	shutdown::Controller,
	utils::{default_subscriber, install_panic_hooks, json_subscriber, spawn_in_span},
};
use std::fs;
use tracing::{error, info, span, Level};
use uuid::Uuid;

mod cli;
mod config;
mod simulation;

pub fn load_runtime_config(opts: &CliOpts) -> Result<RuntimeConfig> {
	let mut cfg = if let Some(config_path) = &opts.config {
		fs::metadata(config_path).map_err(|_| eyre!("Provided config file doesn't exist."))?;
		confy::load_path(config_path)
			.wrap_err(format!("Failed to load configuration from {config_path}"))?
	} else {
		RuntimeConfig::default()
	};

	cfg.log_format_json = opts.logs_json || cfg.log_format_json;
	cfg.log_level = opts.verbosity.unwrap_or(cfg.log_level);

	// Flags override the config parameters
	if let Some(signers) = opts.signers {
		cfg.signers = signers;
	}
	if let Some(byzantine_peers) = opts.byzantine_peers {
		cfg.byzantine_peers = byzantine_peers;
	}
	if let Some(blocks) = opts.blocks {
		cfg.blocks = blocks;
	}
	if let Some(parallelism) = opts.parallelism {
		cfg.sync.parallelism = parallelism;
	}

	if cfg.blocks == 0 {
		return Err(eyre!("At least one block is required"));
	}
	if cfg.sync.parallelism == 0 {
		return Err(eyre!("Fast sync parallelism must be positive"));
	}

	Ok(cfg)
}

#[tokio::main]
pub async fn main() -> Result<()> {
	let shutdown = Controller::new();
	let opts = CliOpts::parse();
	let cfg = load_runtime_config(&opts)?;

	if cfg.log_format_json {
		tracing::subscriber::set_global_default(json_subscriber(cfg.log_level))?;
	} else {
		tracing::subscriber::set_global_default(default_subscriber(cfg.log_level))?;
	};

	// install custom panic hooks
	install_panic_hooks(shutdown.clone())?;

	let execution_id = Uuid::new_v4();
	let span = span!(Level::INFO, "run", execution_id = execution_id.to_string());
	// Do not enter span if logs format is not JSON
	let _enter = if cfg.log_format_json {
		Some(span.enter())
	} else {
		None
	};

	info!(version = clap::crate_version!(), "Running EBFT sync simulation");
	info!("Using config: {cfg:?}");

	// spawn a task to watch for ctrl-c signals from user to trigger the shutdown
	let user_signal_shutdown = shutdown.clone();
	spawn_in_span(async move {
		user_signal_shutdown
			.on_user_signal("User signaled shutdown".to_string())
			.await
	});

	if let Err(error) = simulation::run(cfg, shutdown.clone()).await {
		error!("{error:#}");
		return Err(error.wrap_err("Starting the simulation failed"));
	};

	let reason = shutdown.completed_shutdown().await;
	if reason == simulation::FINAL_HEIGHT_REACHED {
		info!("{reason}");
		return Ok(());
	}

	Err(eyre!(reason).wrap_err("Running the simulation encountered an error"))
}
