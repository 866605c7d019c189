use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use faultlab_runner::{
    load_config, CancellationToken, DockerImageBuilder, DockerLauncher, HarnessConfig, LogSink,
    OutcomeLedger, ProvisionError, RunController,
};

#[derive(Parser)]
#[command(
    name = "faultlab",
    version = "0.1.0",
    about = "Crash reproduction grid harness"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the sandbox image and drive trials until interrupted.
    Run {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        image: Option<String>,
        #[arg(long)]
        log_file: Option<PathBuf>,
        #[arg(long)]
        iterations: Option<u64>,
        #[arg(long)]
        json: bool,
    },
    /// Print the resolved trial plan without running anything.
    Describe {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    match run_command(cli.command) {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if let Some(provision) = err.downcast_ref::<ProvisionError>() {
                eprintln!("error: {}", err);
                std::process::exit(provision.exit_status());
            }
            if json_mode {
                emit_json(&json_error("command_failed", err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            config,
            image,
            log_file,
            iterations,
            json,
        } => {
            let config = resolve_config(config.as_deref(), image, log_file, iterations)?;
            let grid = config.grid()?;
            let mut ledger = OutcomeLedger::new(grid);
            let mut sink = LogSink::create(&config.log_file)?;

            let token = CancellationToken::new();
            let handler_token = token.clone();
            ctrlc::set_handler(move || handler_token.cancel())?;

            let provisioner = DockerImageBuilder::new(&config);
            let launcher = DockerLauncher::new(&config);
            let mut controller = RunController::new(provisioner, launcher, grid, token)
                .with_max_iterations(config.iterations);
            let summary = controller.run(&mut ledger, &mut sink)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "summary": summary_to_json(&config, grid.cell_count()),
                    "run": {
                        "iterations_started": summary.iterations_started,
                        "trials_recorded": summary.trials_recorded,
                        "interrupted": summary.interrupted,
                    }
                })));
            }
            println!("iterations_started: {}", summary.iterations_started);
            println!("trials_recorded: {}", summary.trials_recorded);
            println!("interrupted: {}", summary.interrupted);
        }
        Commands::Describe { config, json } => {
            let config = resolve_config(config.as_deref(), None, None, None)?;
            let grid = config.grid()?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "summary": summary_to_json(&config, grid.cell_count())
                })));
            }
            print_summary(&config, grid.cell_count());
        }
    }
    Ok(None)
}

fn resolve_config(
    path: Option<&Path>,
    image: Option<String>,
    log_file: Option<PathBuf>,
    iterations: Option<u64>,
) -> Result<HarnessConfig> {
    let mut config = match path {
        Some(path) => load_config(path)?,
        None => HarnessConfig::default(),
    };
    if let Some(image) = image {
        config.image = image;
    }
    if let Some(log_file) = log_file {
        config.log_file = log_file;
    }
    if let Some(iterations) = iterations {
        config.iterations = Some(iterations);
    }
    config.validate()?;
    Ok(config)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. } | Commands::Describe { json, .. } => *json,
    }
}

fn summary_to_json(config: &HarnessConfig, cells: usize) -> Value {
    json!({
        "image": config.image,
        "entry_command": config.entry_command,
        "build_context": config.build_context.display().to_string(),
        "log_file": config.log_file.display().to_string(),
        "gst_debug": config.gst_debug,
        "gpus": config.gpus,
        "thread_counts": format!("{}..{}", config.thread_counts.min, config.thread_counts.max),
        "encoders_per_pipeline": format!(
            "{}..{}",
            config.encoders_per_pipeline.min, config.encoders_per_pipeline.max
        ),
        "cells": cells,
        "iterations": config.iterations,
    })
}

fn print_summary(config: &HarnessConfig, cells: usize) {
    println!("image: {}", config.image);
    println!("entry_command: {}", config.entry_command);
    println!("build_context: {}", config.build_context.display());
    println!("log_file: {}", config.log_file.display());
    println!("gst_debug: {}", config.gst_debug);
    println!("gpus: {}", config.gpus);
    println!(
        "thread_counts: {}..{}",
        config.thread_counts.min, config.thread_counts.max
    );
    println!(
        "encoders_per_pipeline: {}..{}",
        config.encoders_per_pipeline.min, config.encoders_per_pipeline.max
    );
    println!("cells: {}", cells);
    match config.iterations {
        Some(cap) => println!("iterations: {}", cap),
        None => println!("iterations: unbounded"),
    }
}
