use clap::Parser;
use colored::*;
use eyre::{Context, Result, eyre};
use log::info;
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use relayq::config::Config;
use relayq::domain::Priority;
use relayq::scheduler::{DispatchStats, Dispatcher, RateLimitSnapshot};
use relayq::transport::{MockOutcome, MockTransport};

mod cli;

use cli::Cli;
use cli::commands::{Commands, ConfigCommands};

fn setup_logging(config: &Config, verbose: bool) -> Result<()> {
    // Create log directory
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("relayq")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("relayq.log");

    // Setup env_logger with file output
    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    let default_level = if verbose {
        "debug"
    } else {
        config.log_level.as_deref().unwrap_or("info")
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

fn run_application(cli: &Cli, config: &Config) -> Result<()> {
    info!("Starting application");

    if cli.is_verbose() {
        println!("{}", "Verbose mode enabled".yellow());
    }

    match &cli.command {
        Commands::Simulate {
            messages,
            fail_every,
            rate_limit_every,
            retry_after_ms,
            duration_ms,
            json,
        } => {
            let options = SimulateOptions {
                messages: *messages,
                fail_every: *fail_every,
                rate_limit_every: *rate_limit_every,
                retry_after: Duration::from_millis(*retry_after_ms),
                deadline: Duration::from_millis(*duration_ms),
            };
            handle_simulate_command(&options, *json, config)
        }
        Commands::Config { command } => handle_config_command(command, config),
    }
}

struct SimulateOptions {
    messages: usize,
    fail_every: Option<usize>,
    rate_limit_every: Option<usize>,
    retry_after: Duration,
    deadline: Duration,
}

#[derive(Debug, Serialize)]
struct SimulationSummary {
    messages: usize,
    completed: usize,
    pending: usize,
    timed_out: bool,
    elapsed_ms: u64,
    stats: DispatchStats,
    limiter: RateLimitSnapshot,
}

fn handle_simulate_command(options: &SimulateOptions, json: bool, config: &Config) -> Result<()> {
    info!(
        "Simulating {} messages (fail_every={:?}, rate_limit_every={:?})",
        options.messages, options.fail_every, options.rate_limit_every
    );

    let report = config.validate();
    report.log();
    if report.has_errors() {
        return Err(eyre!("Invalid configuration: {}", report.errors.join("; ")));
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    let summary = runtime.block_on(run_simulation(options, config))?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&summary).context("Failed to serialize simulation summary")?
        );
    } else {
        print_summary(&summary);
    }
    Ok(())
}

async fn run_simulation(options: &SimulateOptions, config: &Config) -> Result<SimulationSummary> {
    let mut transport = MockTransport::new().with_latency(Duration::from_millis(2));
    if let Some(every) = options.rate_limit_every {
        transport = transport.with_fault_every(every, MockOutcome::RateLimited(Some(options.retry_after)));
    }
    if let Some(every) = options.fail_every {
        transport = transport.with_fault_every(every, MockOutcome::Transient("simulated send failure".to_string()));
    }

    let dispatcher = Dispatcher::new(transport, config.dispatcher_config());
    dispatcher.start().context("Failed to start dispatcher")?;

    let started = Instant::now();
    let completed = Arc::new(AtomicUsize::new(0));
    let destination = Arc::new("simulated-channel".to_string());

    for i in 0..options.messages {
        let priority = Priority::ALL[i % Priority::ALL.len()];
        let done = Arc::clone(&completed);
        dispatcher.enqueue_with_callback(
            format!("message-{:05}", i),
            Arc::clone(&destination),
            priority,
            move |_| {
                done.fetch_add(1, Ordering::SeqCst);
            },
        );
    }

    while completed.load(Ordering::SeqCst) < options.messages && started.elapsed() < options.deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let finished = completed.load(Ordering::SeqCst);
    let timed_out = finished < options.messages;
    if timed_out {
        log::warn!("Simulation deadline reached with {} messages outstanding", options.messages - finished);
    }

    dispatcher.stop().await;

    Ok(SimulationSummary {
        messages: options.messages,
        completed: finished,
        pending: dispatcher.queue_size(),
        timed_out,
        elapsed_ms: started.elapsed().as_millis() as u64,
        stats: dispatcher.stats(),
        limiter: dispatcher.rate_limiter().snapshot(),
    })
}

fn print_summary(summary: &SimulationSummary) {
    let stats = &summary.stats;
    let headline = if summary.timed_out {
        "Simulation timed out".yellow()
    } else {
        "Simulation complete".green()
    };
    println!("{} in {}ms", headline, summary.elapsed_ms);
    println!("  {:<18} {}", "Messages:", summary.messages);
    println!("  {:<18} {}", "Delivered:".green(), stats.sent);
    println!("  {:<18} {}", "Failed:".red(), stats.failed);
    println!("  {:<18} {}", "Retried:", stats.retried);
    println!("  {:<18} {}", "Rate limited:".yellow(), stats.rate_limited);
    println!("  {:<18} {}", "Transient errors:", stats.transient_errors);
    println!("  {:<18} {}", "Rejected:", stats.rejected);
    println!("  {:<18} {}", "Peak queue depth:", stats.peak_queue_depth);
    println!("  {:<18} {}", "Still queued:", summary.pending);
    println!(
        "  {:<18} {}/{} remaining, {} consecutive errors",
        "Limiter:", summary.limiter.remaining, summary.limiter.max_per_window, summary.limiter.consecutive_errors
    );
}

fn handle_config_command(command: &ConfigCommands, config: &Config) -> Result<()> {
    info!("Handling config command: {:?}", command);
    match command {
        ConfigCommands::Check => {
            let report = config.validate();
            report.log();
            for warning in &report.warnings {
                println!("{} {}", "warning:".yellow(), warning);
            }
            for error in &report.errors {
                println!("{} {}", "error:".red(), error);
            }
            if report.has_errors() {
                return Err(eyre!("Configuration has {} error(s)", report.errors.len()));
            }
            if report.is_clean() {
                println!("{}", "Configuration OK".green());
            }
            Ok(())
        }
        ConfigCommands::Show => {
            let yaml = config.to_yaml().context("Failed to render configuration")?;
            print!("{}", yaml);
            Ok(())
        }
    }
}

fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(cli.config.as_ref())
        .with_context(|| format!("Failed to load configuration from {:?}", cli.config))?;

    // Logging level comes from config, so it starts after the load
    setup_logging(&config, cli.is_verbose()).context("Failed to setup logging")?;

    info!("Starting with config from: {:?}", cli.config);

    // Run the main application logic
    run_application(&cli, &config).context("Application failed")?;

    Ok(())
}
