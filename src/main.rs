//! Edge Sensor Copilot CLI
//!
//! Windowed sensor aggregation and operator chat for edge telemetry.

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use edge_sensor_copilot::{
    bus::{pump_lines, BusMessage, LocalBus},
    core::classifier::deviation_ratio,
    pipeline::{drain_pending, spawn_dispatch_loop, SensorSummary},
    Config, Pipeline, VERSION,
};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "edge-copilot")]
#[command(version = VERSION)]
#[command(about = "Windowed sensor aggregation and operator chat for edge telemetry", long_about = None)]
struct Cli {
    /// Configuration file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline headless on a JSON-lines bus feed
    Run {
        /// Feed file of {"topic", "payload"} lines ("-" for stdin)
        #[arg(long, default_value = "-")]
        input: String,

        /// Seconds between status lines
        #[arg(long, default_value = "10")]
        status_interval: u64,
    },

    /// Run the pipeline with the HTTP/WebSocket chat server
    Serve {
        /// Port to listen on (defaults to the configured web port)
        #[arg(long)]
        port: Option<u16>,

        /// Address to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Feed file of {"topic", "payload"} lines ("-" for stdin)
        #[arg(long, default_value = "-")]
        input: String,
    },

    /// Replay a recorded feed, then print summaries and answers
    Replay {
        /// Feed file of {"topic", "payload"} lines
        file: PathBuf,

        /// Questions to ask after the feed has been processed
        #[arg(long, short)]
        question: Vec<String>,
    },

    /// Classify a single value against the configured thresholds
    Classify {
        /// Sensor type, e.g. temperature
        sensor_type: String,

        /// Reading value
        value: f64,
    },

    /// Show configuration
    Config {
        /// Write the effective configuration to the default location
        #[arg(long)]
        save: bool,
    },
}

fn main() {
    init_tracing();
    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e:#}");
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run {
            input,
            status_interval,
        } => cmd_run(config, &input, status_interval),
        Commands::Serve { port, host, input } => cmd_serve(config, port, &host, &input),
        Commands::Replay { file, question } => cmd_replay(config, &file, &question),
        Commands::Classify { sensor_type, value } => {
            cmd_classify(&config, &sensor_type, value);
            Ok(())
        }
        Commands::Config { save } => cmd_config(&config, save),
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

/// Log to stderr, filtered by `RUST_LOG` (default `info`).
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(path) => {
            Config::load_from(path).with_context(|| format!("reading {}", path.display()))
        }
        None => Ok(Config::load()?),
    }
}

/// Open a feed, with "-" meaning stdin.
fn open_feed(input: &str) -> anyhow::Result<Box<dyn BufRead + Send>> {
    if input == "-" {
        return Ok(Box::new(BufReader::new(std::io::stdin())));
    }
    let file = File::open(input).with_context(|| format!("opening feed {input}"))?;
    Ok(Box::new(BufReader::new(file)))
}

/// Pump `input` onto `bus` from a background thread.
fn spawn_feed(input: &str, bus: Arc<LocalBus>) -> anyhow::Result<thread::JoinHandle<usize>> {
    let reader = open_feed(input)?;
    Ok(thread::spawn(move || {
        let published = pump_lines(reader, bus.as_ref());
        tracing::info!(published, "bus feed finished");
        published
    }))
}

fn cmd_run(config: Config, input: &str, status_interval: u64) -> anyhow::Result<()> {
    let bus = Arc::new(LocalBus::new());
    let pipeline = Pipeline::new(config, bus.clone());
    let receiver = bus.subscribe(&pipeline.subscriptions());

    println!("Edge Sensor Copilot v{VERSION}");
    println!("Node: {}", pipeline.config().node_id);
    println!("Subscribed to: {}", pipeline.subscriptions().join(", "));
    println!("Press Ctrl+C to stop.");
    println!();

    let running = Arc::new(AtomicBool::new(true));
    ctrlc_handler(running.clone());

    let dispatch = spawn_dispatch_loop(pipeline.dispatcher(), receiver.clone(), running.clone());
    let feed = spawn_feed(input, bus.clone())?;

    let interval = Duration::from_secs(status_interval.max(1));
    let mut last_status = std::time::Instant::now();
    while running.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(100));
        pipeline.correlator().expire_overdue(Utc::now());

        if last_status.elapsed() >= interval {
            print_status_line(&pipeline);
            last_status = std::time::Instant::now();
        }
        if feed.is_finished() && bus_drained(&bus, &dispatch) {
            break;
        }
    }

    running.store(false, Ordering::SeqCst);
    let mut handled = dispatch.join().unwrap_or(0);
    // Analyses published while handling the last readings may still be queued
    handled += drain_pending(&pipeline.dispatcher(), &receiver);
    println!();
    println!("Handled {handled} bus messages.");
    println!("{}", pipeline.stats().summary());
    Ok(())
}

// The feed is done and the dispatcher has nothing queued.
fn bus_drained(bus: &LocalBus, dispatch: &thread::JoinHandle<u64>) -> bool {
    dispatch.is_finished() || bus.pending() == 0
}

fn print_status_line(pipeline: &Pipeline) {
    let snapshot = pipeline.context().build_default();
    let label = snapshot
        .primary()
        .map(|w| w.label())
        .unwrap_or_else(|| "window".to_string());
    let readings = snapshot.primary().map(|w| w.total_readings).unwrap_or(0);
    println!(
        "[{}] {} readings, {} anomalies in the {}",
        Utc::now().format("%H:%M:%S"),
        readings,
        snapshot.total_anomaly_count,
        label
    );
}

#[cfg(feature = "server")]
fn cmd_serve(config: Config, port: Option<u16>, host: &str, input: &str) -> anyhow::Result<()> {
    use edge_sensor_copilot::server::{run, ServerConfig};

    let host: std::net::IpAddr = host.parse().with_context(|| format!("invalid host {host}"))?;
    let port = port.unwrap_or(config.web_port);

    let bus = Arc::new(LocalBus::new());
    let pipeline = Arc::new(Pipeline::new(config, bus.clone()));
    let receiver = bus.subscribe(&pipeline.subscriptions());

    let running = Arc::new(AtomicBool::new(true));
    let dispatch = spawn_dispatch_loop(pipeline.dispatcher(), receiver, running.clone());
    let _feed = spawn_feed(input, bus)?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let (addr, shutdown_tx) =
            run(ServerConfig::new(port).with_host(host), pipeline.clone()).await?;
        println!("Edge Sensor Copilot v{VERSION} serving on http://{addr}");
        println!("Press Ctrl+C to stop.");

        tokio::signal::ctrl_c().await?;
        let _ = shutdown_tx.send(());
        anyhow::Ok(())
    })?;

    running.store(false, Ordering::SeqCst);
    let _ = dispatch.join();
    println!("{}", pipeline.stats().summary());
    Ok(())
}

#[cfg(not(feature = "server"))]
fn cmd_serve(_config: Config, _port: Option<u16>, _host: &str, _input: &str) -> anyhow::Result<()> {
    anyhow::bail!("this build has no server; rebuild with `--features server`")
}

fn cmd_replay(config: Config, file: &Path, questions: &[String]) -> anyhow::Result<()> {
    let bus = Arc::new(LocalBus::new());
    let pipeline = Pipeline::new(config, bus.clone());
    let receiver = bus.subscribe(&pipeline.subscriptions());
    let dispatcher = pipeline.dispatcher();

    let reader =
        BufReader::new(File::open(file).with_context(|| format!("opening {}", file.display()))?);
    let published = pump_lines(reader, bus.as_ref());

    // Analyses published while dispatching land back on the queue
    let handled = drain_pending(&dispatcher, &receiver);

    println!("Replayed {published} lines, handled {handled} bus messages.");
    println!();
    print_sensor_summary(&pipeline.sensor_summary());

    for question in questions {
        println!();
        println!("Q: {question}");
        match pipeline.correlator().ask(question) {
            Ok(reply) => println!("A: {}", reply.message),
            Err(e) => println!("A: ({e})"),
        }
        // Chat requests go to the bus; nothing answers them in a replay.
        while let Ok(BusMessage { topic, .. }) = receiver.try_recv() {
            tracing::debug!(topic, "unanswered during replay");
        }
    }

    println!();
    println!("{}", pipeline.stats().summary());
    Ok(())
}

fn print_sensor_summary(summary: &SensorSummary) {
    match summary {
        SensorSummary::Empty { message } => println!("{message}"),
        SensorSummary::Window {
            window, sensors, ..
        } => {
            println!("Sensor summary ({window}):");
            for (sensor_type, status) in sensors {
                println!(
                    "  {:<12} {:>5} readings  avg {:>8} {}  min {:>8}  max {:>8}  anomalies {:>3}  [{}]",
                    sensor_type,
                    status.count,
                    status.avg,
                    status.unit,
                    status.min,
                    status.max,
                    status.anomalies,
                    status.severity
                );
            }
        }
    }
}

fn cmd_classify(config: &Config, sensor_type: &str, value: f64) {
    let classifier = edge_sensor_copilot::core::Classifier::from_config(config);
    let severity = classifier.classify(sensor_type, value);

    println!("Sensor type: {sensor_type}");
    println!("Value: {value}");
    match classifier.thresholds(sensor_type) {
        Some(thresholds) => {
            println!(
                "Normal range: {} to {} {}",
                thresholds.min, thresholds.max, thresholds.unit
            );
            println!("Deviation: {:.3}", deviation_ratio(value, thresholds));
        }
        None => println!("Normal range: not configured (permissive)"),
    }
    println!("Severity: {severity}");
}

fn cmd_config(config: &Config, save: bool) -> anyhow::Result<()> {
    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file: {:?}", Config::config_path());
    println!();
    println!("{}", serde_json::to_string_pretty(config)?);

    if save {
        config.save()?;
        println!();
        println!("Saved to {:?}", Config::config_path());
    }
    Ok(())
}

/// Set up Ctrl+C handler.
fn ctrlc_handler(running: Arc<AtomicBool>) {
    if let Err(e) = ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    }) {
        eprintln!("Warning: could not install Ctrl+C handler: {e}");
    }
}
