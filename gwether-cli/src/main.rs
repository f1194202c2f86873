//! CLI for gwether.
//!
//! Runs the MQTT ingester and inspects the series files it writes.

use std::path::{Path, PathBuf};
use std::sync::{Arc, mpsc};
use std::time::Duration;

use chrono::{Local, TimeZone};
use clap::{Args, Parser, Subcommand, ValueEnum};
use gwether::series_file::SeriesFile;
use gwether::store::DEFAULT_EXTENSION;
use gwether::template::DEFAULT_DATA_SOURCE;
use gwether::transport::{DEFAULT_BROKER, DEFAULT_CLIENT_ID, DEFAULT_TOPIC, DISCONNECT_GRACE, MqttConfig, Transport};
use gwether::{Dispatcher, SeriesStore, SeriesTemplate};
use tracing_subscriber::EnvFilter;

/// gwether — records rtl_433 sensor readings into round-robin series files.
#[derive(Parser)]
#[command(name = "gwether", version, about)]
struct Cli {
    /// Enable debug logging (RUST_LOG overrides).
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Subscribe to the broker and record readings until interrupted.
    Run(RunArgs),

    /// Display the layout and newest sample of a series file.
    Info {
        /// Path to the series file.
        file: PathBuf,

        /// Output format.
        #[arg(long, default_value = "text")]
        format: InfoFormat,
    },

    /// Print samples stored in a series file.
    Fetch {
        /// Path to the series file.
        file: PathBuf,

        /// How far back from the newest sample to read (e.g., "1h", "30m", "7d").
        #[arg(long, default_value = "1h")]
        range: String,

        /// Output format.
        #[arg(long, default_value = "csv")]
        format: OutputFormat,
    },
}

/// Options for `gwether run`.
#[derive(Args)]
struct RunArgs {
    /// MQTT broker address.
    #[arg(long, default_value = DEFAULT_BROKER)]
    broker: String,

    /// MQTT user name.
    #[arg(long, env = "GWETHER_USERNAME")]
    username: Option<String>,

    /// MQTT password.
    #[arg(long, env = "GWETHER_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// MQTT client identifier.
    #[arg(long, default_value = DEFAULT_CLIENT_ID)]
    client_id: String,

    /// Topic carrying rtl_433 events.
    #[arg(long, default_value = DEFAULT_TOPIC)]
    topic: String,

    /// Directory holding the series files.
    #[arg(long, default_value = ".")]
    rrd: PathBuf,

    /// Series file extension.
    #[arg(long, default_value = DEFAULT_EXTENSION)]
    extension: String,

    /// Data source name recorded in new series files.
    #[arg(long, default_value = DEFAULT_DATA_SOURCE)]
    data_source: String,

    /// Sample interval of new series files.
    #[arg(long, default_value = "1m")]
    step: String,

    /// How long new series files keep samples.
    #[arg(long, default_value = "7d")]
    retention: String,

    /// Delivery threads. With more than one, readings of a sensor may be
    /// handled out of order and the older one dropped.
    #[arg(long, default_value = "1")]
    workers: usize,
}

/// Output format for series metadata.
#[derive(Clone, ValueEnum)]
enum InfoFormat {
    /// Human-readable listing.
    Text,
    /// JSON object including the series template.
    Json,
}

/// Output format for fetched samples.
#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Comma-separated values.
    Csv,
    /// JSON array of objects.
    Json,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let result = match cli.command {
        Commands::Run(args) => cmd_run(args),
        Commands::Info { file, format } => cmd_info(&file, &format),
        Commands::Fetch { file, range, format } => cmd_fetch(&file, &range, &format),
    };

    if let Err(e) = result {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Implements `gwether run`.
fn cmd_run(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let template = SeriesTemplate::new(
        &args.data_source,
        parse_duration(&args.step)?,
        parse_duration(&args.retention)?,
    )?;
    let store = SeriesStore::open(&args.rrd, &args.extension, template)?;
    tracing::info!(directory = %args.rrd.display(), extension = %args.extension, "series store ready");

    let dispatcher = Arc::new(Dispatcher::new(store));

    let (shutdown_tx, shutdown_rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(());
    })?;

    let config = MqttConfig {
        broker: args.broker,
        client_id: args.client_id,
        username: args.username,
        password: args.password,
        topic: args.topic,
        workers: args.workers,
        grace: DISCONNECT_GRACE,
        ..MqttConfig::default()
    };

    let mut transport = Transport::connect(config)?;
    transport.subscribe()?;
    transport.run(Arc::clone(&dispatcher), &shutdown_rx)?;

    let flush_failures = dispatcher.flush_all();
    let stats = dispatcher.stats();
    tracing::info!(
        received = stats.received,
        written = stats.written,
        decode_failures = stats.decode_failures,
        write_failures = stats.write_failures,
        series = stats.series_opened,
        "ingestion stopped"
    );

    if flush_failures > 0 {
        return Err(format!("{flush_failures} series could not be flushed to disk").into());
    }
    Ok(())
}

/// Implements `gwether info <file>`.
fn cmd_info(file: &Path, format: &InfoFormat) -> Result<(), Box<dyn std::error::Error>> {
    let series = SeriesFile::open(file)?;
    let template = series.template();
    let samples = series.fetch(i64::MIN, i64::MAX).len();

    match format {
        InfoFormat::Text => {
            println!("Series: {}", file.display());
            println!("  Data source: {}", template.data_source);
            println!("  Step: {}", format_duration_secs(template.step.as_secs()));
            println!("  Retention: {}", format_duration_secs(template.retention.as_secs()));
            println!("  Slots: {}", series.slot_count());
            println!("  Size: {}", format_bytes(series.size_bytes() as u64));

            match series.last_sample() {
                Some((ts, value)) => {
                    println!("  Last update: {}", format_local(ts));
                    println!("  Last value: {value}");
                }
                None => println!("  Last update: never"),
            }
            println!("  Samples held: {samples}");
        }
        InfoFormat::Json => {
            let last = series.last_sample().map(|(ts, value)| {
                serde_json::json!({
                    "timestamp": ts,
                    "time": format_local(ts),
                    "value": value,
                })
            });

            let output = serde_json::json!({
                "series": file.display().to_string(),
                "template": serde_json::to_value(&template)?,
                "slots": series.slot_count(),
                "size_bytes": series.size_bytes(),
                "samples": samples,
                "last": last,
            });

            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

/// Implements `gwether fetch <file>`.
fn cmd_fetch(file: &Path, range: &str, format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let series = SeriesFile::open(file)?;
    let range = i64::try_from(parse_duration(range)?.as_secs())?;

    let end = series.last_update().saturating_add(1);
    let start = end.saturating_sub(range);
    let data = series.fetch(start, end);
    let data_source = series.data_source();

    match format {
        OutputFormat::Csv => {
            println!("# series={}, data_source={data_source}, points={}", file.display(), data.len());
            println!("timestamp,time,value");
            for (ts, value) in &data {
                println!("{ts},{},{value}", format_local(*ts));
            }
        }
        OutputFormat::Json => {
            let json_data: Vec<serde_json::Value> = data
                .iter()
                .map(|(ts, value)| {
                    serde_json::json!({
                        "timestamp": ts,
                        "time": format_local(*ts),
                        "value": value,
                    })
                })
                .collect();

            let output = serde_json::json!({
                "series": file.display().to_string(),
                "data_source": data_source,
                "count": data.len(),
                "data": json_data,
            });

            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

/// Parses a human-readable duration string (e.g., "60s", "1h", "7d").
fn parse_duration(s: &str) -> Result<Duration, Box<dyn std::error::Error>> {
    let s = s.trim();
    if s.is_empty() {
        return Err("Empty duration string".into());
    }

    let unit_len = s.chars().next_back().map_or(0, char::len_utf8);
    let (num_str, unit) = s.split_at(s.len() - unit_len);
    let num: u64 = num_str.parse()?;

    let multiplier = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86400,
        _ => return Err(format!("Unknown duration unit: '{unit}'. Use s, m, h, or d.").into()),
    };

    let secs = num
        .checked_mul(multiplier)
        .ok_or_else(|| format!("Duration '{s}' is too large"))?;
    Ok(Duration::from_secs(secs))
}

/// Formats seconds as a human-readable duration.
fn format_duration_secs(secs: u64) -> String {
    if secs >= 86400 && secs.is_multiple_of(86400) {
        format!("{}d", secs / 86400)
    } else if secs >= 3600 && secs.is_multiple_of(3600) {
        format!("{}h", secs / 3600)
    } else if secs >= 60 && secs.is_multiple_of(60) {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

/// Formats a byte count as a human-readable string.
#[allow(clippy::cast_precision_loss)] // Byte counts are display-only
fn format_bytes(bytes: u64) -> String {
    if bytes >= 1_048_576 {
        format!("{:.1} MB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{bytes} B")
    }
}

/// Formats unix seconds in the reading time layout, in local time.
fn format_local(ts: i64) -> String {
    Local
        .timestamp_opt(ts, 0)
        .earliest()
        .map_or_else(|| ts.to_string(), |t| t.format("%Y-%m-%d %H:%M:%S").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gwether::store::SeriesWriter;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("45s").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration(" 2h ").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("7d").unwrap(), Duration::from_secs(604_800));
    }

    #[test]
    fn test_parse_duration_rejects() {
        for bad in ["", "h", "10", "10w", "-1s", "99999999999999999999d", "5é"] {
            assert!(parse_duration(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn test_format_duration_secs() {
        assert_eq!(format_duration_secs(60), "1m");
        assert_eq!(format_duration_secs(90), "90s");
        assert_eq!(format_duration_secs(7200), "2h");
        assert_eq!(format_duration_secs(604_800), "7d");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(3 * 1_048_576), "3.0 MB");
    }

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["gwether", "run"]).unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.broker, "tcp://localhost:1883");
        assert_eq!(args.client_id, "rrd-writer");
        assert_eq!(args.topic, "rtl_433/cubieboard/events");
        assert_eq!(args.extension, "rrd");
        assert_eq!(args.workers, 1);
        assert!(!cli.debug);
    }

    #[test]
    fn test_info_and_fetch_on_written_series() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = SeriesStore::open(temp_dir.path(), "rrd", SeriesTemplate::default()).unwrap();
        let dispatcher = Dispatcher::new(store);
        dispatcher
            .dispatch(br#"{"time":"2024-01-01 00:00:00","model":"T","id":1,"channel":0,"temperature_C":5.5}"#)
            .unwrap();
        for (_, handle) in dispatcher.cache().handles() {
            handle.flush().unwrap();
        }

        let file = temp_dir.path().join("t-1-0.rrd");
        cmd_info(&file, &InfoFormat::Text).unwrap();
        cmd_info(&file, &InfoFormat::Json).unwrap();
        cmd_fetch(&file, "1h", &OutputFormat::Json).unwrap();
        cmd_fetch(&file, "1h", &OutputFormat::Csv).unwrap();
        assert!(cmd_info(&temp_dir.path().join("missing.rrd"), &InfoFormat::Text).is_err());
    }
}
