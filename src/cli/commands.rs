use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::cli::args::{Cli, Commands};
use crate::config::PipelineConfig;
use crate::error::{ProcessingError, Result};
use crate::models::AggregateRecord;
use crate::pipeline::{MemoryTopics, Pipeline, PipelineStats};
use crate::readers::{ReadingReader, StationReader};
use crate::store::{MetadataTable, StateStore};
use crate::utils::progress::ProgressReporter;

const DRAIN_CHECK_INTERVAL: Duration = Duration::from_millis(50);

/// Install the global subscriber. `RUST_LOG` wins over `--verbose`.
pub fn init_logging(verbose: bool, log_file: Option<&Path>) -> Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = match log_file {
        Some(path) => {
            let file = File::create(path)?;
            builder
                .with_ansi(false)
                .with_writer(Arc::new(file))
                .try_init()
        }
        None => builder.with_writer(std::io::stderr).try_init(),
    };

    // A subscriber installed earlier (tests, embedding) stays in place.
    if installed.is_err() {
        warn!("Tracing subscriber already installed");
    }
    Ok(())
}

pub async fn run(cli: Cli) -> Result<()> {
    init_logging(cli.verbose, cli.log_file.as_deref())?;
    let config = PipelineConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            stations,
            readings,
            no_headers,
            output_file,
            state_dir,
            in_memory,
            partitions,
            group_id,
        } => {
            let mut config = config;
            if let Some(partitions) = partitions {
                config.partitions = partitions;
            }
            if in_memory {
                config.state_dir = None;
            } else if state_dir.is_some() {
                config.state_dir = state_dir;
            }
            if let Some(group_id) = group_id {
                config = config.with_group_id(group_id);
            }

            let input = ReplayInput {
                stations: stations.as_deref(),
                readings: &readings,
                skip_headers: !no_headers,
            };
            replay(config, input, output_file.as_deref()).await
        }

        Commands::Inspect {
            state_dir,
            station_id,
        } => inspect(&state_dir, station_id),
    }
}

struct ReplayInput<'a> {
    stations: Option<&'a Path>,
    readings: &'a Path,
    skip_headers: bool,
}

/// Status text goes to stderr so stdout carries only JSON lines.
async fn replay(
    config: PipelineConfig,
    input: ReplayInput<'_>,
    output_file: Option<&Path>,
) -> Result<()> {
    let pipeline = Pipeline::open(config)?;
    let group = pipeline.config().group_id.clone();
    let topics = MemoryTopics::new(pipeline.config().partitions);

    if let Some(path) = input.stations {
        let registrations =
            StationReader::with_skip_headers(input.skip_headers).read_stations(path)?;
        eprintln!(
            "Registering {} stations from {}",
            registrations.len(),
            path.display()
        );
        for station in registrations {
            topics.register_station(station)?;
        }
    }

    let records =
        ReadingReader::with_skip_headers(input.skip_headers).read_readings(input.readings)?;
    let total = records.len() as u64;
    eprintln!("Replaying {} readings from {}", total, input.readings.display());
    for (station_id, payload) in records {
        topics.send_reading(station_id, payload)?;
    }

    let progress = ProgressReporter::new(total, "Aggregating readings...", false);
    let shutdown = pipeline.shutdown_handle();
    let running = pipeline.run(topics.pipeline_topics());
    tokio::pin!(running);

    let stats: PipelineStats = loop {
        tokio::select! {
            result = &mut running => break result?,
            _ = tokio::time::sleep(DRAIN_CHECK_INTERVAL) => {
                progress.update(total.saturating_sub(topics.readings.lag(&group)));
                if topics.drained(&group) && !shutdown.is_shutdown() {
                    info!("All input committed, stopping pipeline");
                    shutdown.shutdown();
                }
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, stopping pipeline");
                shutdown.shutdown();
            }
        }
    };

    progress.finish_with_message(&format!(
        "Aggregated {} readings",
        stats.readings_aggregated
    ));
    eprintln!("\n{}", stats.summary());

    let emitted = topics.output.records();
    match output_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut writer = BufWriter::new(File::create(path)?);
            write_records(&mut writer, emitted.iter().map(|record| &record.value))?;
            writer.flush()?;
            eprintln!("Wrote {} aggregates to {}", emitted.len(), path.display());
        }
        None => {
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            write_records(&mut out, emitted.iter().map(|record| &record.value))?;
        }
    }

    eprintln!("\nCurrent aggregates:");
    for record in pipeline.state_store().snapshot() {
        eprintln!("  {}", describe(&record));
    }

    Ok(())
}

fn inspect(state_dir: &Path, station_id: Option<u32>) -> Result<()> {
    if !state_dir.is_dir() {
        return Err(ProcessingError::Config(format!(
            "state directory {} does not exist",
            state_dir.display()
        )));
    }

    let metadata = MetadataTable::open_dir(state_dir)?;
    let store = StateStore::open_dir(state_dir)?;

    match station_id {
        Some(id) => {
            let record = store
                .read(id)
                .ok_or(ProcessingError::StationNotFound { station_id: id })?;
            println!("{}", describe(&record));
            if let Some(station) = metadata.lookup(id) {
                println!("Registered as: {}", station.name);
            }
        }
        None => {
            println!(
                "{} stations registered, {} aggregated",
                metadata.len(),
                store.len()
            );
            for record in store.snapshot() {
                println!("  {}", describe(&record));
            }
        }
    }

    Ok(())
}

fn write_records<'a, W: Write>(
    out: &mut W,
    records: impl Iterator<Item = &'a AggregateRecord>,
) -> Result<()> {
    for record in records {
        serde_json::to_writer(&mut *out, record)?;
        writeln!(out)?;
    }
    Ok(())
}

fn describe(record: &AggregateRecord) -> String {
    let name = record.station_name.as_deref().unwrap_or("<unregistered>");
    match record.average() {
        Some(avg) => format!(
            "{:>6} {:<24} count={:<6} avg={:.2} min={:.2} max={:.2}",
            record.station_id, name, record.count, avg, record.min, record.max
        ),
        None => format!("{:>6} {:<24} count=0", record.station_id, name),
    }
}
