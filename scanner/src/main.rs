use qrscan_common::config::{Config, SourceMode};
use qrscan_common::detection::ScanOutcome;
use qrscan_scanner::clock::SystemClock;
use qrscan_scanner::decoder::RqrrDecoder;
use qrscan_scanner::pipeline::{PipelineSettings, ScanEvent, ScanPipeline};
use qrscan_scanner::session::{write_export, ExportError, HistoryDb, SessionStore};
use qrscan_source::SlotSource;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() {
    let mut args = std::env::args().skip(1);
    let config_path = args
        .next()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));
    let command = args.next();

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    match command.as_deref() {
        None | Some("run") => run_scanner(config).await,
        Some("export") => export_history(&config),
        Some(other) => {
            eprintln!("Unknown command {other:?}; expected \"run\" or \"export\"");
            std::process::exit(2);
        }
    }
}

async fn run_scanner(config: Config) {
    info!(
        mode = ?config.source.mode,
        url = config.source.url,
        fps = config.source.fps,
        cooldown_ms = config.gate.cooldown_ms,
        min_submit_interval_ms = config.pipeline.min_submit_interval_ms,
        decode_timeout_ms = config.pipeline.decode_timeout_ms,
        min_area_fraction = config.filter.min_area_fraction,
        history = config.history.enabled,
        "starting qrscan"
    );

    let source = match build_source(&config) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to start frame source");
            std::process::exit(1);
        }
    };

    let store = if config.history.enabled {
        SessionStore::open(&config.history.path)
    } else {
        SessionStore::in_memory()
    };

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let feedback = tokio::spawn(run_feedback(event_rx));

    let pipeline = ScanPipeline::new(
        source,
        Arc::new(RqrrDecoder),
        store,
        PipelineSettings::from_config(&config),
        Arc::new(SystemClock),
        event_tx,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("interrupt received, shutting down"),
            Err(e) => error!(error = %e, "failed to listen for ctrl-c, shutting down"),
        }
        let _ = shutdown_tx.send(true);
    });

    let mut store = pipeline
        .run(shutdown_rx, config.pipeline.tick_interval())
        .await;
    store.close();
    // The pipeline (and with it the event sender) is gone; drain the tail.
    let _ = feedback.await;

    if config.export.on_exit {
        let at_ms = chrono::Utc::now().timestamp_millis();
        match write_export(&config.export.dir, store.codes(), config.export.format, at_ms) {
            Ok(path) => info!(path = path.display().to_string(), "session exported"),
            Err(ExportError::NothingToExport) => info!("no codes scanned, nothing exported"),
            Err(e) => error!(error = %e, "session export failed"),
        }
    }
    info!(distinct_codes = store.len(), session_codes = store.session_codes().len(), "qrscan stopped");
}

fn build_source(config: &Config) -> Result<SlotSource, qrscan_source::SourceError> {
    let interval = config.source.frame_interval();

    match config.source.mode {
        SourceMode::Mjpeg => Ok(qrscan_source::mjpeg::spawn_mjpeg(config.source.url.clone())),
        SourceMode::Polling => Ok(qrscan_source::mjpeg::spawn_polling(
            config.source.url.clone(),
            interval,
        )),
        SourceMode::Directory => {
            let dir = config
                .source
                .path
                .clone()
                .unwrap_or_else(|| PathBuf::from("frames"));
            qrscan_source::still::spawn_directory(&dir, interval)
        }
    }
}

/// Log each outcome as it is emitted.
async fn run_feedback(mut events: mpsc::UnboundedReceiver<ScanEvent>) {
    while let Some(event) = events.recv().await {
        match event.outcome {
            ScanOutcome::NewCode { code, .. } => {
                info!(code, distinct_codes = event.distinct_codes, "scanned new code")
            }
            ScanOutcome::DuplicateCode { code, .. } => {
                warn!(code, distinct_codes = event.distinct_codes, "code already scanned")
            }
            ScanOutcome::Rejected(reason) => {
                debug!(reason = %reason, frame_seq = event.frame_seq, "detection rejected")
            }
            ScanOutcome::NoDetection => {}
        }
    }
}

/// `qrscan <config> export`: write the persisted history and exit.
fn export_history(config: &Config) {
    if !config.history.path.exists() {
        info!(path = config.history.path.display().to_string(), "no history file, nothing exported");
        return;
    }
    let db = match HistoryDb::open(&config.history.path) {
        Ok(db) => db,
        Err(e) => {
            error!(error = %e, "failed to open history");
            std::process::exit(1);
        }
    };
    let codes: Vec<String> = match db.load() {
        Ok(entries) => entries.into_iter().map(|e| e.code).collect(),
        Err(e) => {
            error!(error = %e, "failed to read history");
            std::process::exit(1);
        }
    };

    let at_ms = chrono::Utc::now().timestamp_millis();
    match write_export(&config.export.dir, &codes, config.export.format, at_ms) {
        Ok(path) => println!("{}", path.display()),
        Err(ExportError::NothingToExport) => println!("nothing to export"),
        Err(e) => {
            error!(error = %e, "export failed");
            std::process::exit(1);
        }
    }
}
