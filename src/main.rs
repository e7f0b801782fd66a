use rtk_positioning::{init_logging, Pipeline, PipelineConfig, PipelineState};
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const REPORT_INTERVAL: Duration = Duration::from_secs(1);
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Set the returned flag once stdin reaches end of file
fn watch_stdin() -> Arc<AtomicBool> {
    let closed = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&closed);
    let spawned = thread::Builder::new().name("stdin-watch".to_string()).spawn(move || {
        let mut stdin = std::io::stdin();
        let mut buf = [0u8; 256];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
        flag.store(true, Ordering::Relaxed);
    });
    if let Err(e) = spawned {
        tracing::warn!(error = %e, "Cannot watch stdin; stop with Ctrl-C");
    }
    closed
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() != 2 {
        eprintln!(
            "Usage: {} <config.json>",
            args.first().map_or("rtk-positioning", |s| s.as_str())
        );
        std::process::exit(1);
    }

    init_logging("info");

    let config = PipelineConfig::load_from_file(&args[1])?;
    let mut pipeline = Pipeline::from_config(&config)?;
    tracing::info!(
        port = %config.receiver.port,
        baud_rate = config.receiver.baud_rate,
        corrections = config.correction.is_some(),
        "Starting pipeline"
    );
    pipeline.start()?;

    let stdin_closed = watch_stdin();
    let mut last_report = Instant::now();
    loop {
        if stdin_closed.load(Ordering::Relaxed) {
            tracing::info!("Input closed, shutting down");
            break;
        }
        if pipeline.state() == PipelineState::Failed {
            break;
        }
        if last_report.elapsed() >= REPORT_INTERVAL {
            last_report = Instant::now();
            if let Ok(fix) = pipeline.get_position() {
                tracing::info!(
                    latitude = fix.latitude,
                    longitude = fix.longitude,
                    altitude = fix.altitude,
                    quality = ?fix.fix_quality,
                    satellites = fix.satellites_used,
                    hdop = fix.hdop,
                    "Position"
                );
            }
            if let Ok(json) = pipeline.get_status().to_json() {
                tracing::debug!(status = %json, "Status");
            }
        }
        thread::sleep(POLL_INTERVAL);
    }

    let failure = pipeline.get_position().err();
    pipeline.stop()?;
    match failure {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}
