//! cardgate demo reader
//!
//! Connects to the first PC/SC reader and prints the UID of every card
//! presented until Ctrl+C. A card left on the reader is reported once; the
//! next read waits for it to be taken away.
//!
//! Configuration:
//! - `CARDGATE_TIMEOUT_MS`: how long one read waits for a card (default: no
//!   practical limit)
//! - `RUST_LOG`: log filter (default `info`)

use anyhow::{Context, Result};
use cardgate_core::{
    Error, JobId,
    constants::{DEFAULT_SETTLE_DELAY_MS, MAX_TIMEOUT_MS},
};
use cardgate_hardware::PcscDriver;
use cardgate_reader::ReaderSession;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const TIMEOUT_ENV: &str = "CARDGATE_TIMEOUT_MS";

/// Requester id used for every read of the demo loop.
const DEMO_USER: JobId = JobId::new(0);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let timeout = load_timeout()?;

    let session = Arc::new(ReaderSession::new(PcscDriver::new()));
    session
        .connect()
        .context("Failed to connect to a card reader")?;
    session.set_timeout(timeout);
    info!(
        "Using reader {} (timeout {:?})",
        session.reader_name().unwrap_or_default(),
        timeout
    );

    println!("Waiting for cards. Ctrl+C to exit.");
    println!("----------------------------------\n");

    let shutdown = CancellationToken::new();
    let mut reader = tokio::task::spawn_blocking({
        let session = Arc::clone(&session);
        let shutdown = shutdown.clone();
        move || read_loop(&session, &shutdown)
    });

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl+C")?;
            info!("Interrupted, stopping reader");
            shutdown.cancel();
            (&mut reader).await.context("Read loop terminated abnormally")?;
        }
        finished = &mut reader => {
            finished.context("Read loop terminated abnormally")?;
        }
    }

    session.reset();
    Ok(())
}

/// Read timeout from the environment, defaulting to the maximum.
fn load_timeout() -> Result<Duration> {
    match std::env::var(TIMEOUT_ENV) {
        Ok(value) => {
            let ms: u64 = value.trim().parse().with_context(|| {
                format!("{} must be milliseconds, got {:?}", TIMEOUT_ENV, value)
            })?;
            Ok(Duration::from_millis(ms.min(MAX_TIMEOUT_MS)))
        }
        Err(_) => Ok(Duration::from_millis(MAX_TIMEOUT_MS)),
    }
}

fn read_loop(session: &ReaderSession<PcscDriver>, shutdown: &CancellationToken) {
    let cancelled = Error::Cancelled.to_string();
    let mut already_present = false;

    while !shutdown.is_cancelled() {
        let result = session.read(DEMO_USER, already_present, Some(shutdown));

        if result.success && !result.identifier.is_empty() {
            println!("\nCard ID: {}\n", result.identifier);
            already_present = true;
            continue;
        }

        already_present = false;
        if result.error == cancelled {
            debug!("Read cancelled");
            continue;
        }
        if !result.error.is_empty() {
            warn!(
                "Read failed ({}), please keep card on reader for longer",
                result.error
            );
            thread::sleep(Duration::from_millis(DEFAULT_SETTLE_DELAY_MS));
        }
        println!("-------------------------------\n");
    }
}
