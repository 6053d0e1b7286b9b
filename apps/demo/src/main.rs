//! # linkstash Demo
//!
//! Runs one sync session against the in-memory remote and walks through the
//! behaviors the dashboard relies on.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Demo Script                                    │
//! │                                                                         │
//! │  1. Seed two bookmarks, start the session, wait for Live               │
//! │  2. Another device adds a bookmark (arrives on the change stream)      │
//! │  3. Create, edit and delete from this device (optimistic)              │
//! │  4. Rejected edit rolls back                                           │
//! │  5. Stream disconnect → resubscribe → snapshot refresh                 │
//! │  6. Sign out                                                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use linkstash_core::validation::{display_domain, prepare_create};
use linkstash_core::{CorrelationId, Fields, Identity, Record, Version, FIELD_TITLE, FIELD_URL};
use linkstash_sync::{
    EngineConfig, MemoryRemote, MutationRequest, SessionEventEmitter, SessionState,
    StaticAuth, SyncError, SyncSessionBuilder, SyncSessionHandle,
};

/// How long the demo waits for any single step.
const STEP_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("Starting linkstash demo");

    let config = EngineConfig::load_or_default(None);
    config.validate().context("invalid engine config")?;

    let identity = Identity::new("demo-user").with_email("demo@linkstash.dev");
    let remote = Arc::new(MemoryRemote::new());
    remote.seed(&identity, seed_records()?)?;

    let handle = SyncSessionBuilder::new(config.session.clone())
        .with_auth(Arc::new(StaticAuth::signed_in(identity.clone())))
        .with_remote(remote.clone())
        .with_emitter(Arc::new(LogEmitter))
        .spawn()?;

    wait_for_state(&handle, SessionState::Live).await?;
    print_view("Initial snapshot", &handle);

    // A write from another device reaches us through the change stream
    let fields = prepare_create(Some("Tokio"), "tokio.rs")?;
    remote.commit(&identity, MutationRequest::create(fields))?;
    wait_for_len(&handle, 3).await?;
    print_view("After remote insert", &handle);

    // Local writes are visible before the server answers
    let created = handle
        .submit_create(bookmark("The Rust Book", "doc.rust-lang.org/book"))
        .await?;
    info!(correlation_id = %created, "Create submitted");
    wait_for_len(&handle, 4).await?;

    let first = handle
        .current_view()
        .first()
        .map(|r| r.id.clone())
        .context("view is empty")?;
    handle.submit_update(first.clone(), title("The Book")).await?;

    let last = handle
        .current_view()
        .last()
        .map(|r| r.id.clone())
        .context("view is empty")?;
    handle.submit_delete(last).await?;
    wait_for_len(&handle, 3).await?;
    print_view("After local writes", &handle);

    // The server refuses the next write; the edit rolls back
    tokio::time::sleep(Duration::from_millis(200)).await;
    remote.fail_next_mutations(1, SyncError::Rejected("read-only bookmark".into()))?;
    handle.submit_update(first, title("Never saved")).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    print_view("After rejected edit", &handle);

    // Drop the stream; the session resubscribes and refreshes
    remote.disconnect_all()?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    wait_for_state(&handle, SessionState::Live).await?;
    info!(snapshots = remote.snapshot_calls(), "Recovered from disconnect");

    handle.sign_out().await?;
    info!(state = %handle.state(), "Demo finished");
    Ok(())
}

/// Initializes the tracing subscriber for structured logging.
///
/// ## Log Levels
/// - `RUST_LOG=debug` - Show debug messages
/// - `RUST_LOG=linkstash_sync=trace` - Trace the sync engine only
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,linkstash=debug"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_max_level(Level::TRACE)
        .init();
}

/// Emitter that writes session events to the log.
struct LogEmitter;

impl SessionEventEmitter for LogEmitter {
    fn emit_state(&self, state: SessionState) {
        info!(%state, "session://state");
    }

    fn emit_mutation_outcome(&self, correlation_id: CorrelationId, outcome: &Result<Record, SyncError>) {
        match outcome {
            Ok(record) => info!(%correlation_id, record_id = %record.id, version = %record.version, "session://outcome"),
            Err(e) => warn!(%correlation_id, error = %e, "session://outcome"),
        }
    }

    fn emit_error(&self, message: &str, retryable: bool) {
        warn!(message, retryable, "session://error");
    }

    fn emit_sign_in_required(&self) {
        warn!("session://sign-in");
    }
}

fn seed_records() -> Result<Vec<Record>> {
    let now = Utc::now();
    Ok(vec![
        Record::new(
            "1",
            prepare_create(Some("docs.rs"), "https://docs.rs")?,
            now - ChronoDuration::hours(2),
            Version::new(1),
        ),
        Record::new(
            "2",
            prepare_create(None, "crates.io")?,
            now - ChronoDuration::hours(1),
            Version::new(1),
        ),
    ])
}

fn bookmark(title: &str, url: &str) -> Fields {
    let mut fields = Fields::new();
    fields.insert(FIELD_TITLE.into(), title.into());
    fields.insert(FIELD_URL.into(), url.into());
    fields
}

fn title(value: &str) -> Fields {
    let mut fields = Fields::new();
    fields.insert(FIELD_TITLE.into(), value.into());
    fields
}

fn print_view(label: &str, handle: &SyncSessionHandle) {
    let view = handle.current_view();
    info!(count = view.len(), "{}", label);
    for record in view.iter() {
        info!(
            id = %record.id,
            title = record.title().unwrap_or(""),
            domain = %display_domain(record).unwrap_or_default(),
            version = %record.version,
            "  bookmark"
        );
    }
}

async fn wait_for_state(handle: &SyncSessionHandle, wanted: SessionState) -> Result<()> {
    let mut rx = handle.watch_state();
    let result = match tokio::time::timeout(STEP_TIMEOUT, rx.wait_for(|s| *s == wanted || s.is_closed())).await {
        Ok(Ok(state)) if *state == wanted => Ok(()),
        Ok(Ok(state)) => bail!("session ended in {} while waiting for {}", *state, wanted),
        Ok(Err(_)) => bail!("session task stopped"),
        Err(_) => bail!("timed out waiting for {}", wanted),
    };
    result
}

async fn wait_for_len(handle: &SyncSessionHandle, len: usize) -> Result<()> {
    let mut rx = handle.watch_view();
    tokio::time::timeout(STEP_TIMEOUT, rx.wait_for(|v| v.len() == len))
        .await
        .context("timed out waiting for view")?
        .context("session task stopped")?;
    Ok(())
}
