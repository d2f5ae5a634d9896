//! Reclamation loop: supervised background sweep of expired state.
//!
//! Every tick removes sessions past their TTL (plus their bus topics and
//! persisted rows) and expired admin sessions. The loop reads the
//! process-wide shutdown broadcast and exits cleanly on teardown.

use std::sync::Arc;

use chrono::Utc;
use third_eye_core::Persistence;
use tokio::sync::broadcast;

use super::auth::AuthManager;
use super::bus::PipelineBus;
use super::session::SessionStore;

pub async fn run_reclamation_loop(
    sessions: Arc<SessionStore>,
    auth: Arc<AuthManager>,
    bus: Arc<PipelineBus>,
    persistence: Persistence,
    interval_seconds: u64,
    mut shutdown: broadcast::Receiver<()>,
) {
    let interval = tokio::time::Duration::from_secs(interval_seconds.max(1));
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    tracing::info!(
        "Reclamation loop started (interval: {}s)",
        interval_seconds
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                run_reclamation_tick(&sessions, &auth, &bus, &persistence).await;
            }
            _ = shutdown.recv() => {
                tracing::info!("Reclamation loop shutting down");
                break;
            }
        }
    }
}

/// One sweep, factored out so tests can drive it without the ticker.
pub async fn run_reclamation_tick(
    sessions: &SessionStore,
    auth: &AuthManager,
    bus: &PipelineBus,
    persistence: &Persistence,
) {
    let reaped = sessions.cleanup_stale(Utc::now());
    for session_id in &reaped {
        bus.close(session_id);
        if let Err(e) = persistence.delete_session(session_id).await {
            tracing::warn!("failed to delete persisted session {}: {}", session_id, e);
        }
    }

    let admin_swept = auth.sweep_admin_sessions();
    if !reaped.is_empty() || admin_swept > 0 {
        tracing::info!(
            "Reclamation sweep: {} sessions, {} admin sessions removed",
            reaped.len(),
            admin_swept
        );
    }
}
