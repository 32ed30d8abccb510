use std::time::Duration;

use tracing::{debug, info};

use crate::state::AppState;

/// How often expired logins and sessions are swept
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Drop expired pending logins and sessions. Returns `(pending, sessions)` removed.
///
/// Lookups already ignore expired entries; this only bounds memory.
pub fn sweep_expired(state: &AppState) -> (usize, usize) {
    let pending = state.flow.pending().purge_expired();
    let sessions = state.sessions.purge_expired();

    if pending + sessions > 0 {
        info!(pending, sessions, "Swept expired entries");
    } else {
        debug!("Nothing to sweep");
    }

    (pending, sessions)
}

pub async fn run_sweeper(app_state: AppState) -> color_eyre::Result<()> {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        sweep_expired(&app_state);
    }
}
