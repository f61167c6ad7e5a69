// =============================================================================
// Health Supervisor (C5) -- periodic self-probe of the Signal Gateway's
// `/health` endpoint plus a liveness check of the Price Stream. Grounded on
// the teacher's `exit::monitor::run_exit_monitor` periodic-tick shape
// (`tokio::time::interval` + `.tick().await` + one structured log per pass).
// Side-effect free on trading state, per spec.md §4.5 -- the one exception
// carved out here is flipping the shared restart flag after consecutive
// degraded cycles, which is this expansion's resolution for spec.md §4.6's
// "scheduled restart on fatal health conditions" (see DESIGN.md).
// =============================================================================

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::lifecycle::RESTART_REQUESTED;
use crate::strategy::StrategyCore;

const INITIAL_DELAY: Duration = Duration::from_secs(10);
const PERIOD: Duration = Duration::from_secs(10 * 60);
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
/// Consecutive degraded cycles before the fatal-restart path triggers.
/// 3 cycles at the default 10-minute period is ~30 minutes of sustained
/// degradation -- long enough to rule out a single transient blip.
const CONSECUTIVE_FAILURES_BEFORE_RESTART: u32 = 3;

pub async fn run(strategy: Arc<StrategyCore>, bind_addr: String) {
    tokio::time::sleep(INITIAL_DELAY).await;

    let client = reqwest::Client::builder()
        .timeout(PROBE_TIMEOUT)
        .build()
        .expect("health probe client always builds with a fixed timeout");
    let probe_url = format!("http://{}/health", local_probe_addr(&bind_addr));

    let mut interval = tokio::time::interval(PERIOD);
    let mut consecutive_failures = 0u32;

    loop {
        interval.tick().await;

        let gateway_ok = match client.get(&probe_url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(err) => {
                warn!(error = %err, "health probe request failed");
                false
            }
        };
        let stream_ok = strategy.price_stream.is_healthy();

        if gateway_ok && stream_ok {
            consecutive_failures = 0;
            info!(connection_count = strategy.price_stream.connection_count(), "health check passed");
        } else {
            consecutive_failures += 1;
            warn!(gateway_ok, stream_ok, consecutive_failures, "health check degraded");
            if consecutive_failures >= CONSECUTIVE_FAILURES_BEFORE_RESTART {
                warn!("health degraded for too many consecutive cycles, requesting a restart");
                RESTART_REQUESTED.store(true, Ordering::SeqCst);
            }
        }
    }
}

/// `0.0.0.0:PORT` isn't dialable from an outbound client socket; probe the
/// loopback address on the same port instead.
fn local_probe_addr(bind_addr: &str) -> String {
    match bind_addr.rsplit_once(':') {
        Some((_, port)) => format!("127.0.0.1:{port}"),
        None => "127.0.0.1:80".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_wildcard_bind_to_loopback() {
        assert_eq!(local_probe_addr("0.0.0.0:80"), "127.0.0.1:80");
        assert_eq!(local_probe_addr("0.0.0.0:8080"), "127.0.0.1:8080");
    }
}
