use std::sync::Arc;

use flowtap_core::ConnectionKey;
use tracing::{debug, warn};

use crate::server::HubState;

/// Recurring poll task for one registered connection. Polls once right
/// away, then on every interval tick for as long as the key stays
/// registered. There is no cancellation handle; unregistering the key is
/// what stops the loop.
pub fn spawn_poll_loop(state: Arc<HubState>, key: ConnectionKey) {
    tokio::spawn(async move {
        debug!(event = "poll_loop_started", key = %key);
        if !state.agent.request_poll(&key).await {
            warn!(event = "trace_poll_failed", key = %key);
        }
        loop {
            tokio::time::sleep(state.config.poll_interval).await;
            if !state.registry.is_registered(&key).await {
                debug!(event = "poll_loop_stopped", key = %key);
                return;
            }
            if !state.agent.request_poll(&key).await {
                warn!(event = "trace_poll_failed", key = %key);
            }
        }
    });
}
