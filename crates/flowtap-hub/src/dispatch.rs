use std::collections::HashMap;

use flowtap_core::{ConnectionKey, TraceRecord};
use serde_json::Value;
use tracing::{debug, warn};

use crate::registry::{DeliveryOutcome, ObserverRegistry};

/// Records of one agent read grouped by connection, in first-seen order.
/// A record joins the batch for its own key if one exists, else the batch
/// for the key's reverse, else it opens a new batch under its own key. Both
/// directions of one connection therefore land in a single batch, keyed by
/// whichever direction showed up first in the read.
pub struct RecordBatches {
    order: Vec<ConnectionKey>,
    by_key: HashMap<ConnectionKey, Vec<TraceRecord>>,
    unroutable: usize,
}

impl RecordBatches {
    pub fn group(records: Vec<TraceRecord>) -> Self {
        let mut order = Vec::new();
        let mut by_key: HashMap<ConnectionKey, Vec<TraceRecord>> = HashMap::new();
        let mut unroutable = 0;
        for record in records {
            let Some(key) = record.key().cloned() else {
                unroutable += 1;
                continue;
            };
            if let Some(batch) = by_key.get_mut(&key) {
                batch.push(record);
                continue;
            }
            let reverse = key.reverse();
            if let Some(batch) = by_key.get_mut(&reverse) {
                batch.push(record);
                continue;
            }
            order.push(key.clone());
            by_key.insert(key, vec![record]);
        }
        Self {
            order,
            by_key,
            unroutable,
        }
    }

    /// Records that parsed but carried no usable addressing fields.
    pub fn unroutable(&self) -> usize {
        self.unroutable
    }

    pub fn into_batches(self) -> Vec<(ConnectionKey, Vec<TraceRecord>)> {
        let RecordBatches {
            order, mut by_key, ..
        } = self;
        order
            .into_iter()
            .filter_map(|key| {
                let records = by_key.remove(&key)?;
                Some((key, records))
            })
            .collect()
    }
}

/// Delivers one read's records to their observers, one JSON array per
/// connection. A failed send tears the observer down the same way an
/// explicit close does; batches with no registered observer are dropped.
pub async fn dispatch_records(registry: &ObserverRegistry, records: Vec<TraceRecord>) {
    let batches = RecordBatches::group(records);
    if batches.unroutable() > 0 {
        debug!(event = "records_unroutable", count = batches.unroutable());
    }
    for (key, batch) in batches.into_batches() {
        let Some(observer) = registry.lookup_either_direction(&key).await else {
            debug!(event = "batch_unmatched", key = %key);
            continue;
        };
        let raw: Vec<&Value> = batch.iter().map(TraceRecord::raw).collect();
        let payload = match serde_json::to_string(&raw) {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "batch_encode_error", key = %key, error = %err);
                continue;
            }
        };
        match observer.deliver(payload) {
            DeliveryOutcome::Delivered => {}
            DeliveryOutcome::TransportGone => {
                warn!(
                    event = "observer_send_failed",
                    conn_id = %observer.conn_id(),
                    key = %key
                );
                registry.release(&observer, "send_failed").await;
            }
        }
    }
}
