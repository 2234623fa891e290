//! Instrumentation only (§2 ambient components): counters and histograms
//! that describe the core's behavior without ever gating correctness.

pub fn record_barrier_closed(epoch: u32, set_size: u32) {
    metrics::counter!("mirrorblk_barriers_closed_total").increment(1);
    metrics::histogram!("mirrorblk_barrier_set_size").record(set_size as f64);
    if log::log_enabled!(log::Level::Debug) {
        log::debug!("barrier {epoch} closed with {set_size} requests");
    }
}

pub fn record_send_dropped(channel: &'static str) {
    metrics::counter!("mirrorblk_send_dropped_total", "channel" => channel).increment(1);
}

pub fn record_resync_bytes(bytes: u64) {
    metrics::counter!("mirrorblk_resync_bytes_total").increment(bytes);
}

pub fn record_pending(ap_pending: u32, rs_pending: u32, unacked: u32) {
    metrics::gauge!("mirrorblk_ap_pending").set(ap_pending as f64);
    metrics::gauge!("mirrorblk_rs_pending").set(rs_pending as f64);
    metrics::gauge!("mirrorblk_unacked").set(unacked as f64);
}
