//! Sender path (§4.4): not a dedicated task, just the set of code paths
//! that transmit packets, serialized by one mutex per channel.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use crate::error::WireError;
use crate::state::{Conn, StateMachine};
use crate::tl::TransferLog;
use crate::wire::{self, packet::Barrier, Packet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Data,
    Meta,
}

/// One of the two independent TCP-class connections (§4.3). Holding the
/// mutex for the duration of header + payload transmission is the
/// contract; `tokio::sync::Mutex` plays the role of the source's
/// per-channel kernel mutex (§5).
pub struct Channel {
    kind: ChannelKind,
    writer: AsyncMutex<OwnedWriteHalf>,
    ko_count: AtomicU32,
    ko_count_initial: u32,
    asender_running: AtomicBool,
    send_timeout: Duration,
}

impl Channel {
    pub fn new(kind: ChannelKind, writer: OwnedWriteHalf, ko_count: u32, send_timeout: Duration) -> Self {
        Self {
            kind,
            writer: AsyncMutex::new(writer),
            ko_count: AtomicU32::new(ko_count),
            ko_count_initial: ko_count,
            asender_running: AtomicBool::new(true),
            send_timeout,
        }
    }

    pub fn set_asender_running(&self, running: bool) {
        self.asender_running.store(running, Ordering::Release);
    }

    fn reset_ko_count(&self) {
        self.ko_count.store(self.ko_count_initial, Ordering::Release);
    }

    /// §4.4 steps 1–6. On success, `ko_count` is implicitly reset since a
    /// successful write means the peer is keeping up.
    pub async fn send_packet(
        &self,
        packet: &Packet,
        tl: &TransferLog,
        state: &StateMachine,
        cancel: &CancellationToken,
    ) -> Result<(), WireError> {
        // Step 2: the cancellation token stands in for "block the firing of
        // any thread-directed signal for the duration" — we simply don't
        // poll it again until the send completes or the caller awaits it
        // at the next suspension point (§9 signals-for-cancellation note).
        let mut guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(WireError::Closed),
            guard = self.writer.lock() => guard,
        };

        // Step 3: emit a pending Barrier first if the epoch has closed.
        if self.kind == ChannelKind::Data && tl.issue_barrier.is_set() {
            let closing = tl.tl_add_barrier();
            let barrier_packet = Packet::Barrier(Barrier { epoch: closing.0 });
            self.write_framed(&mut guard, &barrier_packet, state).await?;
        }

        self.write_framed(&mut guard, packet, state).await
    }

    async fn write_framed(
        &self,
        writer: &mut OwnedWriteHalf,
        packet: &Packet,
        state: &StateMachine,
    ) -> Result<(), WireError> {
        let framed = wire::encode(packet);
        loop {
            match tokio::time::timeout(self.send_timeout, writer.write_all(&framed)).await {
                Ok(Ok(())) => {
                    self.reset_ko_count();
                    return Ok(());
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_elapsed) => {
                    if self.should_drop(state.read().conn) {
                        crate::metrics::record_send_dropped(channel_label(self.kind));
                        return Err(WireError::Closed);
                    }
                    let remaining = self.ko_count.fetch_sub(1, Ordering::AcqRel);
                    if remaining <= 1 {
                        crate::metrics::record_send_dropped(channel_label(self.kind));
                        return Err(WireError::Closed);
                    }
                    if log::log_enabled!(log::Level::Warn) {
                        log::warn!("send stalled, ko_count now {remaining}, requesting a ping");
                    }
                    continue;
                }
            }
        }
    }

    /// §4.4 step 5: drop if sock is the meta channel, asender isn't
    /// running, or `conn < Connected`.
    fn should_drop(&self, conn: Conn) -> bool {
        self.kind == ChannelKind::Meta || !self.asender_running.load(Ordering::Acquire) || conn < Conn::Connected
    }
}

fn channel_label(kind: ChannelKind) -> &'static str {
    match kind {
        ChannelKind::Data => "data",
        ChannelKind::Meta => "meta",
    }
}
