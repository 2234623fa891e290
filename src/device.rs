//! Ties together the TL, state machine, queues, channels and task handles
//! for one replicated device (§2's component table, §5's task model).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::channel::{Channel, ChannelKind};
use crate::collaborators::{ActivityLog, BitmapStore, BlockDevice, MetadataStore};
use crate::config::Config;
use crate::ee::EeLists;
use crate::error::WireError;
use crate::gencounts::GenCounts;
use crate::pending::PendingCounters;
use crate::pool::Pool;
use crate::resync::ResyncEngine;
use crate::state::{DeviceState, StateMachine};
use crate::tl::TransferLog;
use crate::worker::WorkQueue;

/// One replicated device. Owns its TL, hash tables, state, queues and task
/// handles (§3 Ownership).
pub struct Device {
    pub minor: u32,
    pub config: Config,
    pub state: StateMachine,
    pub tl: TransferLog,
    pub pending: PendingCounters,
    pub ee_lists: std::sync::Mutex<EeLists>,
    pub data_channel: Channel,
    pub meta_channel: Channel,
    pub data_reader: std::sync::Mutex<Option<OwnedReadHalf>>,
    pub meta_reader: std::sync::Mutex<Option<OwnedReadHalf>>,
    pub work_queue: Arc<WorkQueue>,
    pub resync: ResyncEngine,
    pub bitmap: Arc<dyn BitmapStore>,
    pub metadata: Arc<dyn MetadataStore>,
    pub activity_log: Arc<dyn ActivityLog>,
    pub block_device: Arc<dyn BlockDevice>,
    pub request_pool: Arc<Pool<Vec<u8>>>,
    pub ee_pool: Arc<Pool<Vec<u8>>>,
    pub cancel: CancellationToken,
    pub recv_set_size: AtomicU32,
    pub peer_gencounts: StdMutex<Option<GenCounts>>,
    last_peer_activity: StdMutex<Instant>,
    seq_counter: AtomicU32,
    local_io_pending: AtomicU32,
    tasks: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

#[allow(clippy::too_many_arguments)]
impl Device {
    pub fn new(
        minor: u32,
        config: Config,
        data_stream: TcpStream,
        meta_stream: TcpStream,
        bitmap: Arc<dyn BitmapStore>,
        metadata: Arc<dyn MetadataStore>,
        activity_log: Arc<dyn ActivityLog>,
        block_device: Arc<dyn BlockDevice>,
        request_pool: Arc<Pool<Vec<u8>>>,
        ee_pool: Arc<Pool<Vec<u8>>>,
    ) -> Self {
        let (data_rx, data_tx) = data_stream.into_split();
        let (meta_rx, meta_tx) = meta_stream.into_split();
        let resync = ResyncEngine::new(bitmap.clone(), &config.sync);
        let timeout = config.timeout();
        Self {
            minor,
            tl: TransferLog::new(config.max_epoch_size),
            state: StateMachine::new(DeviceState::INITIAL, config.two_primaries),
            pending: PendingCounters::new(),
            ee_lists: std::sync::Mutex::new(EeLists::new()),
            data_channel: Channel::new(ChannelKind::Data, data_tx, config.ko_count, timeout),
            meta_channel: Channel::new(ChannelKind::Meta, meta_tx, config.ko_count, timeout),
            data_reader: std::sync::Mutex::new(Some(data_rx)),
            meta_reader: std::sync::Mutex::new(Some(meta_rx)),
            work_queue: Arc::new(WorkQueue::new()),
            resync,
            bitmap,
            metadata,
            activity_log,
            block_device,
            request_pool,
            ee_pool,
            config,
            cancel: CancellationToken::new(),
            recv_set_size: AtomicU32::new(0),
            peer_gencounts: StdMutex::new(None),
            last_peer_activity: StdMutex::new(Instant::now()),
            seq_counter: AtomicU32::new(0),
            local_io_pending: AtomicU32::new(0),
            tasks: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Sequence numbers within a device are strictly monotonic (§5).
    pub fn next_seq(&self) -> u32 {
        self.seq_counter.fetch_add(1, Ordering::AcqRel)
    }

    pub fn register_task(&self, handle: tokio::task::JoinHandle<()>) {
        self.tasks.lock().unwrap().push(handle);
    }

    /// Marks the meta-channel peer alive as of now (§4.6: `Ping`/`PingAck`
    /// both refresh liveness).
    pub fn refresh_peer_liveness(&self) {
        *self.last_peer_activity.lock().unwrap() = Instant::now();
    }

    pub fn peer_is_alive(&self, timeout: std::time::Duration) -> bool {
        self.last_peer_activity.lock().unwrap().elapsed() < timeout
    }

    /// Writes one block to the local backing device, applying the
    /// `on_io_error` policy on failure (§6, §7 `LocalIoError`).
    pub async fn write_local(&self, sector: u64, len: u32, bytes: &[u8]) -> Result<(), crate::error::IoPolicyError> {
        self.local_io_pending.fetch_add(1, Ordering::AcqRel);
        self.activity_log.begin_io(sector);
        let result = self.block_device.sync_page_io(sector, bytes).await;
        self.activity_log.end_io(sector);
        self.local_io_pending.fetch_sub(1, Ordering::AcqRel);

        match result {
            Ok(()) => Ok(()),
            Err(e) => self.handle_local_io_error(sector, len, e).await,
        }
    }

    /// Applies `config.on_io_error` to a failed local write (§7): `PassOn`
    /// propagates, `Panic` is fatal, `Detach` drops to `Diskless` and keeps
    /// going as a diskless node.
    async fn handle_local_io_error(
        &self,
        sector: u64,
        len: u32,
        source: std::io::Error,
    ) -> Result<(), crate::error::IoPolicyError> {
        use crate::config::OnIoError;
        use crate::error::IoPolicyError;
        use crate::state::{Conn, Disk};

        if log::log_enabled!(log::Level::Error) {
            log::error!("local I/O error at sector {sector}: {source}");
        }
        match self.config.on_io_error {
            OnIoError::PassOn => Err(IoPolicyError::PassedOn),
            OnIoError::Panic => {
                panic!("FatalInvariant: local I/O error at sector {sector} ({source}), on_io_error=Panic")
            }
            OnIoError::Detach => {
                // disk transitions Failed -> Diskless as two hard-state
                // steps, matching the observable state history of a local
                // write failure.
                let current = self.state.read();
                self.state.force(DeviceState {
                    disk: Disk::Failed,
                    ..current
                });
                let (new_state, actions) = self.state.force(DeviceState {
                    disk: Disk::Diskless,
                    ..current
                });
                for action in actions {
                    self.work_queue.push(crate::worker::WorkItem::AfterStateChange(action));
                }
                if new_state.conn >= Conn::Connected {
                    self.work_queue
                        .push(crate::worker::WorkItem::AfterStateChange(crate::state::PostChangeAction::SendState));
                }
                self.metadata.sync(crate::collaborators::MetadataSyncFlags::FULL_SYNC);
                self.bitmap.set_out_of_sync(sector, len);

                // Bounded wait for in-flight local I/O to drain before the
                // backing device is considered released.
                let deadline = std::time::Instant::now() + self.config.timeout();
                while self.local_io_pending.load(Ordering::Acquire) > 0 && std::time::Instant::now() < deadline {
                    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                }
                Err(IoPolicyError::Detached)
            }
        }
    }

    /// Requests cancellation and waits for every spawned task to observe it
    /// (§9: cancellation token replacing signals).
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// `tl_clear` plus the bookkeeping it implies (§4.2): completes
    /// not-yet-`SENT` requests synthetically, marks `SENT` ones
    /// out-of-sync under protocol ≠ C, and drains `ap_pending` accordingly.
    pub fn drain_transfer_log_on_connection_loss(&self) {
        use crate::config::WireProtocol;
        use crate::tl::RequestStatus;

        let drained = self.tl.tl_clear();
        for request in drained {
            let mut r = request.lock().unwrap();
            if !r.status.contains(RequestStatus::SENT) {
                r.status.insert(RequestStatus::SENT | RequestStatus::ACKED);
            } else if self.config.wire_protocol != WireProtocol::C {
                self.bitmap.set_out_of_sync(r.sector, r.len);
            }
            self.pending.dec_ap_pending();
        }
    }

    /// Negotiates the protocol version on the data channel before any other
    /// command is accepted on a freshly-accepted socket pair (§4.5, §4.10).
    async fn handshake(&self) -> Result<(), WireError> {
        use crate::handshake::{negotiate, PROTOCOL_MAX, PROTOCOL_MIN};
        use crate::wire::packet::HandShake;

        let local_range = PROTOCOL_MIN..=PROTOCOL_MAX;
        let hs = HandShake::new(PROTOCOL_MIN, PROTOCOL_MAX, self.minor as u64, 0);
        self.data_channel
            .send_packet(&crate::wire::Packet::HandShake(hs), &self.tl, &self.state, &self.cancel)
            .await?;

        let mut reader = self
            .data_reader
            .lock()
            .unwrap()
            .take()
            .expect("handshake runs before the receiver task claims the data reader");
        let peer_packet = crate::receiver::read_one(&mut reader).await;
        *self.data_reader.lock().unwrap() = Some(reader);
        let peer_packet = peer_packet?;

        let peer_range = match peer_packet {
            crate::wire::Packet::HandShake(hs) => hs.protocol_min..=hs.protocol_max,
            _ => return Err(WireError::Closed),
        };
        negotiate(local_range, peer_range)?;
        Ok(())
    }

    /// Negotiates the protocol, then spawns the four long-lived tasks per
    /// device (§5: Receiver, Asender, Worker, plus the keepalive timer),
    /// each interruptible at well-defined points via `cancel`.
    pub async fn start(self: &Arc<Self>) -> Result<(), WireError> {
        self.handshake().await?;

        let receiver_device = self.clone();
        let receiver_cancel = self.cancel.clone();
        self.register_task(tokio::spawn(async move {
            crate::receiver::run(receiver_device, receiver_cancel).await;
        }));

        let asender_device = self.clone();
        let asender_cancel = self.cancel.clone();
        self.register_task(tokio::spawn(async move {
            crate::asender::run(asender_device, asender_cancel).await;
        }));

        let keepalive_device = self.clone();
        let keepalive_cancel = self.cancel.clone();
        self.register_task(tokio::spawn(async move {
            crate::asender::run_keepalive(keepalive_device, keepalive_cancel).await;
        }));

        let worker_queue = self.work_queue.clone();
        let worker_handler: Arc<dyn crate::worker::WorkHandler> = self.clone();
        let worker_cancel = self.cancel.clone();
        self.register_task(tokio::spawn(async move {
            crate::worker::run(worker_queue, worker_handler, worker_cancel).await;
        }));

        Ok(())
    }
}

#[async_trait::async_trait]
impl crate::worker::WorkHandler for Device {
    async fn resync_tick(&self, now: std::time::Instant) {
        let extents = self.resync.tick(now);
        for (sector, len) in extents {
            match self.block_device.read_page_io(sector, len).await {
                Ok(bytes) => {
                    // Resync replies are identified by sector rather than a
                    // TL request id: they never enter the transfer log.
                    let packet = crate::wire::Packet::RsDataReply(crate::wire::packet::DataBlock {
                        sector,
                        block_id: sector,
                        seq_num: self.next_seq(),
                        bytes,
                    });
                    if let Err(e) = self
                        .data_channel
                        .send_packet(&packet, &self.tl, &self.state, &self.cancel)
                        .await
                    {
                        if log::log_enabled!(log::Level::Warn) {
                            log::warn!("resync send failed for sector {sector}: {e}");
                        }
                    }
                }
                Err(e) => {
                    if log::log_enabled!(log::Level::Warn) {
                        log::warn!("resync read failed for sector {sector}: {e}");
                    }
                    self.bitmap.set_out_of_sync(sector, len);
                }
            }
        }
        self.resync.finish_if_in_sync(&self.state);
        crate::metrics::record_pending(
            self.pending.ap_pending(),
            self.pending.rs_pending(),
            self.pending.unacked(),
        );
    }

    async fn try_send_barrier(&self) {
        if !self.tl.issue_barrier.is_set() {
            return;
        }
        let closing = self.tl.tl_add_barrier();
        let packet = crate::wire::Packet::Barrier(crate::wire::packet::Barrier { epoch: closing.0 });
        if let Err(e) = self
            .data_channel
            .send_packet(&packet, &self.tl, &self.state, &self.cancel)
            .await
        {
            if log::log_enabled!(log::Level::Warn) {
                log::warn!("failed to send barrier: {e}");
            }
        }
    }

    async fn send_write_hint(&self, _range: crate::worker::SectorRange) {
        self.block_device.kick_lo();
    }

    async fn send_bitmap(&self) {
        let lel = self.bitmap.get_lel();
        let mut offset = 0u32;
        while offset < lel {
            let words = self
                .bitmap
                .words(offset, crate::wire::packet::BM_PACKET_WORDS);
            if words.is_empty() {
                break;
            }
            let count = words.len() as u32;
            let packet = crate::wire::Packet::ReportBitMap(crate::wire::packet::ReportBitMap {
                offset_words: offset,
                words,
            });
            if self
                .data_channel
                .send_packet(&packet, &self.tl, &self.state, &self.cancel)
                .await
                .is_err()
            {
                break;
            }
            offset += count;
        }
    }

    async fn after_state_change(&self, action: crate::state::PostChangeAction) {
        use crate::state::PostChangeAction::*;
        match action {
            SendSizes => {
                let packet = crate::wire::Packet::ReportSizes(crate::wire::packet::ReportSizes {
                    disk_size_sectors: self.block_device.get_capacity(),
                    user_size_sectors: self.block_device.get_capacity(),
                    max_bio_size: 1 << 20,
                    queue_order_type: 0,
                });
                if let Err(e) = self
                    .data_channel
                    .send_packet(&packet, &self.tl, &self.state, &self.cancel)
                    .await
                {
                    if log::log_enabled!(log::Level::Warn) {
                        log::warn!("failed to send sizes: {e}");
                    }
                }
            }
            SendState => {
                let current = self.state.read();
                let packet = crate::wire::Packet::ReportState(crate::wire::packet::ReportState {
                    role: current.role,
                    peer_role: current.peer_role,
                    conn: current.conn,
                    disk: current.disk,
                    pdisk: current.pdisk,
                });
                if let Err(e) = self
                    .data_channel
                    .send_packet(&packet, &self.tl, &self.state, &self.cancel)
                    .await
                {
                    if log::log_enabled!(log::Level::Warn) {
                        log::warn!("failed to send state: {e}");
                    }
                }
            }
            PinCore => {}
            StopResyncTimer => self.resync.set_skip(true),
        }
    }
}
