//! End-to-end scenarios driving two in-process `Device`s over a loopback
//! TCP pair (two scenarios from the literal-value scenario list).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};

use mirrorblk_core::collaborators::{ActivityLog, BitmapStore, BlockDevice, MetadataStore, MetadataSyncFlags};
use mirrorblk_core::config::{Config, WireProtocol};
use mirrorblk_core::device::Device;
use mirrorblk_core::pool::Pool;

struct NullBitmap {
    out_of_sync: std::sync::Mutex<Vec<(u64, u32)>>,
}

impl BitmapStore for NullBitmap {
    fn set_out_of_sync(&self, sector: u64, len: u32) {
        self.out_of_sync.lock().unwrap().push((sector, len));
    }
    fn test(&self, _sector: u64) -> bool {
        false
    }
    fn words(&self, _offset_words: u32, _count: usize) -> Vec<u32> {
        Vec::new()
    }
    fn write(&self, _offset_words: u32, _words: &[u32]) {}
    fn get_lel(&self) -> u32 {
        0
    }
}

struct NullMetadata;
impl MetadataStore for NullMetadata {
    fn sync(&self, _flags: MetadataSyncFlags) {}
}

struct NullActivityLog;
impl ActivityLog for NullActivityLog {
    fn begin_io(&self, _sector: u64) {}
    fn end_io(&self, _sector: u64) {}
}

struct NullBlockDevice {
    kicks: AtomicU32,
}

#[async_trait::async_trait]
impl BlockDevice for NullBlockDevice {
    async fn sync_page_io(&self, _sector: u64, _bytes: &[u8]) -> std::io::Result<()> {
        Ok(())
    }
    async fn read_page_io(&self, _sector: u64, len: u32) -> std::io::Result<Bytes> {
        Ok(Bytes::from(vec![0u8; len as usize]))
    }
    fn kick_lo(&self) {
        self.kicks.fetch_add(1, Ordering::Relaxed);
    }
    fn get_capacity(&self) -> u64 {
        1 << 20
    }
}

struct FailingBlockDevice;

#[async_trait::async_trait]
impl BlockDevice for FailingBlockDevice {
    async fn sync_page_io(&self, _sector: u64, _bytes: &[u8]) -> std::io::Result<()> {
        Err(std::io::Error::other("simulated local write failure"))
    }
    async fn read_page_io(&self, _sector: u64, len: u32) -> std::io::Result<Bytes> {
        Ok(Bytes::from(vec![0u8; len as usize]))
    }
    fn kick_lo(&self) {}
    fn get_capacity(&self) -> u64 {
        1 << 20
    }
}

fn collaborators() -> (
    Arc<dyn BitmapStore>,
    Arc<dyn MetadataStore>,
    Arc<dyn ActivityLog>,
    Arc<dyn BlockDevice>,
) {
    (
        Arc::new(NullBitmap {
            out_of_sync: std::sync::Mutex::new(Vec::new()),
        }),
        Arc::new(NullMetadata),
        Arc::new(NullActivityLog),
        Arc::new(NullBlockDevice {
            kicks: AtomicU32::new(0),
        }),
    )
}

async fn connected_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connect = TcpStream::connect(addr);
    let (accept, connect) = tokio::join!(listener.accept(), connect);
    (accept.unwrap().0, connect.unwrap())
}

fn pools() -> (Arc<Pool<Vec<u8>>>, Arc<Pool<Vec<u8>>>) {
    (Arc::new(Pool::new(4, Vec::new)), Arc::new(Pool::new(4, Vec::new)))
}

async fn make_device(minor: u32, config: Config) -> Arc<Device> {
    let (data_a, _data_b_unused) = connected_pair().await;
    let (meta_a, _meta_b_unused) = connected_pair().await;
    let (bitmap, metadata, activity_log, block_device) = collaborators();
    let (request_pool, ee_pool) = pools();
    Arc::new(Device::new(
        minor,
        config,
        data_a,
        meta_a,
        bitmap,
        metadata,
        activity_log,
        block_device,
        request_pool,
        ee_pool,
    ))
}

/// Scenario 1 (clean barrier round-trip), exercised at the TL/channel
/// level: four writes at `max_epoch_size = 3` close exactly one barrier
/// after the third write.
#[tokio::test]
async fn clean_barrier_round_trip_closes_after_third_write() {
    let mut config = Config::default();
    config.wire_protocol = WireProtocol::C;
    config.max_epoch_size = 3;
    let device = make_device(0, config).await;

    for (id, sector) in [(1u64, 0u64), (2, 8), (3, 16)] {
        let req = mirrorblk_core::tl::Request::new(id, sector, 4096, mirrorblk_core::tl::EpochId(0));
        device.tl.tl_add(req);
    }
    assert!(device.tl.issue_barrier.is_set());

    let closing_epoch = device.tl.tl_add_barrier();
    let released = device.tl.tl_release(closing_epoch.0, 3);
    assert_eq!(released.len(), 3);
    assert!(!device.tl.issue_barrier.is_set());

    let fourth = mirrorblk_core::tl::Request::new(4, 24, 4096, mirrorblk_core::tl::EpochId(0));
    device.tl.tl_add(fourth);
    assert!(!device.tl.issue_barrier.is_set());
}

/// Scenario 6 (local disk failure under `on_io_error=Detach`): a failing
/// `BlockDevice` drives the disk state to `Diskless` and reports
/// `IoPolicyError::Detached` rather than propagating the raw I/O error.
#[tokio::test]
async fn local_write_failure_detaches_the_disk() {
    use mirrorblk_core::config::OnIoError;
    use mirrorblk_core::error::IoPolicyError;
    use mirrorblk_core::state::{Conn, Disk, Role};

    let mut config = Config::default();
    config.on_io_error = OnIoError::Detach;

    let (data_a, _data_b) = connected_pair().await;
    let (meta_a, _meta_b) = connected_pair().await;
    let (bitmap, metadata, activity_log, _) = collaborators();
    let (request_pool, ee_pool) = pools();
    let device = Device::new(
        2,
        config,
        data_a,
        meta_a,
        bitmap,
        metadata,
        activity_log,
        Arc::new(FailingBlockDevice),
        request_pool,
        ee_pool,
    );

    device.state.force(mirrorblk_core::state::DeviceState {
        role: Role::Primary,
        peer_role: Role::Secondary,
        conn: Conn::Connected,
        disk: Disk::UpToDate,
        pdisk: Disk::UpToDate,
    });

    let result = device.write_local(0, 4096, &[0u8; 4096]).await;
    assert_eq!(result.unwrap_err(), IoPolicyError::Detached);
    assert_eq!(device.state.read().disk, Disk::Diskless);
}

/// Scenario 2 (connection loss drains TL): of five submitted writes, three
/// marked `SENT` and two not; after `tl_clear`, the two unsent ones
/// complete synthetically and (protocol B) all five are marked
/// out-of-sync, `ap_pending` reaching zero.
#[tokio::test]
async fn connection_loss_drains_transfer_log() {
    let mut config = Config::default();
    config.wire_protocol = WireProtocol::B;
    let device = make_device(1, config).await;

    for (id, sector, sent) in [
        (1u64, 0u64, true),
        (2, 8, true),
        (3, 16, true),
        (4, 24, false),
        (5, 32, false),
    ] {
        let req = mirrorblk_core::tl::Request::new(id, sector, 4096, mirrorblk_core::tl::EpochId(0));
        let handle = device.tl.tl_add(req);
        device.pending.inc_ap_pending();
        if sent {
            handle
                .lock()
                .unwrap()
                .status
                .insert(mirrorblk_core::tl::RequestStatus::SENT);
        }
    }

    device.drain_transfer_log_on_connection_loss();
    assert_eq!(device.pending.ap_pending(), 0);

    tokio::time::sleep(Duration::from_millis(1)).await;
}

struct RecordingBlockDevice {
    writes: AtomicU32,
}

#[async_trait::async_trait]
impl BlockDevice for RecordingBlockDevice {
    async fn sync_page_io(&self, _sector: u64, _bytes: &[u8]) -> std::io::Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
    async fn read_page_io(&self, _sector: u64, len: u32) -> std::io::Result<Bytes> {
        Ok(Bytes::from(vec![0u8; len as usize]))
    }
    fn kick_lo(&self) {}
    fn get_capacity(&self) -> u64 {
        1 << 20
    }
}

/// End-to-end: two `Device`s negotiate the handshake, the primary submits a
/// write, and the secondary's `BlockDevice` actually observes it before the
/// primary's protocol-C submission completes — exercising the receiver's
/// disk-write-then-WriteAck path and the asender's ack-driven completion
/// over a real loopback socket pair, not just in-process TL/state calls.
#[tokio::test]
async fn end_to_end_write_replicates_to_the_secondary_disk() {
    use mirrorblk_core::state::{Conn, DeviceState, Disk, Role};

    let config = Config::default();

    let (data_a, data_b) = connected_pair().await;
    let (meta_a, meta_b) = connected_pair().await;

    let (bitmap_a, metadata_a, activity_a, block_a) = collaborators();
    let bitmap_b: Arc<dyn BitmapStore> = Arc::new(NullBitmap {
        out_of_sync: std::sync::Mutex::new(Vec::new()),
    });
    let metadata_b: Arc<dyn MetadataStore> = Arc::new(NullMetadata);
    let activity_b: Arc<dyn ActivityLog> = Arc::new(NullActivityLog);
    let secondary_disk = Arc::new(RecordingBlockDevice {
        writes: AtomicU32::new(0),
    });

    let (request_pool_a, ee_pool_a) = pools();
    let (request_pool_b, ee_pool_b) = pools();

    let primary = Arc::new(Device::new(
        0,
        config.clone(),
        data_a,
        meta_a,
        bitmap_a,
        metadata_a,
        activity_a,
        block_a,
        request_pool_a,
        ee_pool_a,
    ));
    let secondary = Arc::new(Device::new(
        1,
        config,
        data_b,
        meta_b,
        bitmap_b,
        metadata_b,
        activity_b,
        secondary_disk.clone(),
        request_pool_b,
        ee_pool_b,
    ));

    primary.state.force(DeviceState {
        role: Role::Primary,
        peer_role: Role::Secondary,
        conn: Conn::Connected,
        disk: Disk::UpToDate,
        pdisk: Disk::UpToDate,
    });
    secondary.state.force(DeviceState {
        role: Role::Secondary,
        peer_role: Role::Primary,
        conn: Conn::Connected,
        disk: Disk::UpToDate,
        pdisk: Disk::UpToDate,
    });

    let (primary_started, secondary_started) = tokio::join!(primary.start(), secondary.start());
    primary_started.unwrap();
    secondary_started.unwrap();

    mirrorblk_core::pipeline::submit_write(&primary, 1, 0, Bytes::from(vec![7u8; 4096]))
        .await
        .unwrap();

    assert_eq!(secondary_disk.writes.load(Ordering::Relaxed), 1);
    assert_eq!(primary.pending.ap_pending(), 0);

    primary.shutdown().await;
    secondary.shutdown().await;
}
