//! Transfer Log & Epoch Barriers (§3, §4.2).
//!
//! Barriers are arena-keyed by epoch number inside one `VecDeque`, never a
//! free-standing heap graph node (§9 cyclic-structures note); a `Request`
//! holds its barrier's epoch id, never an owning/back reference to it.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use bitflags::bitflags;

use crate::error::TlError;

/// Quantization shift applied to sectors before hashing (§3 TL Hash).
pub const HT_SHIFT: u32 = 3;

fn hash_key(sector: u64) -> u64 {
    sector >> HT_SHIFT
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EpochId(pub u32);

impl EpochId {
    pub fn next(self) -> EpochId {
        EpochId(self.0.wrapping_add(1))
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RequestStatus: u32 {
        const IN_TL         = 0b0001;
        const SENT          = 0b0010;
        const RECV_WRITTEN  = 0b0100;
        const ACKED         = 0b1000;
    }
}

pub type RequestId = u64;

pub struct Request {
    pub id: RequestId,
    pub sector: u64,
    pub len: u32,
    pub seq: Option<u32>,
    pub status: RequestStatus,
    pub barrier: EpochId,
    /// Signalled by the asender once the protocol-required ack for this
    /// request arrives, so the submission path in `pipeline.rs` can await
    /// completion per the wire-protocol level (§4.8).
    pub completion: Arc<tokio::sync::Notify>,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("sector", &self.sector)
            .field("len", &self.len)
            .field("seq", &self.seq)
            .field("status", &self.status)
            .field("barrier", &self.barrier)
            .finish()
    }
}

impl Request {
    pub fn new(id: RequestId, sector: u64, len: u32, barrier: EpochId) -> Self {
        Self {
            id,
            sector,
            len,
            seq: None,
            status: RequestStatus::IN_TL,
            barrier,
            completion: Arc::new(tokio::sync::Notify::new()),
        }
    }
}

pub type RequestHandle = Arc<Mutex<Request>>;

struct Barrier {
    epoch: EpochId,
    requests: VecDeque<RequestHandle>,
}

impl Barrier {
    fn new(epoch: EpochId) -> Self {
        Self {
            epoch,
            requests: VecDeque::new(),
        }
    }
}

/// Set when an epoch has crossed `max_epoch_size` and the sender must emit
/// a `Barrier` packet on its next send (§4.2 TL3).
#[derive(Debug, Default)]
pub struct IssueBarrierFlag(std::sync::atomic::AtomicBool);

impl IssueBarrierFlag {
    pub fn is_set(&self) -> bool {
        self.0.load(std::sync::atomic::Ordering::Acquire)
    }

    fn set(&self) {
        self.0.store(true, std::sync::atomic::Ordering::Release);
    }

    pub fn clear(&self) {
        self.0.store(false, std::sync::atomic::Ordering::Release);
    }
}

struct TlInner {
    barriers: VecDeque<Barrier>,
    hash: HashMap<u64, Vec<RequestHandle>>,
    /// `block_id` -> handle, for the asender's by-identity ack lookup.
    by_id: HashMap<RequestId, RequestHandle>,
    /// Two-primaries conflict detection: sectors currently covered by a
    /// peer-originated EE (§4.2).
    ee_hash: HashMap<u64, Vec<(u64, u32)>>,
    max_epoch_size: u32,
}

impl TlInner {
    fn newest_epoch(&self) -> EpochId {
        self.barriers.back().expect("TL always has a newest barrier").epoch
    }
}

/// Transfer Log: ordered FIFO of in-flight write requests grouped into
/// epoch barriers, plus the hash index used for conflict detection.
pub struct TransferLog {
    inner: Mutex<TlInner>,
    pub issue_barrier: IssueBarrierFlag,
}

impl TransferLog {
    pub fn new(max_epoch_size: u32) -> Self {
        let mut barriers = VecDeque::new();
        barriers.push_back(Barrier::new(EpochId(0)));
        Self {
            inner: Mutex::new(TlInner {
                barriers,
                hash: HashMap::new(),
                by_id: HashMap::new(),
                ee_hash: HashMap::new(),
                max_epoch_size,
            }),
            issue_barrier: IssueBarrierFlag::default(),
        }
    }

    /// `tl_add`: append to the newest barrier, set `IN_TL`, insert into the
    /// hash by sector. Sets `ISSUE_BARRIER` once the epoch crosses threshold.
    pub fn tl_add(&self, mut request: Request) -> RequestHandle {
        let mut inner = self.inner.lock().unwrap();
        request.status.insert(RequestStatus::IN_TL);
        request.barrier = inner.newest_epoch();
        let key = hash_key(request.sector);
        let id = request.id;
        let handle = Arc::new(Mutex::new(request));
        inner.hash.entry(key).or_default().push(handle.clone());
        inner.by_id.insert(id, handle.clone());
        let barrier = inner.barriers.back_mut().unwrap();
        barrier.requests.push_back(handle.clone());
        let n_req = barrier.requests.len() as u32;
        let max = inner.max_epoch_size;
        if n_req >= max {
            self.issue_barrier.set();
        }
        handle
    }

    /// `tl_cancel`: remove from list and hash, clear `IN_TL`. Used when a
    /// send fails before the request reaches the wire.
    pub fn tl_cancel(&self, request: &RequestHandle) {
        let mut inner = self.inner.lock().unwrap();
        let (sector, barrier_epoch, id) = {
            let r = request.lock().unwrap();
            (r.sector, r.barrier, r.id)
        };
        let key = hash_key(sector);
        if let Some(chain) = inner.hash.get_mut(&key) {
            chain.retain(|r| !Arc::ptr_eq(r, request));
        }
        inner.by_id.remove(&id);
        if let Some(barrier) = inner.barriers.iter_mut().find(|b| b.epoch == barrier_epoch) {
            barrier.requests.retain(|r| !Arc::ptr_eq(r, request));
        }
        request.lock().unwrap().status.remove(RequestStatus::IN_TL);
    }

    /// Looks a request up by its wire `block_id`, used by the asender to
    /// apply an ack received by identity rather than by sector (§4.6).
    pub fn find_by_id(&self, id: RequestId) -> Option<RequestHandle> {
        self.inner.lock().unwrap().by_id.get(&id).cloned()
    }

    /// `tl_add_barrier`: allocate a fresh barrier, link it as the new
    /// newest, and return the OLD newest's epoch number — that is the
    /// number transmitted on the wire.
    pub fn tl_add_barrier(&self) -> EpochId {
        let mut inner = self.inner.lock().unwrap();
        let closing = inner.newest_epoch();
        let next = closing.next();
        inner.barriers.push_back(Barrier::new(next));
        self.issue_barrier.clear();
        closing
    }

    /// `tl_release`: pop the oldest barrier on `BarrierAck(epoch, set_size)`.
    /// A mismatch is an invariant violation elevated to `FatalInvariant`
    /// per the open-question resolution in §9 — it panics rather than
    /// returning an error.
    pub fn tl_release(&self, epoch: u32, set_size: u32) -> Vec<RequestHandle> {
        let mut inner = self.inner.lock().unwrap();
        let oldest = inner
            .barriers
            .front()
            .unwrap_or_else(|| panic!("FatalInvariant: tl_release on an empty transfer log"));
        if oldest.epoch.0 != epoch || oldest.requests.len() as u32 != set_size {
            panic!(
                "FatalInvariant: {}",
                TlError::EpochMismatch {
                    expected: oldest.epoch.0,
                    found: epoch,
                }
            );
        }
        let barrier = inner.barriers.pop_front().unwrap();
        // The detached barrier must not be the last one: a fresh newest is
        // always present so tl_add never finds an empty deque.
        if inner.barriers.is_empty() {
            inner.barriers.push_back(Barrier::new(barrier.epoch.next()));
        }
        barrier.requests.into_iter().collect()
    }

    /// Removes a fully-acked request from the hash and by-id indexes. Does
    /// not touch the barrier list: `tl_release` owns detaching the barrier
    /// structure itself, independently of individual request completion
    /// (§4.2 `tl_release`'s note that per-request completion is separate).
    pub fn tl_finalize(&self, id: RequestId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(handle) = inner.by_id.remove(&id) {
            let sector = handle.lock().unwrap().sector;
            let key = hash_key(sector);
            if let Some(chain) = inner.hash.get_mut(&key) {
                chain.retain(|r| !Arc::ptr_eq(r, &handle));
            }
        }
    }

    /// `tl_verify`: membership test used by the asender to match an
    /// incoming ack to a live Request.
    pub fn tl_verify(&self, request: &RequestHandle, sector: u64) -> bool {
        let inner = self.inner.lock().unwrap();
        let key = hash_key(sector);
        inner
            .hash
            .get(&key)
            .map(|chain| chain.iter().any(|r| Arc::ptr_eq(r, request)))
            .unwrap_or(false)
    }

    /// `tl_dependence`: remove the request from list and hash; return true
    /// iff it was in the current (newest) epoch.
    pub fn tl_dependence(&self, request: &RequestHandle) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let (sector, barrier_epoch) = {
            let r = request.lock().unwrap();
            (r.sector, r.barrier)
        };
        let key = hash_key(sector);
        if let Some(chain) = inner.hash.get_mut(&key) {
            chain.retain(|r| !Arc::ptr_eq(r, request));
        }
        let newest = inner.newest_epoch();
        if let Some(barrier) = inner.barriers.iter_mut().find(|b| b.epoch == barrier_epoch) {
            barrier.requests.retain(|r| !Arc::ptr_eq(r, request));
        }
        barrier_epoch == newest
    }

    /// `tl_clear`: on connection loss, replace the barrier list with a
    /// fresh empty barrier. Returns the detached requests so the caller can
    /// complete/mark-out-of-sync them and update `ap_pending` (§4.2).
    pub fn tl_clear(&self) -> Vec<RequestHandle> {
        let mut inner = self.inner.lock().unwrap();
        let next_epoch = inner.newest_epoch().next();
        let old_barriers = std::mem::replace(&mut inner.barriers, VecDeque::new());
        inner.barriers.push_back(Barrier::new(next_epoch));
        inner.hash.clear();
        inner.by_id.clear();
        self.issue_barrier.clear();
        old_barriers
            .into_iter()
            .flat_map(|b| b.requests.into_iter())
            .collect()
    }

    /// `ee_have_write`: true if no peer-originated EE overlaps `[sector,
    /// sector+len)`. Two-primaries only.
    pub fn ee_have_write(&self, sector: u64, len: u32) -> bool {
        let inner = self.inner.lock().unwrap();
        !Self::overlaps(&inner.ee_hash, sector, len)
    }

    /// `req_have_write`: symmetric check on the inbound path — true if no
    /// locally-submitted, unacked Request overlaps the peer's EE range.
    pub fn req_have_write(&self, sector: u64, len: u32) -> bool {
        let inner = self.inner.lock().unwrap();
        let key = hash_key(sector);
        let neighbours = [key.saturating_sub(1), key, key + 1];
        !neighbours.iter().any(|k| {
            inner
                .hash
                .get(k)
                .map(|chain| {
                    chain.iter().any(|r| {
                        let r = r.lock().unwrap();
                        ranges_overlap(r.sector, r.len, sector, len)
                    })
                })
                .unwrap_or(false)
        })
    }

    pub fn note_ee(&self, sector: u64, len: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.ee_hash.entry(hash_key(sector)).or_default().push((sector, len));
    }

    pub fn forget_ee(&self, sector: u64, len: u32) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(chain) = inner.ee_hash.get_mut(&hash_key(sector)) {
            chain.retain(|&(s, l)| !(s == sector && l == len));
        }
    }

    fn overlaps(ee_hash: &HashMap<u64, Vec<(u64, u32)>>, sector: u64, len: u32) -> bool {
        let key = hash_key(sector);
        let neighbours = [key.saturating_sub(1), key, key + 1];
        neighbours.iter().any(|k| {
            ee_hash
                .get(k)
                .map(|chain| chain.iter().any(|&(s, l)| ranges_overlap(s, l, sector, len)))
                .unwrap_or(false)
        })
    }
}

fn ranges_overlap(a_sector: u64, a_len: u32, b_sector: u64, b_len: u32) -> bool {
    let a_end = a_sector + a_len as u64;
    let b_end = b_sector + b_len as u64;
    a_sector < b_end && b_sector < a_end
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(id: u64, sector: u64) -> Request {
        Request::new(id, sector, 8, EpochId(0))
    }

    #[test]
    fn tl_fifo_release_is_a_prefix_of_add_order() {
        let tl = TransferLog::new(1024);
        let r1 = tl.tl_add(req(1, 0));
        let r2 = tl.tl_add(req(2, 8));
        let closing_epoch = tl.tl_add_barrier();
        let released = tl.tl_release(closing_epoch.0, 2);
        assert_eq!(released.len(), 2);
        assert!(Arc::ptr_eq(&released[0], &r1));
        assert!(Arc::ptr_eq(&released[1], &r2));
    }

    #[test]
    #[should_panic(expected = "FatalInvariant")]
    fn tl_release_mismatch_is_fatal() {
        let tl = TransferLog::new(1024);
        tl.tl_add(req(1, 0));
        let closing_epoch = tl.tl_add_barrier();
        tl.tl_release(closing_epoch.0, 999);
    }

    #[test]
    fn hash_consistency_before_and_after_cancel() {
        let tl = TransferLog::new(1024);
        let r = tl.tl_add(req(1, 16));
        assert!(tl.tl_verify(&r, 16));
        tl.tl_cancel(&r);
        assert!(!tl.tl_verify(&r, 16));
    }

    #[test]
    fn issue_barrier_set_once_epoch_crosses_threshold() {
        let tl = TransferLog::new(2);
        assert!(!tl.issue_barrier.is_set());
        tl.tl_add(req(1, 0));
        assert!(!tl.issue_barrier.is_set());
        tl.tl_add(req(2, 8));
        assert!(tl.issue_barrier.is_set());
    }

    #[test]
    fn tl_clear_detaches_every_in_flight_request() {
        let tl = TransferLog::new(1024);
        tl.tl_add(req(1, 0));
        tl.tl_add(req(2, 8));
        let drained = tl.tl_clear();
        assert_eq!(drained.len(), 2);
        for r in &drained {
            assert!(!tl.tl_verify(r, r.lock().unwrap().sector));
        }
    }

    #[test]
    fn two_primaries_exclusion_detects_overlap() {
        let tl = TransferLog::new(1024);
        tl.tl_add(req(1, 100));
        assert!(!tl.req_have_write(100, 8));
        assert!(tl.req_have_write(200, 8));

        tl.note_ee(300, 8);
        assert!(!tl.ee_have_write(300, 8));
        assert!(tl.ee_have_write(400, 8));
    }
}
