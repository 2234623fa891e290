//! External collaborators (§1 Non-goals, §6): the block-layer glue, on-disk
//! metadata/bitmap/activity-log formats, and local storage are deliberately
//! out of scope. The core only calls their operations, expressed here as
//! trait boundaries so the core can be built and tested without them.

use async_trait::async_trait;

/// Out-of-sync bitmap of the backing storage (§6 `bitmap.{set_out_of_sync,
/// test, words, write, get_lel}`).
pub trait BitmapStore: Send + Sync {
    fn set_out_of_sync(&self, sector: u64, len: u32);
    fn test(&self, sector: u64) -> bool;
    fn words(&self, offset_words: u32, count: usize) -> Vec<u32>;
    fn write(&self, offset_words: u32, words: &[u32]);
    /// Last en-sync-large bitmap word index: upper bound for a scan.
    fn get_lel(&self) -> u32;
}

/// On-disk metadata block (§6): `{la_size, uuid, peer_uuid, gc[5], magic,
/// md_size, al_offset, al_nr_extents, bm_offset}`.
pub trait MetadataStore: Send + Sync {
    fn sync(&self, flags: MetadataSyncFlags);
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MetadataSyncFlags: u32 {
        const CONSISTENT = 0b01;
        const FULL_SYNC  = 0b10;
    }
}

/// Activity log journal guarding in-flight extents against crash-inconsistency.
pub trait ActivityLog: Send + Sync {
    fn begin_io(&self, sector: u64);
    fn end_io(&self, sector: u64);
}

/// The local block device the core mirrors writes onto/from (§6 downward
/// interface: `sync_page_io`, `kick_lo`, `get_capacity`).
#[async_trait]
pub trait BlockDevice: Send + Sync {
    async fn sync_page_io(&self, sector: u64, bytes: &[u8]) -> std::io::Result<()>;
    async fn read_page_io(&self, sector: u64, len: u32) -> std::io::Result<bytes::Bytes>;
    fn kick_lo(&self);
    fn get_capacity(&self) -> u64;
}
