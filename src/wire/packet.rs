//! Payload types for every command in §4.3, plus the `Packet` dispatch enum.
//!
//! All multi-byte integers are big-endian (network order is `Writer`/`Reader`'s
//! only mode, see `wire::serializer`). The `HandShake` record is frozen at
//! exactly 80 bytes, validated both at compile time and whenever one is built.

use bytes::Bytes;

use super::header::Command;
use super::serializer::{Reader, ReaderError, Serializer, Writer};
use crate::gencounts::GenCounts;
use crate::state::{Conn, Disk, Role};

/// Number of 32-bit words carried by one `ReportBitMap` chunk.
pub const BM_PACKET_WORDS: usize = 512;

pub const HANDSHAKE_SIZE: usize = 80;

#[derive(Debug, Clone)]
pub struct HandShake {
    pub protocol_min: u32,
    pub protocol_max: u32,
    pub node_id: u64,
    pub flags: u32,
    reserved: [u8; 60],
}

// §4.3: "an implementation MUST refuse to start if its compiled HandShake
// record is not exactly this size." Checked once at compile time...
const _: () = assert!(4 + 4 + 8 + 4 + 60 == HANDSHAKE_SIZE);

impl HandShake {
    pub fn new(protocol_min: u32, protocol_max: u32, node_id: u64, flags: u32) -> Self {
        let hs = Self {
            protocol_min,
            protocol_max,
            node_id,
            flags,
            reserved: [0u8; 60],
        };
        // ...and again at every construction, in case a future edit changes a
        // field's width without updating `reserved` to compensate.
        assert_eq!(hs.encoded_len(), HANDSHAKE_SIZE);
        hs
    }
}

impl Serializer for HandShake {
    fn write(&self, writer: &mut Writer) {
        writer.write_u32(self.protocol_min);
        writer.write_u32(self.protocol_max);
        writer.write_u64(self.node_id);
        writer.write_u32(self.flags);
        writer.write_bytes(&self.reserved);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let protocol_min = reader.read_u32()?;
        let protocol_max = reader.read_u32()?;
        let node_id = reader.read_u64()?;
        let flags = reader.read_u32()?;
        let reserved_bytes = reader.read_bytes(60)?;
        let mut reserved = [0u8; 60];
        reserved.copy_from_slice(reserved_bytes);
        Ok(Self {
            protocol_min,
            protocol_max,
            node_id,
            flags,
            reserved,
        })
    }

    fn encoded_len(&self) -> usize {
        HANDSHAKE_SIZE
    }
}

/// Negotiated protocol level, reported right after the handshake.
#[derive(Debug, Clone, Copy)]
pub struct ReportProtocol {
    pub level: u8,
    pub two_primaries: bool,
}

impl Serializer for ReportProtocol {
    fn write(&self, writer: &mut Writer) {
        writer.write_u8(self.level);
        writer.write_u8(self.two_primaries as u8);
        writer.write_u16(0);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let level = reader.read_u8()?;
        let two_primaries = reader.read_u8()? != 0;
        let _reserved = reader.read_u16()?;
        Ok(Self {
            level,
            two_primaries,
        })
    }

    fn encoded_len(&self) -> usize {
        4
    }
}

#[derive(Debug, Clone)]
pub struct ReportGenCnt {
    pub counts: GenCounts,
}

impl Serializer for ReportGenCnt {
    fn write(&self, writer: &mut Writer) {
        for c in self.counts.counters() {
            writer.write_u32(*c);
        }
        writer.write_u32(self.counts.flags().bits());
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let mut counters = [0u32; 5];
        for c in counters.iter_mut() {
            *c = reader.read_u32()?;
        }
        let flags = reader.read_u32()?;
        Ok(Self {
            counts: GenCounts::from_parts(counters, flags),
        })
    }

    fn encoded_len(&self) -> usize {
        5 * 4 + 4
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReportSizes {
    pub disk_size_sectors: u64,
    pub user_size_sectors: u64,
    pub max_bio_size: u32,
    pub queue_order_type: u16,
}

impl Serializer for ReportSizes {
    fn write(&self, writer: &mut Writer) {
        writer.write_u64(self.disk_size_sectors);
        writer.write_u64(self.user_size_sectors);
        writer.write_u32(self.max_bio_size);
        writer.write_u16(self.queue_order_type);
        writer.write_u16(0);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            disk_size_sectors: reader.read_u64()?,
            user_size_sectors: reader.read_u64()?,
            max_bio_size: reader.read_u32()?,
            queue_order_type: {
                let v = reader.read_u16()?;
                let _reserved = reader.read_u16()?;
                v
            },
        })
    }

    fn encoded_len(&self) -> usize {
        8 + 8 + 4 + 2 + 2
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReportState {
    pub role: Role,
    pub peer_role: Role,
    pub conn: Conn,
    pub disk: Disk,
    pub pdisk: Disk,
}

impl Serializer for ReportState {
    fn write(&self, writer: &mut Writer) {
        writer.write_u8(self.role as u8);
        writer.write_u8(self.peer_role as u8);
        writer.write_u8(self.conn as u8);
        writer.write_u8(self.disk as u8);
        writer.write_u8(self.pdisk as u8);
        writer.write_u8(0);
        writer.write_u16(0);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let role = Role::from_u8(reader.read_u8()?)?;
        let peer_role = Role::from_u8(reader.read_u8()?)?;
        let conn = Conn::from_u8(reader.read_u8()?)?;
        let disk = Disk::from_u8(reader.read_u8()?)?;
        let pdisk = Disk::from_u8(reader.read_u8()?)?;
        let _reserved = reader.read_u8()?;
        let _reserved = reader.read_u16()?;
        Ok(Self {
            role,
            peer_role,
            conn,
            disk,
            pdisk,
        })
    }

    fn encoded_len(&self) -> usize {
        8
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SyncParam {
    pub rate_bytes_per_sec: u32,
    pub use_csums: bool,
    pub skip: bool,
    pub group: u16,
    pub al_extents: u32,
}

impl Serializer for SyncParam {
    fn write(&self, writer: &mut Writer) {
        writer.write_u32(self.rate_bytes_per_sec);
        writer.write_u8(self.use_csums as u8);
        writer.write_u8(self.skip as u8);
        writer.write_u16(self.group);
        writer.write_u32(self.al_extents);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            rate_bytes_per_sec: reader.read_u32()?,
            use_csums: reader.read_u8()? != 0,
            skip: reader.read_u8()? != 0,
            group: reader.read_u16()?,
            al_extents: reader.read_u32()?,
        })
    }

    fn encoded_len(&self) -> usize {
        4 + 1 + 1 + 2 + 4
    }
}

#[derive(Debug, Clone)]
pub struct ReportBitMap {
    pub offset_words: u32,
    pub words: Vec<u32>,
}

impl Serializer for ReportBitMap {
    fn write(&self, writer: &mut Writer) {
        writer.write_u32(self.offset_words);
        writer.write_u16(self.words.len() as u16);
        writer.write_u16(0);
        for w in &self.words {
            writer.write_u32(*w);
        }
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let offset_words = reader.read_u32()?;
        let count = reader.read_u16()? as usize;
        let _reserved = reader.read_u16()?;
        if count > BM_PACKET_WORDS {
            return Err(ReaderError::InvalidValue);
        }
        let mut words = Vec::with_capacity(count);
        for _ in 0..count {
            words.push(reader.read_u32()?);
        }
        Ok(Self {
            offset_words,
            words,
        })
    }

    fn encoded_len(&self) -> usize {
        4 + 2 + 2 + self.words.len() * 4
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Barrier {
    pub epoch: u32,
}

impl Serializer for Barrier {
    fn write(&self, writer: &mut Writer) {
        writer.write_u32(self.epoch);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            epoch: reader.read_u32()?,
        })
    }

    fn encoded_len(&self) -> usize {
        4
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BarrierAck {
    pub epoch: u32,
    pub set_size: u32,
}

impl Serializer for BarrierAck {
    fn write(&self, writer: &mut Writer) {
        writer.write_u32(self.epoch);
        writer.write_u32(self.set_size);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            epoch: reader.read_u32()?,
            set_size: reader.read_u32()?,
        })
    }

    fn encoded_len(&self) -> usize {
        8
    }
}

/// `Data` payload: `{sector u64, block_id u64, seq_num u32}` followed by the
/// bulk write bytes (§4.3). `DataReply`/`RSDataReply` share this shape.
#[derive(Debug, Clone)]
pub struct DataBlock {
    pub sector: u64,
    pub block_id: u64,
    pub seq_num: u32,
    pub bytes: Bytes,
}

impl Serializer for DataBlock {
    fn write(&self, writer: &mut Writer) {
        writer.write_u64(self.sector);
        writer.write_u64(self.block_id);
        writer.write_u32(self.seq_num);
        writer.write_bytes(&self.bytes);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let sector = reader.read_u64()?;
        let block_id = reader.read_u64()?;
        let seq_num = reader.read_u32()?;
        let bytes = Bytes::copy_from_slice(reader.read_bytes(reader.remaining())?);
        Ok(Self {
            sector,
            block_id,
            seq_num,
            bytes,
        })
    }

    fn encoded_len(&self) -> usize {
        8 + 8 + 4 + self.bytes.len()
    }
}

/// Shared shape of `WriteAck`/`RecvAck`/`NegAck`.
#[derive(Debug, Clone, Copy)]
pub struct BlockAck {
    pub sector: u64,
    pub block_id: u64,
    pub seq_num: u32,
}

impl Serializer for BlockAck {
    fn write(&self, writer: &mut Writer) {
        writer.write_u64(self.sector);
        writer.write_u64(self.block_id);
        writer.write_u32(self.seq_num);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            sector: reader.read_u64()?,
            block_id: reader.read_u64()?,
            seq_num: reader.read_u32()?,
        })
    }

    fn encoded_len(&self) -> usize {
        8 + 8 + 4
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DiscardNote {
    pub sector: u64,
    pub block_id: u64,
}

impl Serializer for DiscardNote {
    fn write(&self, writer: &mut Writer) {
        writer.write_u64(self.sector);
        writer.write_u64(self.block_id);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            sector: reader.read_u64()?,
            block_id: reader.read_u64()?,
        })
    }

    fn encoded_len(&self) -> usize {
        16
    }
}

/// One fully-decoded wire packet, tagged by command (§9 design note: a
/// tagged sum with a single match-dispatch on receive, not a class hierarchy).
#[derive(Debug, Clone)]
pub enum Packet {
    HandShake(HandShake),
    ReportProtocol(ReportProtocol),
    ReportGenCnt(ReportGenCnt),
    ReportSizes(ReportSizes),
    ReportState(ReportState),
    SyncParam(SyncParam),
    ReportBitMap(ReportBitMap),
    Barrier(Barrier),
    BarrierAck(BarrierAck),
    Data(DataBlock),
    DataReply(DataBlock),
    RsDataReply(DataBlock),
    WriteAck(BlockAck),
    RecvAck(BlockAck),
    NegAck(BlockAck),
    DiscardNote(DiscardNote),
    Ping,
    PingAck,
}

impl Packet {
    pub fn command(&self) -> Command {
        match self {
            Packet::HandShake(_) => Command::HandShake,
            Packet::ReportProtocol(_) => Command::ReportProtocol,
            Packet::ReportGenCnt(_) => Command::ReportGenCnt,
            Packet::ReportSizes(_) => Command::ReportSizes,
            Packet::ReportState(_) => Command::ReportState,
            Packet::SyncParam(_) => Command::SyncParam,
            Packet::ReportBitMap(_) => Command::ReportBitMap,
            Packet::Barrier(_) => Command::Barrier,
            Packet::BarrierAck(_) => Command::BarrierAck,
            Packet::Data(_) => Command::Data,
            Packet::DataReply(_) => Command::DataReply,
            Packet::RsDataReply(_) => Command::RsDataReply,
            Packet::WriteAck(_) => Command::WriteAck,
            Packet::RecvAck(_) => Command::RecvAck,
            Packet::NegAck(_) => Command::NegAck,
            Packet::DiscardNote(_) => Command::DiscardNote,
            Packet::Ping => Command::Ping,
            Packet::PingAck => Command::PingAck,
        }
    }

    pub fn encoded_len(&self) -> usize {
        match self {
            Packet::HandShake(p) => p.encoded_len(),
            Packet::ReportProtocol(p) => p.encoded_len(),
            Packet::ReportGenCnt(p) => p.encoded_len(),
            Packet::ReportSizes(p) => p.encoded_len(),
            Packet::ReportState(p) => p.encoded_len(),
            Packet::SyncParam(p) => p.encoded_len(),
            Packet::ReportBitMap(p) => p.encoded_len(),
            Packet::Barrier(p) => p.encoded_len(),
            Packet::BarrierAck(p) => p.encoded_len(),
            Packet::Data(p) | Packet::DataReply(p) | Packet::RsDataReply(p) => p.encoded_len(),
            Packet::WriteAck(p) | Packet::RecvAck(p) | Packet::NegAck(p) => p.encoded_len(),
            Packet::DiscardNote(p) => p.encoded_len(),
            Packet::Ping | Packet::PingAck => 0,
        }
    }

    pub fn write_payload(&self, writer: &mut Writer) {
        match self {
            Packet::HandShake(p) => p.write(writer),
            Packet::ReportProtocol(p) => p.write(writer),
            Packet::ReportGenCnt(p) => p.write(writer),
            Packet::ReportSizes(p) => p.write(writer),
            Packet::ReportState(p) => p.write(writer),
            Packet::SyncParam(p) => p.write(writer),
            Packet::ReportBitMap(p) => p.write(writer),
            Packet::Barrier(p) => p.write(writer),
            Packet::BarrierAck(p) => p.write(writer),
            Packet::Data(p) | Packet::DataReply(p) | Packet::RsDataReply(p) => p.write(writer),
            Packet::WriteAck(p) | Packet::RecvAck(p) | Packet::NegAck(p) => p.write(writer),
            Packet::DiscardNote(p) => p.write(writer),
            Packet::Ping | Packet::PingAck => {}
        }
    }

    pub fn decode(command: Command, payload: &[u8]) -> Result<Self, ReaderError> {
        let mut reader = Reader::new(payload);
        let packet = match command {
            Command::HandShake => Packet::HandShake(HandShake::read(&mut reader)?),
            Command::ReportProtocol => Packet::ReportProtocol(ReportProtocol::read(&mut reader)?),
            Command::ReportGenCnt => Packet::ReportGenCnt(ReportGenCnt::read(&mut reader)?),
            Command::ReportSizes => Packet::ReportSizes(ReportSizes::read(&mut reader)?),
            Command::ReportState => Packet::ReportState(ReportState::read(&mut reader)?),
            Command::SyncParam => Packet::SyncParam(SyncParam::read(&mut reader)?),
            Command::ReportBitMap => Packet::ReportBitMap(ReportBitMap::read(&mut reader)?),
            Command::Barrier => Packet::Barrier(Barrier::read(&mut reader)?),
            Command::BarrierAck => Packet::BarrierAck(BarrierAck::read(&mut reader)?),
            Command::Data => Packet::Data(DataBlock::read(&mut reader)?),
            Command::DataReply => Packet::DataReply(DataBlock::read(&mut reader)?),
            Command::RsDataReply => Packet::RsDataReply(DataBlock::read(&mut reader)?),
            Command::WriteAck => Packet::WriteAck(BlockAck::read(&mut reader)?),
            Command::RecvAck => Packet::RecvAck(BlockAck::read(&mut reader)?),
            Command::NegAck => Packet::NegAck(BlockAck::read(&mut reader)?),
            Command::DiscardNote => Packet::DiscardNote(DiscardNote::read(&mut reader)?),
            Command::Ping => Packet::Ping,
            Command::PingAck => Packet::PingAck,
        };
        reader.finish()?;
        Ok(packet)
    }
}
