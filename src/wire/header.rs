//! Fixed 8-byte packet header shared by the data and meta channels.

use super::serializer::{Reader, ReaderError, Serializer, Writer};

/// Magic value stamped on every header; a mismatch is a protocol violation.
pub const MAGIC: u32 = 0x4272_4230; // "BrB0"

/// Command identifiers. Values are part of the wire format and must not be
/// renumbered once a deployment depends on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Command {
    HandShake = 1,
    ReportProtocol = 2,
    ReportGenCnt = 3,
    ReportSizes = 4,
    ReportState = 5,
    SyncParam = 6,
    ReportBitMap = 7,
    Barrier = 8,
    BarrierAck = 9,
    Data = 10,
    DataReply = 11,
    RsDataReply = 12,
    WriteAck = 13,
    RecvAck = 14,
    NegAck = 15,
    DiscardNote = 16,
    Ping = 17,
    PingAck = 18,
}

impl Command {
    pub fn from_u16(v: u16) -> Result<Self, ReaderError> {
        Ok(match v {
            1 => Command::HandShake,
            2 => Command::ReportProtocol,
            3 => Command::ReportGenCnt,
            4 => Command::ReportSizes,
            5 => Command::ReportState,
            6 => Command::SyncParam,
            7 => Command::ReportBitMap,
            8 => Command::Barrier,
            9 => Command::BarrierAck,
            10 => Command::Data,
            11 => Command::DataReply,
            12 => Command::RsDataReply,
            13 => Command::WriteAck,
            14 => Command::RecvAck,
            15 => Command::NegAck,
            16 => Command::DiscardNote,
            17 => Command::Ping,
            18 => Command::PingAck,
            _ => return Err(ReaderError::InvalidValue),
        })
    }
}

/// `{magic u32 BE, command u16 BE, payload_length u16 BE}`, 8 bytes total.
#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub command: Command,
    pub payload_length: u16,
}

pub const HEADER_SIZE: usize = 8;

impl Header {
    pub fn new(command: Command, payload_length: u16) -> Self {
        Self {
            command,
            payload_length,
        }
    }
}

impl Serializer for Header {
    fn write(&self, writer: &mut Writer) {
        writer.write_u32(MAGIC);
        writer.write_u16(self.command as u16);
        writer.write_u16(self.payload_length);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let magic = reader.read_u32()?;
        if magic != MAGIC {
            return Err(ReaderError::InvalidValue);
        }
        let command = Command::from_u16(reader.read_u16()?)?;
        let payload_length = reader.read_u16()?;
        Ok(Self {
            command,
            payload_length,
        })
    }

    fn encoded_len(&self) -> usize {
        HEADER_SIZE
    }
}
