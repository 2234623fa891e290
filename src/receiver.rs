//! Receiver Task (§4.5): single-threaded loop reading framed packets from
//! the data channel and dispatching by command. The only writer of the
//! receive-side EE lists.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio_util::sync::CancellationToken;

use crate::config::WireProtocol;
use crate::device::Device;
use crate::ee::{Ee, EeStatus};
use crate::error::WireError;
use crate::state::{ChgStateFlags, Conn, DeviceState, Role};
use crate::wire::packet::{BarrierAck, BlockAck, DiscardNote, Packet};
use crate::wire::{Header, Reader, Serializer, HEADER_SIZE};

pub(crate) async fn read_one(reader: &mut OwnedReadHalf) -> Result<Packet, WireError> {
    let mut header_buf = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header_buf).await?;
    let header = Header::read(&mut Reader::new(&header_buf))?;
    let mut payload = vec![0u8; header.payload_length as usize];
    if !payload.is_empty() {
        reader.read_exact(&mut payload).await?;
    }
    Ok(Packet::decode(header.command, &payload)?)
}

/// Handles one decoded packet. Returns `Ok(false)` to ask the run loop to
/// stop (protocol violation / handshake abort), `Ok(true)` to continue.
async fn handle(device: &Device, packet: Packet) -> Result<bool, WireError> {
    match packet {
        Packet::HandShake(_hs) => {
            // Protocol-range negotiation happens once before the loop
            // starts (see `handshake::negotiate`); a HandShake arriving
            // mid-stream is a protocol violation.
            if log::log_enabled!(log::Level::Warn) {
                log::warn!("unexpected HandShake after connection is established");
            }
            Ok(false)
        }
        Packet::ReportProtocol(_) | Packet::ReportSizes(_) | Packet::SyncParam(_) => {
            // Update peer-reported values and drive a hard-state transition.
            // The concrete field plumbing into DeviceState is handled by
            // the caller's higher-level announce handler; here we simply
            // acknowledge receipt since this crate has no block-layer size
            // state of its own to update.
            Ok(true)
        }
        Packet::ReportState(rs) => {
            let current = device.state.read();
            let proposed = DeviceState {
                peer_role: rs.role,
                conn: current.conn,
                ..current
            };
            let _ = device.state.propose(proposed, ChgStateFlags::HARD);
            Ok(true)
        }
        Packet::Data(data) => {
            let two_primaries = device.config.two_primaries;
            let len = data.bytes.len() as u32;
            if two_primaries && !device.tl.req_have_write(data.sector, len) {
                device
                    .meta_channel
                    .send_packet(
                        &Packet::DiscardNote(DiscardNote {
                            sector: data.sector,
                            block_id: data.block_id,
                        }),
                        &device.tl,
                        &device.state,
                        &device.cancel,
                    )
                    .await?;
                return Ok(true);
            }
            device.tl.note_ee(data.sector, len);
            {
                let mut lists = device.ee_lists.lock().unwrap();
                lists.active.push(Ee::new(data.block_id, data.sector, len, data.seq_num));
            }

            let mut reserved = device
                .ee_pool
                .acquire(&device.cancel, Vec::new)
                .await
                .map_err(|_| WireError::Closed)?;
            reserved.clear();
            reserved.extend_from_slice(&data.bytes);

            let write_result = device.write_local(data.sector, len, &data.bytes).await;
            device.tl.forget_ee(data.sector, len);
            drop(reserved);

            let ack = match write_result {
                Ok(()) => {
                    {
                        let mut lists = device.ee_lists.lock().unwrap();
                        lists.move_to_done(data.block_id);
                    }
                    device.recv_set_size.fetch_add(1, Ordering::AcqRel);
                    match device.config.wire_protocol {
                        WireProtocol::A => None,
                        WireProtocol::B => Some(Packet::RecvAck(BlockAck {
                            sector: data.sector,
                            block_id: data.block_id,
                            seq_num: data.seq_num,
                        })),
                        WireProtocol::C => Some(Packet::WriteAck(BlockAck {
                            sector: data.sector,
                            block_id: data.block_id,
                            seq_num: data.seq_num,
                        })),
                    }
                }
                Err(e) => {
                    if log::log_enabled!(log::Level::Warn) {
                        log::warn!("local write of a peer-originated EE failed at sector {}: {e}", data.sector);
                    }
                    let mut lists = device.ee_lists.lock().unwrap();
                    if let Some(idx) = lists.active.iter().position(|ee| ee.block_id == data.block_id) {
                        let mut ee = lists.active.remove(idx);
                        ee.status.insert(EeStatus::DISCARDED);
                        lists.net.push(ee);
                    }
                    match device.config.wire_protocol {
                        WireProtocol::A => None,
                        WireProtocol::B | WireProtocol::C => Some(Packet::NegAck(BlockAck {
                            sector: data.sector,
                            block_id: data.block_id,
                            seq_num: data.seq_num,
                        })),
                    }
                }
            };

            if let Some(ack) = ack {
                device
                    .meta_channel
                    .send_packet(&ack, &device.tl, &device.state, &device.cancel)
                    .await?;
            }
            Ok(true)
        }
        Packet::Barrier(barrier) => {
            let set_size = device.recv_set_size.swap(0, Ordering::AcqRel);
            let ack = Packet::BarrierAck(BarrierAck {
                epoch: barrier.epoch,
                set_size,
            });
            device
                .meta_channel
                .send_packet(&ack, &device.tl, &device.state, &device.cancel)
                .await?;
            Ok(true)
        }
        Packet::ReportGenCnt(report) => {
            let mut previous = device.peer_gencounts.lock().unwrap();
            if let Some(prev) = *previous {
                if !report.counts.dominates(&prev) && log::log_enabled!(log::Level::Warn) {
                    log::warn!("peer generation counters regressed for device {}", device.minor);
                }
            }
            *previous = Some(report.counts);
            Ok(true)
        }
        Packet::DataReply(data) | Packet::RsDataReply(data) => {
            if let Err(e) = device.write_local(data.sector, data.bytes.len() as u32, &data.bytes).await {
                if log::log_enabled!(log::Level::Warn) {
                    log::warn!("resync write failed at sector {}: {e}", data.sector);
                }
            }
            Ok(true)
        }
        Packet::ReportBitMap(chunk) => {
            device.bitmap.write(chunk.offset_words, &chunk.words);
            Ok(true)
        }
        Packet::Ping => Ok(true),
        _ => {
            if log::log_enabled!(log::Level::Warn) {
                log::warn!("receiver got an unexpected command on the data channel");
            }
            Ok(false)
        }
    }
}

pub async fn run(device: Arc<Device>, cancel: CancellationToken) {
    if log::log_enabled!(log::Level::Info) {
        log::info!("receiver task started for device {}", device.minor);
    }
    let mut reader = match device.data_reader.lock().unwrap().take() {
        Some(r) => r,
        None => return,
    };
    loop {
        let packet = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = read_one(&mut reader) => result,
        };
        match packet {
            Ok(packet) => match handle(&device, packet).await {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => {
                    if log::log_enabled!(log::Level::Warn) {
                        log::warn!("receiver protocol error: {e}");
                    }
                    break;
                }
            },
            Err(e) => {
                if log::log_enabled!(log::Level::Warn) {
                    log::warn!("receiver read error: {e}");
                }
                break;
            }
        }
    }
    // Connection lost or protocol violation: transition state and drain
    // the TL (§4.5, §7 TransportLost/ProtocolViolation recovery).
    let current = device.state.read();
    device.state.force(DeviceState {
        conn: Conn::BrokenPipe,
        peer_role: Role::Unknown,
        ..current
    });
    device.drain_transfer_log_on_connection_loss();
    if log::log_enabled!(log::Level::Info) {
        log::info!("receiver task stopped for device {}", device.minor);
    }
}
