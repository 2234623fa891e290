//! Asender Task (§4.6): single-threaded loop reading the meta channel,
//! updating the TL, pending counters, and triggering barrier release.

use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio_util::sync::CancellationToken;

use crate::device::Device;
use crate::error::WireError;
use crate::wire::packet::Packet;
use crate::wire::{Header, Reader, Serializer, HEADER_SIZE};

async fn read_one(reader: &mut OwnedReadHalf) -> Result<Packet, WireError> {
    let mut header_buf = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header_buf).await?;
    let header = Header::read(&mut Reader::new(&header_buf))?;
    let mut payload = vec![0u8; header.payload_length as usize];
    if !payload.is_empty() {
        reader.read_exact(&mut payload).await?;
    }
    Ok(Packet::decode(header.command, &payload)?)
}

async fn handle(device: &Device, packet: Packet) {
    match packet {
        Packet::Ping => {
            device.refresh_peer_liveness();
            if let Err(e) = device
                .meta_channel
                .send_packet(&Packet::PingAck, &device.tl, &device.state, &device.cancel)
                .await
            {
                if log::log_enabled!(log::Level::Warn) {
                    log::warn!("failed to reply with PingAck: {e}");
                }
            }
        }
        Packet::PingAck => {
            device.refresh_peer_liveness();
        }
        Packet::WriteAck(ack) | Packet::RecvAck(ack) => {
            complete_request(device, ack.block_id, ack.sector);
        }
        Packet::NegAck(ack) => {
            device.bitmap.set_out_of_sync(ack.sector, 0);
            complete_request(device, ack.block_id, ack.sector);
        }
        Packet::BarrierAck(ba) => {
            let _ = device.tl.tl_release(ba.epoch, ba.set_size);
            device.pending.dec_ap_pending();
            crate::metrics::record_barrier_closed(ba.epoch, ba.set_size);
        }
        Packet::DiscardNote(note) => {
            device.bitmap.set_out_of_sync(note.sector, 0);
            complete_request(device, note.block_id, note.sector);
        }
        _ => {
            if log::log_enabled!(log::Level::Warn) {
                log::warn!("asender got an unexpected command on the meta channel");
            }
        }
    }
}

/// Looks up the Request by `block_id`, validates its sector via
/// `tl_verify`, marks it acked, removes it from the TL's indexes, and
/// decrements `ap_pending` (§4.6).
fn complete_request(device: &Device, block_id: u64, sector: u64) {
    use crate::tl::RequestStatus;

    let Some(request) = device.tl.find_by_id(block_id) else {
        if log::log_enabled!(log::Level::Warn) {
            log::warn!("ack for unknown block_id {block_id}");
        }
        return;
    };
    if !device.tl.tl_verify(&request, sector) {
        if log::log_enabled!(log::Level::Warn) {
            log::warn!("ack sector mismatch for block_id {block_id}");
        }
        return;
    }
    let completion = {
        let mut r = request.lock().unwrap();
        r.status.insert(RequestStatus::ACKED);
        r.completion.clone()
    };
    device.tl.tl_finalize(block_id);
    device.pending.dec_ap_pending();
    completion.notify_waiters();
}

pub async fn run(device: Arc<Device>, cancel: CancellationToken) {
    if log::log_enabled!(log::Level::Info) {
        log::info!("asender task started for device {}", device.minor);
    }
    let mut reader = match device.meta_reader.lock().unwrap().take() {
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
            Ok(packet) => handle(&device, packet).await,
            Err(e) => {
                if log::log_enabled!(log::Level::Warn) {
                    log::warn!("asender read error: {e}, dropping meta channel per ko_count policy");
                }
                break;
            }
        }
    }
    if log::log_enabled!(log::Level::Info) {
        log::info!("asender task stopped for device {}", device.minor);
    }
}

/// Periodic keepalive (§4.4/§4.6): sends `Ping` on the meta channel every
/// `Config::ping_interval()` while connected, so a silent peer is detected
/// via the ko_count/timeout policy rather than an idle connection looking
/// indistinguishable from a dead one.
pub async fn run_keepalive(device: Arc<Device>, cancel: CancellationToken) {
    let interval = device.config.ping_interval();
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        if device.state.read().conn < crate::state::Conn::Connected {
            continue;
        }
        if let Err(e) = device
            .meta_channel
            .send_packet(&Packet::Ping, &device.tl, &device.state, &device.cancel)
            .await
        {
            if log::log_enabled!(log::Level::Warn) {
                log::warn!("keepalive ping send failed: {e}");
            }
        }
    }
}
