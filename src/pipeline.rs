//! Request Pipeline (§4.8): local write submission on the primary side.

use bytes::Bytes;

use crate::config::WireProtocol;
use crate::device::Device;
use crate::error::{PipelineError, WireError};
use crate::tl::{Request, RequestId, RequestStatus};
use crate::wire::packet::{DataBlock, Packet};

/// Submits one local write. Implements §4.8 steps 1–7; step 1 (masking
/// cancellation signals) is the cancellation token not being polled again
/// until `send_packet` internally awaits — see `channel::Channel`.
pub async fn submit_write(device: &Device, id: RequestId, sector: u64, bytes: Bytes) -> Result<(), PipelineError> {
    let current = device.state.read();
    if current.conn < crate::state::Conn::Connected {
        return Err(PipelineError::NotConnected);
    }

    // Step 4: two-primaries conflict check before the request enters the TL.
    if device.config.two_primaries && !device.tl.ee_have_write(sector, bytes.len() as u32) {
        return Err(PipelineError::WriteConflict);
    }

    // Bounds the number of concurrently in-flight submissions to the pool's
    // reserve, blocking rather than failing under exhaustion; acquisition
    // races against `cancel` (§5 Resource policy).
    let mut reserved = device
        .request_pool
        .acquire(&device.cancel, Vec::new)
        .await
        .map_err(|_| PipelineError::NotConnected)?;
    reserved.clear();
    reserved.extend_from_slice(&bytes);

    device.write_local(sector, bytes.len() as u32, &bytes).await?;

    let epoch = crate::tl::EpochId(0); // overwritten by tl_add to the current newest epoch
    let request = Request::new(id, sector, bytes.len() as u32, epoch);
    let handle = device.tl.tl_add(request);

    // Step 5: assign seq_num, build the Data packet, send it.
    let seq_num = device.next_seq();
    handle.lock().unwrap().seq = Some(seq_num);
    let packet = Packet::Data(DataBlock {
        sector,
        block_id: id,
        seq_num,
        bytes,
    });

    device.pending.inc_ap_pending();
    let send_result = device
        .data_channel
        .send_packet(&packet, &device.tl, &device.state, &device.cancel)
        .await;
    drop(reserved);

    if let Err(e) = send_result {
        // Step 6: on send failure, cancel from the TL, mark out-of-sync,
        // complete locally with a synthetic "sent" status.
        handle_send_failure(device, &handle, sector, bytes_len(&packet), e);
        return Ok(());
    }

    handle.lock().unwrap().status.insert(RequestStatus::SENT);

    // Protocol C waits for WriteAck, B waits for RecvAck, A completes
    // immediately after local disk completion (§4.8) — which for this
    // crate's submission path is "as soon as the send succeeded", since
    // local disk I/O itself is the `BlockDevice` collaborator's concern.
    if device.config.wire_protocol != WireProtocol::A {
        let completion = handle.lock().unwrap().completion.clone();
        loop {
            if handle.lock().unwrap().status.contains(RequestStatus::ACKED) {
                break;
            }
            completion.notified().await;
        }
    }
    Ok(())
}

fn bytes_len(packet: &Packet) -> u32 {
    match packet {
        Packet::Data(d) => d.bytes.len() as u32,
        _ => 0,
    }
}

fn handle_send_failure(device: &Device, handle: &crate::tl::RequestHandle, sector: u64, len: u32, err: WireError) {
    if log::log_enabled!(log::Level::Warn) {
        log::warn!("write submission failed for sector {sector}: {err}");
    }
    device.tl.tl_cancel(handle);
    device.bitmap.set_out_of_sync(sector, len);
    handle
        .lock()
        .unwrap()
        .status
        .insert(crate::tl::RequestStatus::SENT | crate::tl::RequestStatus::ACKED);
    device.pending.dec_ap_pending();
}
