//! Fixed-layout wire encoding for `IPCClientMessage`/`IPCServerMessage` —
//! §6. Byte-exact little-endian layout; no serde derive, matching the
//! design's note that these structs must match the kernel driver's
//! existing contract rather than grow a human-readable envelope.

use crate::bound::BoundClass;
use crate::request::{
    IpcClientMessage, IpcServerMessage, MemRegion, Request, RequestCode, Response,
};

/// Client→server payload size (excluding the `msg_type` header the
/// transport strips before handing bytes to this module).
pub const CLIENT_MSG_SIZE: usize = 88;
/// Server→client payload size.
pub const SERVER_MSG_SIZE: usize = 48;

fn bound_from_u8(b: u8) -> BoundClass {
    use BoundClass::*;
    match b {
        1 => Only0,
        2 => Only1,
        3 => Only2,
        4 => Pair01,
        5 => Pair12,
        6 => Pair02,
        _ => Normal,
    }
}

/// Decode a client request record. Returns `None` if the buffer is too
/// short to contain a full record — the caller treats that as a dropped
/// message rather than a protocol error (§4.F: out-of-range codes are
/// dropped outright).
pub fn decode_client_message(buf: &[u8]) -> Option<IpcClientMessage> {
    if buf.len() < CLIENT_MSG_SIZE {
        return None;
    }
    let code = i32::from_le_bytes(buf[0..4].try_into().ok()?);
    let msg_type = i64::from_le_bytes(buf[4..12].try_into().ok()?);
    let pid = i32::from_le_bytes(buf[12..16].try_into().ok()?);
    let device_id = u32::from_le_bytes(buf[16..20].try_into().ok()?);
    let task_id = i32::from_le_bytes(buf[20..24].try_into().ok()?);
    let data = u64::from_le_bytes(buf[24..32].try_into().ok()?);
    let model_memory_size = u64::from_le_bytes(buf[32..40].try_into().ok()?);

    let req_id = i32::from_le_bytes(buf[40..44].try_into().ok()?);
    let bound = bound_from_u8(buf[44]);
    let input = MemRegion {
        base: u64::from_le_bytes(buf[45..53].try_into().ok()?),
        offset: u64::from_le_bytes(buf[53..61].try_into().ok()?),
        size: u64::from_le_bytes(buf[61..69].try_into().ok()?),
    };
    let output = MemRegion {
        base: u64::from_le_bytes(buf[69..77].try_into().ok()?),
        offset: 0,
        size: u64::from_le_bytes(buf[77..85].try_into().ok()?),
    };
    let dma_ch = buf[85];
    let priority = buf[86];

    let request = Some(Request {
        req_id,
        proc_id: pid,
        task_id,
        bound,
        input,
        output,
        cmd_offset: 0,
        weight_offset: 0,
        dma_ch: if dma_ch == 0xff { None } else { Some(dma_ch as u32) },
        priority,
        bandwidth_hint: 0,
    });

    Some(IpcClientMessage {
        code,
        msg_type,
        pid,
        device_id,
        task_id,
        data,
        model_memory_size,
        request,
    })
}

/// Encode a server reply record.
pub fn encode_server_message(msg: &IpcServerMessage) -> [u8; SERVER_MSG_SIZE] {
    let mut buf = [0u8; SERVER_MSG_SIZE];
    buf[0..4].copy_from_slice(&msg.code.to_le_bytes());
    buf[4..12].copy_from_slice(&msg.msg_type.to_le_bytes());
    buf[12..16].copy_from_slice(&msg.device_id.to_le_bytes());
    buf[16..24].copy_from_slice(&msg.data.to_le_bytes());
    buf[24..28].copy_from_slice(&msg.result.to_le_bytes());
    if let Some(resp) = &msg.response {
        buf[28..32].copy_from_slice(&resp.req_id.to_le_bytes());
        buf[32..36].copy_from_slice(&resp.proc_id.to_le_bytes());
        buf[36..40].copy_from_slice(&resp.inf_time.to_le_bytes());
        buf[40..44].copy_from_slice(&resp.status.to_le_bytes());
        buf[44..48].copy_from_slice(&resp.dma_ch.to_le_bytes());
    }
    buf
}

/// Decode a server reply record — used by the integration tests' in-process
/// client stand-in, and symmetric with `encode_server_message`.
pub fn decode_server_message(buf: &[u8]) -> Option<IpcServerMessage> {
    if buf.len() < SERVER_MSG_SIZE {
        return None;
    }
    let code = i32::from_le_bytes(buf[0..4].try_into().ok()?);
    let msg_type = i64::from_le_bytes(buf[4..12].try_into().ok()?);
    let device_id = i32::from_le_bytes(buf[12..16].try_into().ok()?);
    let data = i64::from_le_bytes(buf[16..24].try_into().ok()?);
    let result = i32::from_le_bytes(buf[24..28].try_into().ok()?);
    let response = if buf[28..48] != [0u8; 20] {
        Some(Response {
            req_id: i32::from_le_bytes(buf[28..32].try_into().ok()?),
            proc_id: i32::from_le_bytes(buf[32..36].try_into().ok()?),
            inf_time: u32::from_le_bytes(buf[36..40].try_into().ok()?),
            status: i32::from_le_bytes(buf[40..44].try_into().ok()?),
            dma_ch: u32::from_le_bytes(buf[44..48].try_into().ok()?),
            argmax: None,
            ppu_filter_count: None,
        })
    } else {
        None
    };
    Some(IpcServerMessage {
        code,
        msg_type,
        device_id,
        data,
        result,
        response,
    })
}

/// `RequestCode::DoScheduledInference` is delivered per-channel in the
/// original protocol (`DO_SCHEDULED_INFERENCE_CH0`..`CH2`); fold the
/// channel into the wire code the way the original's enum does.
pub fn scheduled_inference_code(channel: u32) -> i32 {
    RequestCode::DoScheduledInference as i32 + channel as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_message_round_trips() {
        let msg = IpcServerMessage {
            code: scheduled_inference_code(0),
            msg_type: 4242,
            device_id: 0,
            data: 7,
            result: 0,
            response: Some(Response {
                req_id: 1,
                proc_id: 100,
                inf_time: 5000,
                status: 0,
                dma_ch: 0,
                argmax: None,
                ppu_filter_count: None,
            }),
        };
        let bytes = encode_server_message(&msg);
        let decoded = decode_server_message(&bytes).unwrap();
        assert_eq!(decoded.msg_type, 4242);
        assert_eq!(decoded.response.unwrap().inf_time, 5000);
    }

    #[test]
    fn short_buffer_is_rejected() {
        assert!(decode_client_message(&[0u8; 4]).is_none());
    }
}
