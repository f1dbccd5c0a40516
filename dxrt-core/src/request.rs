//! In-flight request/response data model — §3, and the IPC message taxonomy
//! used to carry them — §6.

use crate::bound::BoundClass;

/// A memory region reference used in both requests and responses:
/// `{base, offset, size}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemRegion {
    pub base: u64,
    pub offset: u64,
    pub size: u64,
}

/// A single inference submission. Identity is `(proc_id, req_id)`.
#[derive(Debug, Clone)]
pub struct Request {
    pub req_id: i32,
    pub proc_id: i32,
    pub task_id: i32,
    pub bound: BoundClass,
    pub input: MemRegion,
    pub output: MemRegion,
    pub cmd_offset: u64,
    pub weight_offset: u64,
    pub dma_ch: Option<u32>,
    pub priority: u8,
    pub bandwidth_hint: u32,
}

/// Emitted by a reader thread on completion.
#[derive(Debug, Clone, Copy)]
pub struct Response {
    pub req_id: i32,
    pub proc_id: i32,
    pub inf_time: u32,
    pub status: i32,
    pub dma_ch: u32,
    pub argmax: Option<i32>,
    pub ppu_filter_count: Option<u32>,
}

impl Response {
    pub fn is_fault(&self) -> bool {
        self.status != 0
    }
}

/// `REQUEST_CODE` values carried on the wire. Only values in `0..=10_000`
/// are meaningful; anything above that sanity range is dropped by the IPC
/// server before it ever reaches a handler (§4.F).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i32)]
pub enum RequestCode {
    GetMemory = 1,
    GetMemoryForModel = 2,
    FreeMemory = 3,
    DeviceInit = 4,
    DeviceDeinit = 5,
    TaskInit = 6,
    TaskDeinit = 7,
    RequestScheduleInference = 8,
    DeallocateTaskMemory = 9,
    ProcessDeinit = 10,
    ViewFreeMemory = 11,
    ViewUsedMemory = 12,
    ViewAvailableDevice = 13,
    GetUsage = 14,
    DeviceReset = 15,
    InferenceCompleted = 16,
    Close = 17,
    /// Reserved for server-initiated error broadcasts; never sent by a
    /// client as a request code.
    ErrorReport = 18,
    /// Per-channel completion delivery, e.g. `DoScheduledInferenceCh0`.
    DoScheduledInference = 19,
    InvalidRequestCode = -1,
}

impl RequestCode {
    /// Values above this are dropped outright rather than answered with
    /// `InvalidRequestCode` — §4.F.
    pub const SANITY_MAX: i32 = 10_000;

    pub fn from_raw(code: i32) -> Option<Self> {
        use RequestCode::*;
        Some(match code {
            1 => GetMemory,
            2 => GetMemoryForModel,
            3 => FreeMemory,
            4 => DeviceInit,
            5 => DeviceDeinit,
            6 => TaskInit,
            7 => TaskDeinit,
            8 => RequestScheduleInference,
            9 => DeallocateTaskMemory,
            10 => ProcessDeinit,
            11 => ViewFreeMemory,
            12 => ViewUsedMemory,
            13 => ViewAvailableDevice,
            14 => GetUsage,
            15 => DeviceReset,
            16 => InferenceCompleted,
            17 => Close,
            _ => return None,
        })
    }
}

/// Fixed-layout client request record, `IPCClientMessage` in the design.
/// Encoded/decoded with explicit little-endian byte order so the layout
/// byte-matches the unchanged kernel driver contract (see `ipc::protocol`).
#[derive(Debug, Clone)]
pub struct IpcClientMessage {
    pub code: i32,
    pub msg_type: i64,
    pub pid: i32,
    pub device_id: u32,
    pub task_id: i32,
    pub data: u64,
    pub model_memory_size: u64,
    pub request: Option<Request>,
}

/// Fixed-layout server reply record, `IPCServerMessage` in the design.
#[derive(Debug, Clone, Copy)]
pub struct IpcServerMessage {
    pub code: i32,
    pub msg_type: i64,
    pub device_id: i32,
    pub data: i64,
    pub result: i32,
    pub response: Option<Response>,
}

impl IpcServerMessage {
    pub fn ok(msg_type: i64, code: RequestCode, data: i64) -> Self {
        Self {
            code: code as i32,
            msg_type,
            device_id: -1,
            data,
            result: 0,
            response: None,
        }
    }

    pub fn error(msg_type: i64, device_id: i32, result: i32) -> Self {
        Self {
            code: RequestCode::InvalidRequestCode as i32,
            msg_type,
            device_id,
            data: 0,
            result,
            response: None,
        }
    }
}
