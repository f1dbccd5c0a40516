//! Response reader threads — §4.D.
//!
//! One thread per DMA channel per device, blocking on the adapter's poll
//! until a completion arrives or the thread is asked to stop.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::request::Response;

use super::adapter::PollOutcome;
use super::core::DeviceCore;
use super::DeviceCmd;

/// Callback invoked on a successful completion (`status == 0`).
pub type CompletionCallback = Arc<dyn Fn(u32, Response) + Send + Sync>;

/// Callback invoked on a device-side fault (`S_ERR_DEVICE_RESPONSE_FAULT`).
/// Arguments: device id, response status, response.
pub type FaultCallback = Arc<dyn Fn(u32, i32, Response) + Send + Sync>;

/// Handles for the reader threads of one device, plus the shared stop flag
/// used to unblock them for shutdown.
pub struct ReaderThreads {
    stop: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl ReaderThreads {
    /// Spawn `num_dma_ch` reader threads for `core`.
    pub fn spawn(
        core: Arc<DeviceCore>,
        dump_dir: PathBuf,
        on_complete: CompletionCallback,
        on_fault: FaultCallback,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let num_ch = core.device.num_dma_ch.max(1);
        let mut handles = Vec::with_capacity(num_ch as usize);

        for ch in 0..num_ch {
            let core = Arc::clone(&core);
            let stop = Arc::clone(&stop);
            let dump_dir = dump_dir.clone();
            let on_complete = Arc::clone(&on_complete);
            let on_fault = Arc::clone(&on_fault);
            handles.push(std::thread::spawn(move || {
                reader_loop(core, ch as u32, stop, dump_dir, on_complete, on_fault);
            }));
        }

        Self { stop, handles }
    }

    /// Unblock every reader thread (one synthetic `TERMINATE` per channel)
    /// and join them.
    pub fn shutdown(self, core: &DeviceCore) {
        self.stop.store(true, Ordering::SeqCst);
        for _ in 0..self.handles.len() {
            let mut buf = [0u8; 1];
            let _ = core.execute(DeviceCmd::Terminate, 0, &mut buf);
        }
        for h in self.handles {
            let _ = h.join();
        }
    }
}

fn reader_loop(
    core: Arc<DeviceCore>,
    channel: u32,
    stop: Arc<AtomicBool>,
    dump_dir: PathBuf,
    on_complete: CompletionCallback,
    on_fault: FaultCallback,
) {
    let device_id = core.id();
    loop {
        if stop.load(Ordering::SeqCst) {
            return;
        }

        let poll_result = poll_once(&core);
        if stop.load(Ordering::SeqCst) {
            return;
        }

        let response = match poll_result {
            Ok(Some(r)) => r,
            Ok(None) => continue, // timeout, loop and re-check stop flag
            Err(_) => continue,
        };

        if response.status == 0 {
            on_complete(device_id, response);
        } else {
            crate::stats::GLOBAL_STATS.record_fault();
            dump_device_diagnostics(&dump_dir, device_id, &response);
            core.device.block();
            on_fault(device_id, response.status, response);
            log::error!(
                "dxrt-core: device {device_id} channel {channel} reported fault status={}",
                response.status
            );
        }
    }
}

/// Blocking poll for the next `NPU_RUN_RESP` completion on this device.
/// Returns `Ok(None)` on a plain poll timeout (caller loops to recheck the
/// stop flag, since `poll` has a long but finite timeout).
fn poll_once(core: &DeviceCore) -> crate::error::Result<Option<Response>> {
    match core.poll()? {
        PollOutcome::Timeout => Ok(None),
        PollOutcome::Ready => {
            let mut buf = [0u8; 32];
            core.execute(DeviceCmd::NpuRunResp, 0, &mut buf)?;
            Ok(Some(decode_response(&buf)))
        }
    }
}

fn dump_device_diagnostics(dump_dir: &PathBuf, device_id: u32, response: &Response) {
    let bin_path = dump_dir.join(format!("dxrt.dump.bin.{device_id}"));
    let txt_path = dump_dir.join(format!("dxrt.dump.{device_id}.txt"));
    if let Err(e) = std::fs::write(&bin_path, response_as_bytes(response)) {
        log::warn!("dxrt-core: failed to write {}: {e}", bin_path.display());
    }
    let text = format!(
        "device {device_id} fault\nreq_id={}\nproc_id={}\nstatus={}\ndma_ch={}\n",
        response.req_id, response.proc_id, response.status, response.dma_ch
    );
    if let Err(e) = std::fs::write(&txt_path, text) {
        log::warn!("dxrt-core: failed to write {}: {e}", txt_path.display());
    }
}

fn response_as_bytes(response: &Response) -> Vec<u8> {
    let mut out = Vec::with_capacity(24);
    out.extend_from_slice(&response.req_id.to_le_bytes());
    out.extend_from_slice(&response.proc_id.to_le_bytes());
    out.extend_from_slice(&response.inf_time.to_le_bytes());
    out.extend_from_slice(&response.status.to_le_bytes());
    out.extend_from_slice(&response.dma_ch.to_le_bytes());
    out
}

fn decode_response(buf: &[u8; 32]) -> Response {
    Response {
        req_id: i32::from_le_bytes(buf[0..4].try_into().unwrap()),
        proc_id: i32::from_le_bytes(buf[4..8].try_into().unwrap()),
        inf_time: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
        status: i32::from_le_bytes(buf[12..16].try_into().unwrap()),
        dma_ch: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
        argmax: None,
        ppu_filter_count: None,
    }
}
