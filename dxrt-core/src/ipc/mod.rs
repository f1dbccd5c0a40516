//! IPC server — §4.F.
//!
//! Single receive loop over a message queue (or named pipe on Windows);
//! the receive and reply queues are the same object. Per-client routing
//! uses `msgType = client_pid` for asynchronous replies (e.g. scheduled
//! inference completions) and `pid + SYNC_REPLY_OFFSET` for synchronous
//! call/response pairs, grounded on `IPCServerWrapper` / `ipc_message.h`.

pub mod protocol;
pub mod transport;

use crate::error::Result;
use crate::request::{IpcClientMessage, IpcServerMessage, RequestCode};

pub use transport::{IpcTransport, NamedPipeTransport, PosixMqTransport, RawMessage};

/// Added to a client pid to build the `msgType` used for a synchronous
/// reply, keeping it distinct from the async per-client reply channel.
pub const SYNC_REPLY_OFFSET: i64 = 10_000_000;

/// Sanity ceiling on `REQUEST_CODE`: values above this are dropped outright
/// rather than answered with `INVALID_REQUEST_CODE` (§4.F).
pub const REQUEST_CODE_SANITY_MAX: i32 = RequestCode::SANITY_MAX;

/// A handler turns one decoded client message into the reply to send back.
/// Implemented by the service facade in production and by a closure in
/// tests.
pub trait MessageHandler: Send {
    fn handle(&mut self, msg: IpcClientMessage) -> IpcServerMessage;
}

impl<F: FnMut(IpcClientMessage) -> IpcServerMessage + Send> MessageHandler for F {
    fn handle(&mut self, msg: IpcClientMessage) -> IpcServerMessage {
        self(msg)
    }
}

/// Owns the transport and runs the blocking receive loop on the calling
/// thread (there is exactly one IPC thread in this design, §5).
pub struct IpcServer<T: IpcTransport> {
    transport: T,
}

impl<T: IpcTransport> IpcServer<T> {
    /// Construct the server and drain any residual messages left over from
    /// a previous run before accepting clients (§4.F).
    pub fn start(mut transport: T) -> Result<Self> {
        transport.drain()?;
        Ok(Self { transport })
    }

    /// Receive, decode, dispatch, and reply exactly once. Returns `Ok(false)`
    /// on a clean shutdown signal from the transport (`recv` returning
    /// `None`), `Ok(true)` if a message was processed.
    pub fn tick(&mut self, handler: &mut dyn MessageHandler) -> Result<bool> {
        let Some(raw) = self.transport.recv()? else {
            return Ok(false);
        };

        let Some(client_msg) = protocol::decode_client_message(&raw.bytes) else {
            log::warn!("dxrt-core: dropped malformed IPC message (msg_type={})", raw.msg_type);
            return Ok(true);
        };

        if client_msg.code > REQUEST_CODE_SANITY_MAX || client_msg.code < -1 {
            log::warn!("dxrt-core: dropped out-of-range request code {}", client_msg.code);
            return Ok(true);
        }

        let reply_msg_type = client_msg.msg_type;
        let reply = if RequestCode::from_raw(client_msg.code).is_none() {
            IpcServerMessage::error(reply_msg_type, -1, 0)
        } else {
            handler.handle(client_msg)
        };

        let bytes = protocol::encode_server_message(&reply).to_vec();
        self.transport.send(RawMessage {
            msg_type: reply.msg_type,
            bytes,
        })
    }

    /// Run the receive loop until the transport signals shutdown.
    pub fn run(&mut self, mut handler: impl MessageHandler) -> Result<()> {
        while self.tick(&mut handler)? {}
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// In-memory transport standing in for a real client process, used to
    /// unit-test the receive/dispatch/reply loop without a real mqueue.
    struct InMemoryTransport {
        inbox: VecDeque<RawMessage>,
        outbox: Vec<RawMessage>,
    }

    impl IpcTransport for InMemoryTransport {
        fn recv(&mut self) -> Result<Option<RawMessage>> {
            Ok(self.inbox.pop_front())
        }
        fn send(&mut self, msg: RawMessage) -> Result<()> {
            self.outbox.push(msg);
            Ok(())
        }
        fn drain(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn encode_client(code: i32, msg_type: i64, pid: i32) -> Vec<u8> {
        let mut buf = vec![0u8; protocol::CLIENT_MSG_SIZE];
        buf[0..4].copy_from_slice(&code.to_le_bytes());
        buf[4..12].copy_from_slice(&msg_type.to_le_bytes());
        buf[12..16].copy_from_slice(&pid.to_le_bytes());
        buf[85] = 0xff;
        buf
    }

    #[test]
    fn unknown_code_within_sanity_range_gets_invalid_request_reply() {
        let transport = InMemoryTransport {
            inbox: VecDeque::from([RawMessage {
                msg_type: 100,
                bytes: encode_client(9999, 100, 100),
            }]),
            outbox: Vec::new(),
        };
        let mut server = IpcServer::start(transport).unwrap();
        let mut handler = |_msg: IpcClientMessage| -> IpcServerMessage {
            panic!("handler must not run for an unknown code")
        };
        assert!(server.tick(&mut handler).unwrap());
        assert_eq!(server.transport.outbox.len(), 1);
        assert_eq!(
            server.transport.outbox[0].bytes[0..4],
            (RequestCode::InvalidRequestCode as i32).to_le_bytes()
        );
    }

    #[test]
    fn out_of_sanity_range_code_is_dropped_without_reply() {
        let transport = InMemoryTransport {
            inbox: VecDeque::from([RawMessage {
                msg_type: 100,
                bytes: encode_client(50_000, 100, 100),
            }]),
            outbox: Vec::new(),
        };
        let mut server = IpcServer::start(transport).unwrap();
        let mut handler = |_msg: IpcClientMessage| -> IpcServerMessage {
            panic!("handler must not run for an out-of-range code")
        };
        assert!(server.tick(&mut handler).unwrap());
        assert!(server.transport.outbox.is_empty());
    }

    #[test]
    fn known_code_is_dispatched_to_handler() {
        let transport = InMemoryTransport {
            inbox: VecDeque::from([RawMessage {
                msg_type: 100,
                bytes: encode_client(RequestCode::GetMemory as i32, 100, 100),
            }]),
            outbox: Vec::new(),
        };
        let mut server = IpcServer::start(transport).unwrap();
        let mut handler = |msg: IpcClientMessage| -> IpcServerMessage {
            assert_eq!(msg.pid, 100);
            IpcServerMessage::ok(msg.msg_type, RequestCode::GetMemory, 0x1000)
        };
        assert!(server.tick(&mut handler).unwrap());
        assert_eq!(server.transport.outbox.len(), 1);
    }

    #[test]
    fn recv_none_stops_the_loop() {
        let transport = InMemoryTransport {
            inbox: VecDeque::new(),
            outbox: Vec::new(),
        };
        let mut server = IpcServer::start(transport).unwrap();
        let mut handler = |_msg: IpcClientMessage| -> IpcServerMessage {
            panic!("no messages queued")
        };
        assert!(!server.tick(&mut handler).unwrap());
    }
}
