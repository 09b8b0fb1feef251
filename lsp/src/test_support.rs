//! In-memory language server peer for connection and client tests.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

use crate::codec::{self, FrameDecoder};

const PIPE_CAPACITY: usize = 64 * 1024;

/// The server end of an in-memory pipe. Speaks framed JSON like a real
/// analyzer would.
pub(crate) struct FakePeer {
    reader: ReadHalf<DuplexStream>,
    writer: WriteHalf<DuplexStream>,
    decoder: FrameDecoder,
    queued: VecDeque<serde_json::Value>,
}

impl FakePeer {
    /// Returns the client end of the pipe and the peer holding the other end.
    pub fn pair() -> (DuplexStream, Self) {
        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        let (reader, writer) = tokio::io::split(server);
        (
            client,
            Self {
                reader,
                writer,
                decoder: FrameDecoder::new(),
                queued: VecDeque::new(),
            },
        )
    }

    /// Next message the client sent, or `None` once the client hung up.
    pub async fn next_message(&mut self) -> Option<serde_json::Value> {
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(msg) = self.queued.pop_front() {
                return Some(msg);
            }
            let n = self.reader.read(&mut chunk).await.ok()?;
            if n == 0 {
                return None;
            }
            self.queued.extend(self.decoder.append(&chunk[..n]));
        }
    }

    /// Next message with the given method, skipping everything else.
    pub async fn next_with_method(&mut self, method: &str) -> Option<serde_json::Value> {
        loop {
            let msg = self.next_message().await?;
            if msg["method"] == method {
                return Some(msg);
            }
        }
    }

    pub async fn send(&mut self, msg: serde_json::Value) {
        let frame = codec::encode_frame(&msg).unwrap();
        self.send_raw(&frame).await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
        self.writer.flush().await.unwrap();
    }

    /// Reply to `request` with `result`.
    pub async fn respond(&mut self, request: &serde_json::Value, result: serde_json::Value) {
        self.send(serde_json::json!({
            "jsonrpc": "2.0",
            "id": request["id"],
            "result": result
        }))
        .await;
    }

    /// Answer `initialize` and wait for `initialized`.
    pub async fn handshake(&mut self) -> serde_json::Value {
        let init = self.next_with_method("initialize").await.unwrap();
        self.respond(&init, serde_json::json!({ "capabilities": {} }))
            .await;
        self.next_with_method("initialized").await.unwrap();
        init
    }
}

/// Poll until `condition` holds. Gives up after a few seconds.
pub(crate) async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}
