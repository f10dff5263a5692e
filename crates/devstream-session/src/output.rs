//! Raw output tail adapter.
//!
//! A degenerate reconciler: no merge logic, each received buffer is
//! handed to every observer in arrival order. The only bookkeeping is
//! the first-buffer transition, which consumers use to clear a display
//! before first paint. Control messages (stdin, resize) are write-only
//! and never participate in reconciliation.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use devstream_core::ControlCommand;
use devstream_core::command::Resize;
use devstream_core::observer::{ObserverSet, Subscription};
use devstream_transport::{
    ChannelOptions, Connector, Frame, FrameHandler, ReconnectingChannel,
};

/// One delivered buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub data: Bytes,
    /// True for the first buffer after a (re)connect. The coordinator
    /// resends the backlog on each connection, so a repaint starts here.
    pub first: bool,
}

/// Ordered pass-through of opaque output bytes.
pub struct OutputStream {
    seen_any: AtomicBool,
    observers: ObserverSet<OutputChunk>,
    live: broadcast::Sender<Bytes>,
}

impl Default for OutputStream {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputStream {
    /// Create an empty stream adapter.
    #[must_use]
    pub fn new() -> Self {
        let (live, _) = broadcast::channel(1024);
        Self {
            seen_any: AtomicBool::new(false),
            observers: ObserverSet::new(),
            live,
        }
    }

    /// Observe buffers as they arrive. There is no history replay here;
    /// late observers see only subsequent buffers.
    pub fn observe(&self, observer: impl Fn(&OutputChunk) + Send + Sync + 'static) -> Subscription {
        self.observers.subscribe(observer)
    }

    /// Async stream view over the same buffers, for consumers that pipe
    /// rather than paint. Lagged receivers drop buffers.
    #[must_use]
    pub fn stream(&self) -> futures::stream::BoxStream<'static, Bytes> {
        BroadcastStream::new(self.live.subscribe())
            .filter_map(|res| async move { res.ok() })
            .boxed()
    }
}

impl FrameHandler for OutputStream {
    fn on_frame(&self, frame: Frame) {
        let Frame::Binary(data) = frame else {
            tracing::debug!("ignoring text frame on output stream");
            return;
        };

        let chunk = OutputChunk {
            first: !self.seen_any.swap(true, Ordering::SeqCst),
            data: data.clone(),
        };
        self.observers.notify(&chunk);
        let _ = self.live.send(data);
    }

    fn on_connected(&self, connected: bool) {
        if connected {
            self.seen_any.store(false, Ordering::SeqCst);
        }
    }
}

/// An output tail bound to its own reconnecting channel, with the
/// write-only control path for terminal sessions.
pub struct OutputClient {
    stream: Arc<OutputStream>,
    channel: ReconnectingChannel,
}

impl OutputClient {
    /// Build a client over `connector`. Call
    /// [`ensure_connected`](Self::ensure_connected) to start it.
    #[must_use]
    pub fn new(connector: Box<dyn Connector>, options: ChannelOptions) -> Self {
        let stream = Arc::new(OutputStream::new());
        let channel = ReconnectingChannel::new(connector, Arc::clone(&stream) as _, options);
        Self { stream, channel }
    }

    /// Start connecting. Idempotent.
    pub fn ensure_connected(&self) {
        self.channel.ensure_connected();
    }

    /// Tear down the channel.
    pub fn close(&self) {
        self.channel.close();
    }

    /// The byte stream adapter.
    #[must_use]
    pub fn stream(&self) -> &Arc<OutputStream> {
        &self.stream
    }

    /// Send terminal input bytes, base64-encoded on the wire.
    pub fn send_stdin(&self, data: &[u8]) {
        self.send_command(&ControlCommand::stdin(data));
    }

    /// Send a terminal resize event.
    pub fn send_resize(&self, width: u32, height: u32) {
        self.send_command(&ControlCommand::Resize(Resize { width, height }));
    }

    fn send_command(&self, command: &ControlCommand) {
        match serde_json::to_string(command) {
            Ok(json) => self.channel.send(Frame::Text(json)),
            Err(e) => tracing::debug!("failed to encode control command: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use devstream_transport::Connection as _;
    use devstream_transport::loopback;

    use super::*;

    #[test]
    fn test_first_buffer_transition() {
        let stream = OutputStream::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        let _sub = stream.observe(move |chunk| {
            sink.lock().unwrap().push((chunk.data.clone(), chunk.first));
        });

        stream.on_connected(true);
        stream.on_frame(Frame::binary(&b"one"[..]));
        stream.on_frame(Frame::binary(&b"two"[..]));

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec![
            (Bytes::from_static(b"one"), true),
            (Bytes::from_static(b"two"), false),
        ]);
    }

    #[test]
    fn test_reconnect_resets_first_buffer() {
        let stream = OutputStream::new();
        let firsts = Arc::new(Mutex::new(Vec::new()));

        let sink = firsts.clone();
        let _sub = stream.observe(move |chunk| {
            sink.lock().unwrap().push(chunk.first);
        });

        stream.on_connected(true);
        stream.on_frame(Frame::binary(&b"a"[..]));
        stream.on_connected(false);
        stream.on_connected(true);
        stream.on_frame(Frame::binary(&b"b"[..]));

        assert_eq!(*firsts.lock().unwrap(), vec![true, true]);
    }

    #[test]
    fn test_text_frames_are_ignored() {
        let stream = OutputStream::new();
        let count = Arc::new(Mutex::new(0));
        let c = count.clone();
        let _sub = stream.observe(move |_| *c.lock().unwrap() += 1);

        stream.on_frame(Frame::text("control echo"));
        assert_eq!(*count.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stream_view_carries_bytes() {
        let stream = OutputStream::new();
        let mut view = stream.stream();

        stream.on_frame(Frame::binary(&b"tail"[..]));
        assert_eq!(view.next().await.unwrap(), Bytes::from_static(b"tail"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stdin_and_resize_reach_coordinator() {
        let (connector, mut accepted) = loopback::connector();
        let client = OutputClient::new(Box::new(connector), ChannelOptions::default());
        client.ensure_connected();

        let mut conn = accepted.recv().await.unwrap();
        while !client.channel.is_connected() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        client.send_stdin(b"ls\n");
        client.send_resize(120, 40);

        let Frame::Text(stdin) = conn.recv().await.unwrap().unwrap() else {
            panic!("expected text frame");
        };
        let parsed: ControlCommand = serde_json::from_str(&stdin).unwrap();
        assert_eq!(parsed.decode_stdin().unwrap(), b"ls\n");

        let resize = conn.recv().await.unwrap().unwrap();
        assert_eq!(resize, Frame::text(r#"{"resize":{"width":120,"height":40}}"#));

        client.close();
    }
}
