//! Wire dump recording.
//!
//! The dumper is a tee at the framer's byte boundaries: request head,
//! request body, response head, response body, each individually
//! toggled. Records land in the request's own append-only buffer and,
//! when configured, in a client-level sink. The sink is either written
//! synchronously on the network path, or decoupled through a bounded
//! channel; under sink backpressure whole records are dropped and
//! counted, never torn.

use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Which wire segments to capture.
#[derive(Debug, Clone, Copy)]
pub struct DumpOptions {
    pub request_head: bool,
    pub request_body: bool,
    pub response_head: bool,
    pub response_body: bool,
    /// Decouple sink IO from the network path through a bounded queue.
    pub async_mode: bool,
}

impl Default for DumpOptions {
    fn default() -> Self {
        Self {
            request_head: true,
            request_body: true,
            response_head: true,
            response_body: true,
            async_mode: false,
        }
    }
}

impl DumpOptions {
    fn any(&self) -> bool {
        self.request_head || self.request_body || self.response_head || self.response_body
    }
}

const ASYNC_QUEUE_DEPTH: usize = 256;

#[derive(Clone)]
enum SinkHandle {
    Sync(Arc<Mutex<Box<dyn Write + Send>>>),
    Async {
        tx: mpsc::Sender<Bytes>,
        dropped: Arc<AtomicU64>,
    },
}

/// A client-level destination for dump records.
#[derive(Clone)]
pub struct DumpSink {
    handle: SinkHandle,
}

impl DumpSink {
    /// Synchronous sink writing to standard output.
    #[must_use]
    pub fn stdout() -> Self {
        Self::from_writer(std::io::stdout())
    }

    /// Synchronous sink around any writer.
    #[must_use]
    pub fn from_writer<W: Write + Send + 'static>(writer: W) -> Self {
        Self {
            handle: SinkHandle::Sync(Arc::new(Mutex::new(Box::new(writer)))),
        }
    }

    /// Asynchronous sink: a spawned task drains a bounded queue into the
    /// writer. Must be created inside a tokio runtime.
    #[must_use]
    pub fn spawn_async<W: Write + Send + 'static>(mut writer: W) -> Self {
        let (tx, mut rx) = mpsc::channel::<Bytes>(ASYNC_QUEUE_DEPTH);
        let dropped = Arc::new(AtomicU64::new(0));
        let drop_count = dropped.clone();
        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                if let Err(err) = writer.write_all(&record) {
                    tracing::debug!("dump sink write failed: {err}");
                    break;
                }
            }
            let dropped = drop_count.load(Ordering::Relaxed);
            if dropped > 0 {
                tracing::debug!("dump sink dropped {dropped} records under backpressure");
            }
        });
        Self {
            handle: SinkHandle::Async { tx, dropped },
        }
    }

    fn write_record(&self, record: &[u8]) {
        match &self.handle {
            SinkHandle::Sync(writer) => {
                let mut writer = writer.lock();
                if let Err(err) = writer.write_all(record) {
                    tracing::debug!("dump sink write failed: {err}");
                }
            }
            SinkHandle::Async { tx, dropped } => {
                if tx.try_send(Bytes::copy_from_slice(record)).is_err() {
                    let total = dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    tracing::debug!("dump record dropped under sink backpressure; total={total}");
                }
            }
        }
    }
}

impl std::fmt::Debug for DumpSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.handle {
            SinkHandle::Sync(_) => f.write_str("DumpSink::Sync"),
            SinkHandle::Async { .. } => f.write_str("DumpSink::Async"),
        }
    }
}

/// The per-request append-only dump buffer; emptied on retry.
#[derive(Debug, Clone, Default)]
pub struct DumpBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl DumpBuffer {
    pub(crate) fn reset(&self) {
        self.bytes.lock().clear();
    }

    /// Lossy text rendering of everything captured so far.
    #[must_use]
    pub fn snapshot(&self) -> String {
        String::from_utf8_lossy(&self.bytes.lock()).into_owned()
    }

    fn push(&self, record: &[u8]) {
        self.bytes.lock().extend_from_slice(record);
    }
}

/// The tap handed into the H1 and H2 framers; cheap to clone.
#[derive(Debug, Clone)]
pub(crate) struct Dumper {
    options: DumpOptions,
    buffer: Option<DumpBuffer>,
    sink: Option<DumpSink>,
}

impl Dumper {
    pub(crate) fn disabled() -> Self {
        Self {
            options: DumpOptions {
                request_head: false,
                request_body: false,
                response_head: false,
                response_body: false,
                async_mode: false,
            },
            buffer: None,
            sink: None,
        }
    }

    pub(crate) fn new(options: DumpOptions, buffer: DumpBuffer, sink: Option<DumpSink>) -> Self {
        if !options.any() {
            return Self::disabled();
        }
        Self {
            options,
            buffer: Some(buffer),
            sink,
        }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.options.any()
    }

    pub(crate) fn request_head(&self, bytes: &[u8]) {
        if self.options.request_head {
            self.record(bytes);
        }
    }

    pub(crate) fn request_body(&self, bytes: &[u8]) {
        if self.options.request_body && !bytes.is_empty() {
            self.record(bytes);
        }
    }

    pub(crate) fn response_head(&self, bytes: &[u8]) {
        if self.options.response_head {
            self.record(bytes);
        }
    }

    pub(crate) fn response_body(&self, bytes: &[u8]) {
        if self.options.response_body && !bytes.is_empty() {
            self.record(bytes);
        }
    }

    fn record(&self, bytes: &[u8]) {
        if let Some(buffer) = &self.buffer {
            buffer.push(bytes);
        }
        if let Some(sink) = &self.sink {
            sink.write_record(bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toggles_filter_segments() {
        let buffer = DumpBuffer::default();
        let dumper = Dumper::new(
            DumpOptions {
                request_body: false,
                response_body: false,
                ..Default::default()
            },
            buffer.clone(),
            None,
        );

        dumper.request_head(b"GET / HTTP/1.1\r\n\r\n");
        dumper.request_body(b"ignored");
        dumper.response_head(b"HTTP/1.1 200 OK\r\n\r\n");
        dumper.response_body(b"ignored");

        let text = buffer.snapshot();
        assert!(text.contains("GET /"));
        assert!(text.contains("200 OK"));
        assert!(!text.contains("ignored"));
    }

    #[test]
    fn reset_empties_the_buffer() {
        let buffer = DumpBuffer::default();
        let dumper = Dumper::new(DumpOptions::default(), buffer.clone(), None);
        dumper.request_head(b"attempt one");
        buffer.reset();
        dumper.request_head(b"attempt two");
        assert_eq!(buffer.snapshot(), "attempt two");
    }

    #[test]
    fn sink_receives_a_copy() {
        #[derive(Clone, Default)]
        struct Shared(Arc<Mutex<Vec<u8>>>);
        impl Write for Shared {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let sink_data = Shared::default();
        let buffer = DumpBuffer::default();
        let dumper = Dumper::new(
            DumpOptions::default(),
            buffer.clone(),
            Some(DumpSink::from_writer(sink_data.clone())),
        );
        dumper.response_head(b"HTTP/1.1 404 Not Found\r\n");

        assert_eq!(buffer.snapshot(), "HTTP/1.1 404 Not Found\r\n");
        assert_eq!(&*sink_data.0.lock(), b"HTTP/1.1 404 Not Found\r\n");
    }
}
