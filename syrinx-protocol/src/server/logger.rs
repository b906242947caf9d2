//! The tunnel logger: routes log events into stderr frames on the
//! connection, queueing anything emitted outside a work window.
//!
//! Frames are encoded into private buffers and written to the connection
//! through the shared, mutex-guarded sink the dispatcher also uses for
//! replies. Activity ids are minted here, one counter per connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use syrinx_store_core::StoreDir;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::error::{DaemonError, ProtocolError};
use crate::protocol::{
    ActivityType, LoggerField, Msg, ProtocolVersion, ResultType, StderrError, Verbosity,
};
use crate::serialization::{write_bytes, Serialize};

/// The connection's write half, shared between dispatcher and logger.
pub type SharedSink = Arc<tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

struct QueueState {
    can_send: bool,
    pending: Vec<Vec<u8>>,
}

struct LoggerInner {
    sink: SharedSink,
    version: ProtocolVersion,
    store_dir: StoreDir,
    queue: Mutex<QueueState>,
    next_activity_id: AtomicU64,
    verbosity: AtomicU64,
}

/// Cloneable handle; all clones share one frame queue and id counter.
#[derive(Clone)]
pub struct TunnelLogger {
    inner: Arc<LoggerInner>,
}

impl TunnelLogger {
    pub fn new(sink: SharedSink, version: ProtocolVersion, store_dir: StoreDir) -> Self {
        TunnelLogger {
            inner: Arc::new(LoggerInner {
                sink,
                version,
                store_dir,
                queue: Mutex::new(QueueState {
                    can_send: false,
                    pending: Vec::new(),
                }),
                next_activity_id: AtomicU64::new(1),
                verbosity: AtomicU64::new(Verbosity::Info.into()),
            }),
        }
    }

    pub fn set_verbosity(&self, verbosity: Verbosity) {
        self.inner.verbosity.store(verbosity.into(), Ordering::Relaxed);
    }

    fn verbosity(&self) -> Verbosity {
        Verbosity::from(self.inner.verbosity.load(Ordering::Relaxed))
    }

    /// Emit a log line at `level`, dropped when the client asked for less.
    pub async fn log(&self, level: Verbosity, message: &str) -> Result<(), ProtocolError> {
        if level > self.verbosity() {
            return Ok(());
        }
        let mut frame = Vec::new();
        (Msg::Next as u64)
            .serialize(&mut frame, self.inner.version, &self.inner.store_dir)
            .await?;
        write_bytes(&mut frame, message.trim_end_matches('\n').as_bytes()).await?;
        self.enqueue(frame).await
    }

    /// Open an activity and return its id.
    pub async fn start_activity(
        &self,
        level: Verbosity,
        activity_type: ActivityType,
        text: &str,
        fields: &[LoggerField],
        parent: u64,
    ) -> Result<u64, ProtocolError> {
        let id = self.inner.next_activity_id.fetch_add(1, Ordering::Relaxed);
        // Clients before 1.20 have no activity frames; degrade to a line.
        if self.inner.version.minor < 20 {
            if !text.is_empty() {
                self.log(level, &format!("{text}...")).await?;
            }
            return Ok(id);
        }
        if level > self.verbosity() {
            return Ok(id);
        }
        let v = self.inner.version;
        let dir = &self.inner.store_dir;
        let mut frame = Vec::new();
        (Msg::StartActivity as u64).serialize(&mut frame, v, dir).await?;
        id.serialize(&mut frame, v, dir).await?;
        u64::from(level).serialize(&mut frame, v, dir).await?;
        u64::from(activity_type).serialize(&mut frame, v, dir).await?;
        write_bytes(&mut frame, text.as_bytes()).await?;
        fields.to_vec().serialize(&mut frame, v, dir).await?;
        parent.serialize(&mut frame, v, dir).await?;
        self.enqueue(frame).await?;
        Ok(id)
    }

    pub async fn stop_activity(&self, id: u64) -> Result<(), ProtocolError> {
        if self.inner.version.minor < 20 {
            return Ok(());
        }
        let mut frame = Vec::new();
        (Msg::StopActivity as u64)
            .serialize(&mut frame, self.inner.version, &self.inner.store_dir)
            .await?;
        id.serialize(&mut frame, self.inner.version, &self.inner.store_dir)
            .await?;
        self.enqueue(frame).await
    }

    pub async fn result(
        &self,
        id: u64,
        result_type: ResultType,
        fields: &[LoggerField],
    ) -> Result<(), ProtocolError> {
        if self.inner.version.minor < 20 {
            return Ok(());
        }
        let v = self.inner.version;
        let dir = &self.inner.store_dir;
        let mut frame = Vec::new();
        (Msg::Result as u64).serialize(&mut frame, v, dir).await?;
        id.serialize(&mut frame, v, dir).await?;
        u64::from(result_type).serialize(&mut frame, v, dir).await?;
        fields.to_vec().serialize(&mut frame, v, dir).await?;
        self.enqueue(frame).await
    }

    /// Open the work window: from here until `stop_work*`, frames go to
    /// the client immediately. Queued frames are flushed first.
    pub async fn start_work(&self) -> Result<(), ProtocolError> {
        let pending = {
            let mut queue = self.inner.queue.lock().expect("logger queue");
            queue.can_send = true;
            std::mem::take(&mut queue.pending)
        };
        let mut sink = self.inner.sink.lock().await;
        for frame in pending {
            sink.write_all(&frame)
                .await
                .map_err(|e| ProtocolError::io("writing queued stderr frame", e))?;
        }
        sink.flush()
            .await
            .map_err(|e| ProtocolError::io("flushing stderr frames", e))?;
        Ok(())
    }

    /// Close the work window successfully: emits `LAST`. The typed reply
    /// follows it on the wire.
    pub async fn stop_work(&self) -> Result<(), ProtocolError> {
        self.close_window();
        let mut frame = Vec::new();
        (Msg::Last as u64)
            .serialize(&mut frame, self.inner.version, &self.inner.store_dir)
            .await?;
        let mut sink = self.inner.sink.lock().await;
        sink.write_all(&frame)
            .await
            .map_err(|e| ProtocolError::io("writing LAST frame", e))?;
        Ok(())
    }

    /// Close the work window with a failure: emits `ERROR`.
    pub async fn stop_work_err(&self, err: &DaemonError) -> Result<(), ProtocolError> {
        trace!(kind = %err.kind, "reporting operation failure: {}", err.message);
        self.close_window();
        let v = self.inner.version;
        let dir = &self.inner.store_dir;
        let mut frame = Vec::new();
        (Msg::Error as u64).serialize(&mut frame, v, dir).await?;
        if v.minor >= 26 {
            StderrError::from_daemon_error(err)
                .serialize(&mut frame, v, dir)
                .await?;
        } else {
            err.message.serialize(&mut frame, v, dir).await?;
            err.status.max(1).serialize(&mut frame, v, dir).await?;
        }
        let mut sink = self.inner.sink.lock().await;
        sink.write_all(&frame)
            .await
            .map_err(|e| ProtocolError::io("writing ERROR frame", e))?;
        sink.flush()
            .await
            .map_err(|e| ProtocolError::io("flushing ERROR frame", e))?;
        Ok(())
    }

    fn close_window(&self) {
        let mut queue = self.inner.queue.lock().expect("logger queue");
        queue.can_send = false;
    }

    async fn enqueue(&self, frame: Vec<u8>) -> Result<(), ProtocolError> {
        {
            let mut queue = self.inner.queue.lock().expect("logger queue");
            if !queue.can_send {
                queue.pending.push(frame);
                return Ok(());
            }
        }
        let mut sink = self.inner.sink.lock().await;
        sink.write_all(&frame)
            .await
            .map_err(|e| ProtocolError::io("writing stderr frame", e))?;
        sink.flush()
            .await
            .map_err(|e| ProtocolError::io("flushing stderr frame", e))?;
        Ok(())
    }
}
