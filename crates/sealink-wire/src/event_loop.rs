//! Event loop: one thread, one multiplexer, many sockets.
//!
//! Each [`EventLoop`] owns a dedicated OS thread running a single-threaded
//! tokio runtime. Registered sources are polled for read readiness; when one
//! becomes readable the loop reads what is available into a fixed buffer and
//! hands the bytes to the source. Sources are serviced strictly one at a
//! time, in whatever order the multiplexer reports them.
//!
//! The loop never writes. Sends happen synchronously on the caller's thread.

use crate::error::WireError;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use sealink_types::ConnectionId;
use std::future::Future;
use std::io;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

/// Something the loop can watch for readability.
pub(crate) trait ReadSource: Send + Sync + 'static {
    fn source_id(&self) -> ConnectionId;

    /// The socket whose read readiness is watched.
    fn readiness_stream(&self) -> &TcpStream;

    /// Bytes read from the socket.
    fn deliver(&self, bytes: &[u8]);

    /// EOF or a read error. The source will not be polled again.
    fn fail(&self, error: WireError);

    /// Closed sources are dropped from the loop.
    fn is_finished(&self) -> bool;
}

enum LoopCommand {
    Register(Arc<dyn ReadSource>),
    Stop,
}

type Readiness = BoxFuture<'static, (Arc<dyn ReadSource>, io::Result<()>)>;

/// Handle to a running event loop thread.
///
/// Dropping the handle stops the loop; it does not wait for the thread.
pub struct EventLoop {
    name: String,
    handle: Handle,
    commands: mpsc::UnboundedSender<LoopCommand>,
}

impl EventLoop {
    /// Spawn the loop thread. `read_buffer_size` bounds a single read.
    pub fn start(name: &str, read_buffer_size: usize) -> Result<Self, WireError> {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (handle_tx, handle_rx) = std::sync::mpsc::channel();

        let thread_name = name.to_string();
        std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = handle_tx.send(Err(e));
                        return;
                    }
                };
                let _ = handle_tx.send(Ok(runtime.handle().clone()));
                runtime.block_on(run(command_rx, read_buffer_size));
                debug!(event_loop = %thread_name, "Event loop exited");
            })?;

        let handle = handle_rx.recv().map_err(|_| WireError::LoopStopped)??;
        info!(event_loop = %name, "Event loop started");

        Ok(Self {
            name: name.to_string(),
            handle,
            commands,
        })
    }

    /// Whether the loop thread is still servicing commands.
    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    /// Ask the loop to exit. In-flight reads are abandoned, not drained.
    pub fn stop(&self) {
        if self.commands.send(LoopCommand::Stop).is_ok() {
            debug!(event_loop = %self.name, "Stop requested");
        }
    }

    /// Move a non-blocking std socket onto this loop's reactor.
    pub(crate) fn adopt(&self, socket: std::net::TcpStream) -> Result<TcpStream, WireError> {
        let _guard = self.handle.enter();
        Ok(TcpStream::from_std(socket)?)
    }

    /// Enter the loop's runtime context on the current thread.
    pub(crate) fn enter(&self) -> tokio::runtime::EnterGuard<'_> {
        self.handle.enter()
    }

    /// Run a task on the loop thread.
    pub(crate) fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(task);
    }

    /// Start watching `source` for readability.
    pub(crate) fn register(&self, source: Arc<dyn ReadSource>) -> Result<(), WireError> {
        let id = source.source_id();
        self.commands
            .send(LoopCommand::Register(source))
            .map_err(|_| WireError::LoopStopped)?;
        trace!(event_loop = %self.name, conn = %id, "Registered read interest");
        Ok(())
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}

fn arm(source: Arc<dyn ReadSource>) -> Readiness {
    Box::pin(async move {
        let readiness = source.readiness_stream().readable().await;
        (source, readiness)
    })
}

async fn run(mut commands: mpsc::UnboundedReceiver<LoopCommand>, read_buffer_size: usize) {
    let mut sources: FuturesUnordered<Readiness> = FuturesUnordered::new();
    let mut buf = vec![0u8; read_buffer_size];

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(LoopCommand::Register(source)) => sources.push(arm(source)),
                Some(LoopCommand::Stop) | None => break,
            },
            Some((source, readiness)) = sources.next(), if !sources.is_empty() => {
                if let Some(source) = service(source, readiness, &mut buf) {
                    sources.push(arm(source));
                }
            }
        }
    }
}

/// Read once from a ready source. Returns the source if it should stay armed.
fn service(
    source: Arc<dyn ReadSource>,
    readiness: io::Result<()>,
    buf: &mut [u8],
) -> Option<Arc<dyn ReadSource>> {
    if source.is_finished() {
        return None;
    }
    if let Err(e) = readiness {
        source.fail(e.into());
        return None;
    }

    match source.readiness_stream().try_read(buf) {
        Ok(0) => {
            source.fail(WireError::ConnectionClosed);
            None
        }
        Ok(n) => {
            trace!(conn = %source.source_id(), bytes = n, "Readable");
            source.deliver(&buf[..n]);
            (!source.is_finished()).then_some(source)
        }
        // Spurious wakeup; readiness was cleared, wait again.
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Some(source),
        Err(e) if e.kind() == io::ErrorKind::Interrupted => Some(source),
        Err(e) => {
            source.fail(e.into());
            None
        }
    }
}
