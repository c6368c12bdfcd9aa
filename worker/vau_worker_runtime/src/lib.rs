pub mod dispatch;
pub mod error;
pub mod module;
pub mod operation;
pub mod protocol;
pub mod retry;
pub mod trace;
pub mod worker;

#[cfg(test)]
mod testing;

use crate::protocol::{reader_loop, writer_loop};
use std::io;
use std::sync::mpsc;
use std::thread;

pub use crate::dispatch::{CallOutcome, Dispatcher};
pub use crate::error::{CallFailure, FailureKind, HostCallbackError, ModuleError, RuntimeError};
pub use crate::module::{
    HostCapabilities, HostScope, ModulePtr, NativeModule, PixelBuffer, SharedMemoryDescriptor,
};
pub use crate::operation::{Method, Operation};
pub use crate::protocol::{
    CALLER_TO_WORKER_CAP, CallRequest, CallerEnvelope, ControlMessage, CorrelationId,
    WORKER_TO_CALLER_CAP, WorkerEnvelope,
};
pub use crate::retry::{DeferredEntry, RetryPolicy, RetryQueue};
pub use crate::trace::{TraceFilter, TraceRule};
pub use crate::worker::{BridgeState, ResponseChannel, Worker, WorkerOptions};
pub use serde_json;

/// Serves the bridge over stdin/stdout until the caller closes stdin.
///
/// The module is loaded and driven on the calling thread; framing runs on one
/// reader and one writer thread.
pub fn run<M, F>(options: WorkerOptions, load: F) -> Result<(), RuntimeError>
where
    M: NativeModule,
    F: FnOnce() -> Result<M, ModuleError>,
{
    let (response_tx, response_rx) = mpsc::sync_channel(options.outbound_queue_cap.max(1));
    let (request_tx, request_rx) = mpsc::channel();

    let writer_handle = thread::spawn(move || writer_loop(io::stdout().lock(), response_rx));

    let reader_handle = thread::spawn(move || {
        let read_result = reader_loop(io::stdin().lock(), |envelope| {
            if request_tx.send(envelope).is_err() {
                tracing::debug!("worker gone; discarding inbound envelope");
            }
        });

        if let Err(err) = &read_result {
            tracing::error!("reader loop terminated with error: {err}");
        }

        read_result
    });

    let worker_result = Worker::start(options, ResponseChannel::new(response_tx), load)
        .and_then(|worker| worker.run(request_rx));

    // The worker owned the only response sender, so the writer drains and stops.
    match writer_handle.join() {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            return Err(RuntimeError::Io {
                context: "writer thread failed",
                source: err,
            });
        }
        Err(_) => return Err(RuntimeError::ThreadPanicked("writer")),
    }

    if reader_handle.is_finished() {
        match reader_handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                return Err(RuntimeError::Io {
                    context: "reader thread failed",
                    source: err,
                });
            }
            Err(_) => return Err(RuntimeError::ThreadPanicked("reader")),
        }
    } else {
        // Avoid hanging process exit on a blocked stdin read during teardown.
        tracing::warn!("reader thread still active during shutdown; skipping join");
    }

    worker_result
}
