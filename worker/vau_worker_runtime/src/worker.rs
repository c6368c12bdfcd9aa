use crate::dispatch::{CallOutcome, Dispatcher};
use crate::error::{CallFailure, FailureKind, ModuleError, RuntimeError};
use crate::module::{HostCapabilities, NativeModule, SharedMemoryDescriptor};
use crate::operation::Method;
use crate::protocol::{CallerEnvelope, ControlMessage, CorrelationId, WorkerEnvelope};
use crate::retry::{DeferredEntry, RetryPolicy, RetryQueue};
use crate::trace::TraceFilter;
use serde_json::Value;
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender};
use std::thread;
use std::time::Instant;

const DEFAULT_OUTBOUND_QUEUE_CAP: usize = 256;

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub capabilities: HostCapabilities,
    pub retry: RetryPolicy,
    pub trace_patterns: Vec<String>,
    pub outbound_queue_cap: usize,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            capabilities: HostCapabilities::default(),
            retry: RetryPolicy::default(),
            trace_patterns: Vec::new(),
            outbound_queue_cap: DEFAULT_OUTBOUND_QUEUE_CAP,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Initializing,
    Ready,
    /// Startup failed; nothing is answered from here on.
    Failed,
}

/// Outbound side of the bridge. Sends at most one READY per instance.
pub struct ResponseChannel {
    tx: SyncSender<WorkerEnvelope>,
    ready_sent: bool,
}

impl ResponseChannel {
    pub fn new(tx: SyncSender<WorkerEnvelope>) -> Self {
        Self {
            tx,
            ready_sent: false,
        }
    }

    pub fn emit_result(&mut self, id: CorrelationId, value: Value) -> Result<(), RuntimeError> {
        self.emit(WorkerEnvelope::Result { id, value })
    }

    pub fn emit_failure(
        &mut self,
        id: CorrelationId,
        failure: CallFailure,
    ) -> Result<(), RuntimeError> {
        self.emit(WorkerEnvelope::Failure { id, failure })
    }

    pub fn emit_ready(
        &mut self,
        shared_memory: Option<SharedMemoryDescriptor>,
    ) -> Result<(), RuntimeError> {
        if self.ready_sent {
            tracing::warn!("READY already sent; ignoring");
            return Ok(());
        }
        self.ready_sent = true;
        self.emit(WorkerEnvelope::Ready {
            shared_memory,
            methods: Method::names(),
        })
    }

    pub fn emit_startup_error(&mut self, failure: CallFailure) -> Result<(), RuntimeError> {
        self.emit(WorkerEnvelope::StartupError { failure })
    }

    fn emit(&mut self, envelope: WorkerEnvelope) -> Result<(), RuntimeError> {
        self.tx
            .send(envelope)
            .map_err(|_| RuntimeError::ResponseChannelClosed)
    }
}

/// The single cooperative worker: owns the module and services one envelope
/// at a time.
pub struct Worker<M> {
    state: BridgeState,
    dispatcher: Option<Dispatcher<M>>,
    retry: RetryQueue,
    responses: ResponseChannel,
    startup_failure: Option<CallFailure>,
}

impl<M: NativeModule> Worker<M> {
    /// Loads and initializes the module, then announces the outcome.
    pub fn start<F>(
        options: WorkerOptions,
        responses: ResponseChannel,
        load: F,
    ) -> Result<Self, RuntimeError>
    where
        F: FnOnce() -> Result<M, ModuleError>,
    {
        let mut worker = Self {
            state: BridgeState::Initializing,
            dispatcher: None,
            retry: RetryQueue::new(options.retry),
            responses,
            startup_failure: None,
        };

        let started = load().and_then(|module| {
            let mut dispatcher =
                Dispatcher::new(module, TraceFilter::new(&options.trace_patterns));
            dispatcher.initialize()?;
            Ok(dispatcher)
        });

        match started {
            Ok(dispatcher) => {
                let shared_memory =
                    negotiate_shared_memory(options.capabilities, dispatcher.module());
                worker.dispatcher = Some(dispatcher);
                worker.state = BridgeState::Ready;
                tracing::info!(methods = ?Method::names(), "bridge ready");
                worker.responses.emit_ready(shared_memory)?;
            }
            Err(err) => {
                tracing::error!("bridge startup failed: {err}");
                let failure = CallFailure {
                    kind: FailureKind::StartupError,
                    ..err.into_failure()
                };
                worker.state = BridgeState::Failed;
                worker.startup_failure = Some(failure.clone());
                worker.responses.emit_startup_error(failure)?;
            }
        }

        Ok(worker)
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    pub fn pending_retries(&self) -> usize {
        self.retry.len()
    }

    pub fn module(&self) -> Option<&M> {
        self.dispatcher.as_ref().map(Dispatcher::module)
    }

    pub fn handle_envelope(
        &mut self,
        envelope: CallerEnvelope,
        now: Instant,
    ) -> Result<(), RuntimeError> {
        if self.state != BridgeState::Ready {
            tracing::debug!(state = ?self.state, "dropping envelope; bridge is not serving");
            return Ok(());
        }

        match envelope {
            CallerEnvelope::Call(request) => self.service(DeferredEntry::fresh(request), now),
            CallerEnvelope::Control(ControlMessage::Trace { patterns }) => {
                tracing::info!(?patterns, "replacing trace rules");
                if let Some(dispatcher) = self.dispatcher.as_mut() {
                    dispatcher.trace_filter_mut().replace(&patterns);
                }
                Ok(())
            }
            CallerEnvelope::Control(ControlMessage::ResourceReady { key }) => {
                self.retry.notify_resource(&key, now);
                Ok(())
            }
            CallerEnvelope::Rejected { id, failure } => {
                tracing::warn!(%id, "rejecting malformed call: {failure}");
                self.responses.emit_failure(id, failure)
            }
        }
    }

    /// Replays the current retry batch if its timer has fired.
    pub fn flush_due(&mut self, now: Instant) -> Result<bool, RuntimeError> {
        if !self.retry.is_due(now) {
            return Ok(false);
        }

        let batch = self.retry.take_batch();
        tracing::debug!(count = batch.len(), "replaying deferred calls");
        for mut entry in batch {
            entry.attempts += 1;
            self.service(entry, now)?;
        }
        Ok(true)
    }

    /// Drives the worker until the caller hangs up and no deferred call is
    /// left.
    pub fn run(mut self, inbound: Receiver<CallerEnvelope>) -> Result<(), RuntimeError> {
        let mut inbound_open = true;

        loop {
            let now = Instant::now();
            self.flush_due(now)?;

            let deadline = self.retry.deadline();

            if !inbound_open {
                match deadline {
                    Some(deadline) => {
                        thread::sleep(deadline.saturating_duration_since(now));
                        continue;
                    }
                    None => break,
                }
            }

            let received = match deadline {
                Some(deadline) => inbound.recv_timeout(deadline.saturating_duration_since(now)),
                None => inbound.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };

            match received {
                Ok(envelope) => self.handle_envelope(envelope, Instant::now())?,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    tracing::debug!(pending = self.retry.len(), "caller closed its channel");
                    inbound_open = false;
                }
            }
        }

        match self.startup_failure {
            Some(failure) => Err(RuntimeError::Startup(failure.message)),
            None => Ok(()),
        }
    }

    fn service(&mut self, entry: DeferredEntry, now: Instant) -> Result<(), RuntimeError> {
        let Some(dispatcher) = self.dispatcher.as_mut() else {
            return Ok(());
        };

        match dispatcher.dispatch(&entry.request) {
            CallOutcome::Success(value) => self.responses.emit_result(entry.request.id, value),
            CallOutcome::Failure(failure) => {
                self.responses.emit_failure(entry.request.id, failure)
            }
            CallOutcome::Retry { resource } => match self.retry.defer(entry, now) {
                Ok(scheduled) => {
                    tracing::debug!(%resource, scheduled, "call deferred");
                    Ok(())
                }
                Err(entry) => {
                    tracing::warn!(
                        id = %entry.request.id,
                        name = %entry.request.name,
                        attempts = entry.attempts,
                        "giving up on deferred call"
                    );
                    let failure = CallFailure::new(
                        FailureKind::RetryLimitExceeded,
                        format!(
                            "{} still waiting on `{resource}` after {} replays",
                            entry.request.name, entry.attempts
                        ),
                    );
                    self.responses.emit_failure(entry.request.id, failure)
                }
            },
        }
    }
}

fn negotiate_shared_memory<M: NativeModule>(
    capabilities: HostCapabilities,
    module: &M,
) -> Option<SharedMemoryDescriptor> {
    if !capabilities.isolated {
        tracing::warn!(
            "worker is running in a non-isolated context; shared memory is unavailable"
        );
        return None;
    }
    if !capabilities.shared_memory {
        tracing::warn!("host does not provide a shared-memory primitive");
        return None;
    }

    let descriptor = module.shared_memory();
    if descriptor.is_none() {
        tracing::warn!("module does not export a shared memory region");
    }
    descriptor
}
