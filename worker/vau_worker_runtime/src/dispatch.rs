use crate::error::{CallFailure, FailureKind, ModuleError};
use crate::module::{HostScope, NativeModule, with_utf8_arg};
use crate::operation::Operation;
use crate::protocol::CallRequest;
use crate::trace::TraceFilter;
use serde_json::Value;

/// Result of running one call against the module.
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    Success(Value),
    Failure(CallFailure),
    /// The module is waiting on `resource`; the call must be replayed later.
    Retry { resource: String },
}

pub struct Dispatcher<M> {
    module: M,
    trace: TraceFilter,
}

impl<M: NativeModule> Dispatcher<M> {
    pub fn new(module: M, trace: TraceFilter) -> Self {
        Self { module, trace }
    }

    pub fn initialize(&mut self) -> Result<(), ModuleError> {
        let mut scope = HostScope::default();
        self.module.initialize(&mut scope)?;
        discard_stray_output(&mut scope, "initialize");
        Ok(())
    }

    pub fn module(&self) -> &M {
        &self.module
    }

    pub fn trace_filter_mut(&mut self) -> &mut TraceFilter {
        &mut self.trace
    }

    pub fn dispatch(&mut self, request: &CallRequest) -> CallOutcome {
        self.trace.log_call(&request.id, &request.name, &request.args);

        let outcome = match Operation::resolve(&request.name, &request.args) {
            Ok(operation) => self.execute(operation),
            Err(failure) => CallOutcome::Failure(failure),
        };

        self.trace.log_return(&request.id, &request.name, &outcome);
        outcome
    }

    fn execute(&mut self, operation: Operation) -> CallOutcome {
        let mut scope = HostScope::default();
        let method = operation.method().name();

        let result = match operation {
            Operation::OpenDocument { path } => {
                with_utf8_arg(&mut self.module, &path, |module, ptr| {
                    module.open_document(&mut scope, ptr)
                })
                .map(|()| Ok(Value::Null))
            }
            Operation::GetPagePixmap { page } => self
                .module
                .get_page_pixmap(&mut scope, page)
                .map(|()| take_pixmap(&mut scope, page)),
            Operation::EvaluateExpression { expression } => {
                with_utf8_arg(&mut self.module, &expression, |module, ptr| {
                    module.evaluate(&mut scope, ptr)
                })
                .map(|()| Ok(Value::Null))
            }
        };

        let outcome = match result {
            Ok(Ok(value)) => CallOutcome::Success(value),
            Ok(Err(failure)) => CallOutcome::Failure(failure),
            Err(ModuleError::TryLater { resource }) => CallOutcome::Retry { resource },
            Err(err) => CallOutcome::Failure(err.into_failure()),
        };

        discard_stray_output(&mut scope, method);
        outcome
    }
}

fn take_pixmap(scope: &mut HostScope, page: i32) -> Result<Value, CallFailure> {
    if let Some(err) = scope.take_callback_error() {
        return Err(CallFailure::new(
            FailureKind::InvalidPixelBuffer,
            err.to_string(),
        ));
    }

    scope
        .take_pixel_buffer()
        .map(|buffer| buffer.to_json())
        .ok_or_else(|| {
            CallFailure::new(
                FailureKind::PixmapUnavailable,
                format!("module returned no pixel buffer for page {page}"),
            )
        })
}

fn discard_stray_output(scope: &mut HostScope, method: &str) {
    if let Some(buffer) = scope.take_pixel_buffer() {
        tracing::debug!(
            method,
            width = buffer.width(),
            height = buffer.height(),
            "discarding pixel buffer set outside getPagePixmap"
        );
    }
    if let Some(err) = scope.take_callback_error() {
        tracing::warn!(method, "host callback failed: {err}");
    }
}
