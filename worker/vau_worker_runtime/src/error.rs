use serde::Serialize;
use std::fmt;
use std::io;

/// Classifier carried in the `kind` field of an `ERROR` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureKind {
    UnknownMethod,
    InvalidArguments,
    ModuleTrap,
    MissingExport,
    MemoryAccess,
    InvalidPixelBuffer,
    PixmapUnavailable,
    RetryLimitExceeded,
    StartupError,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::UnknownMethod => "UnknownMethod",
            FailureKind::InvalidArguments => "InvalidArguments",
            FailureKind::ModuleTrap => "ModuleTrap",
            FailureKind::MissingExport => "MissingExport",
            FailureKind::MemoryAccess => "MemoryAccess",
            FailureKind::InvalidPixelBuffer => "InvalidPixelBuffer",
            FailureKind::PixmapUnavailable => "PixmapUnavailable",
            FailureKind::RetryLimitExceeded => "RetryLimitExceeded",
            FailureKind::StartupError => "StartupError",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error payload sent back to the caller as `{kind, message, trace}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallFailure {
    pub kind: FailureKind,
    pub message: String,
    pub trace: Option<String>,
}

impl CallFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            trace: None,
        }
    }

    pub fn with_trace(mut self, trace: Option<String>) -> Self {
        self.trace = trace;
        self
    }

    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        Self::new(FailureKind::InvalidArguments, message)
    }
}

impl fmt::Display for CallFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ModuleError {
    #[error("not ready yet: waiting on `{resource}`")]
    TryLater { resource: String },

    #[error("module trapped: {message}")]
    Trap {
        message: String,
        trace: Option<String>,
    },

    #[error("module does not export `{0}`")]
    MissingExport(String),

    #[error("module memory access out of bounds: ptr={ptr:#x} len={len}")]
    OutOfBounds { ptr: u32, len: usize },

    #[error("module failed to allocate {0} bytes")]
    AllocationFailed(u32),

    #[error("failed to load module: {0}")]
    Load(String),
}

impl ModuleError {
    pub fn trap(message: impl Into<String>) -> Self {
        ModuleError::Trap {
            message: message.into(),
            trace: None,
        }
    }

    /// Converts a module-level failure into the caller-visible payload.
    ///
    /// `TryLater` never reaches the caller; the dispatcher intercepts it first.
    pub fn into_failure(self) -> CallFailure {
        let kind = match &self {
            ModuleError::Trap { .. } | ModuleError::TryLater { .. } => FailureKind::ModuleTrap,
            ModuleError::MissingExport(_) => FailureKind::MissingExport,
            ModuleError::OutOfBounds { .. } | ModuleError::AllocationFailed(_) => {
                FailureKind::MemoryAccess
            }
            ModuleError::Load(_) => FailureKind::StartupError,
        };
        let message = self.to_string();
        let trace = match self {
            ModuleError::Trap { trace, .. } => trace,
            _ => None,
        };

        CallFailure::new(kind, message).with_trace(trace)
    }
}

/// Raised by the host hooks while the module is executing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HostCallbackError {
    #[error("pixel buffer at {ptr:#x}+{byte_length} lies outside module memory ({memory_len} bytes)")]
    OutOfBounds {
        ptr: u32,
        byte_length: u32,
        memory_len: usize,
    },

    #[error("pixel buffer of {byte_length} bytes does not match {width}x{height} RGBA")]
    SizeMismatch {
        byte_length: u32,
        width: u32,
        height: u32,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("response channel closed")]
    ResponseChannelClosed,

    #[error("bridge failed to start: {0}")]
    Startup(String),

    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{0} thread panicked")]
    ThreadPanicked(&'static str),
}
