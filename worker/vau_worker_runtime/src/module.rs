use crate::error::{HostCallbackError, ModuleError};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;
use serde_json::{Value, json};

pub type ModulePtr = u32;

const RGBA_CHANNELS: u64 = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedMemoryDescriptor {
    pub name: String,
    pub byte_length: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostCapabilities {
    pub shared_memory: bool,
    pub isolated: bool,
}

pub trait NativeModule {
    fn initialize(&mut self, scope: &mut HostScope) -> Result<(), ModuleError>;

    fn allocate(&mut self, size: u32) -> Result<ModulePtr, ModuleError>;

    fn free(&mut self, ptr: ModulePtr) -> Result<(), ModuleError>;

    fn write_bytes(&mut self, ptr: ModulePtr, bytes: &[u8]) -> Result<(), ModuleError>;

    fn open_document(&mut self, scope: &mut HostScope, name: ModulePtr) -> Result<(), ModuleError>;

    fn get_page_pixmap(&mut self, scope: &mut HostScope, page: i32) -> Result<(), ModuleError>;

    fn evaluate(
        &mut self,
        scope: &mut HostScope,
        expression: ModulePtr,
    ) -> Result<(), ModuleError>;

    fn shared_memory(&self) -> Option<SharedMemoryDescriptor> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl PixelBuffer {
    pub fn copy_from(
        memory: &[u8],
        ptr: ModulePtr,
        byte_length: u32,
        width: u32,
        height: u32,
    ) -> Result<Self, HostCallbackError> {
        let expected = u64::from(width) * u64::from(height) * RGBA_CHANNELS;
        if u64::from(byte_length) != expected {
            return Err(HostCallbackError::SizeMismatch {
                byte_length,
                width,
                height,
            });
        }

        let start = ptr as usize;
        let region = start
            .checked_add(byte_length as usize)
            .and_then(|end| memory.get(start..end))
            .ok_or(HostCallbackError::OutOfBounds {
                ptr,
                byte_length,
                memory_len: memory.len(),
            })?;

        Ok(Self {
            width,
            height,
            data: region.to_vec(),
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn byte_length(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn to_json(&self) -> Value {
        json!({
            "width": self.width,
            "height": self.height,
            "byteLength": self.data.len(),
            "data": STANDARD.encode(&self.data),
        })
    }
}

/// Per-call state the module's host hooks write into.
#[derive(Debug, Default)]
pub struct HostScope {
    pixel_buffer: Option<PixelBuffer>,
    callback_error: Option<HostCallbackError>,
    pending_resource: Option<String>,
}

impl HostScope {
    pub fn log(&mut self, message: &str) {
        tracing::info!(target: "vau::module", "{message}");
    }

    // A later buffer replaces an earlier one.
    pub fn set_pixel_buffer(
        &mut self,
        memory: &[u8],
        ptr: ModulePtr,
        byte_length: u32,
        width: u32,
        height: u32,
    ) {
        match PixelBuffer::copy_from(memory, ptr, byte_length, width, height) {
            Ok(buffer) => {
                tracing::trace!(width, height, byte_length, "pixel buffer received");
                self.pixel_buffer = Some(buffer);
            }
            Err(err) => {
                tracing::warn!("rejected pixel buffer: {err}");
                self.callback_error = Some(err);
            }
        }
    }

    pub fn try_later(&mut self, resource: &str) {
        self.pending_resource = Some(resource.to_string());
    }

    pub fn take_pixel_buffer(&mut self) -> Option<PixelBuffer> {
        self.pixel_buffer.take()
    }

    pub fn take_callback_error(&mut self) -> Option<HostCallbackError> {
        self.callback_error.take()
    }

    pub fn take_pending_resource(&mut self) -> Option<String> {
        self.pending_resource.take()
    }
}

/// Passes `value` to `call` as a NUL-terminated string in module memory,
/// freeing it afterwards even on error.
pub fn with_utf8_arg<M, T>(
    module: &mut M,
    value: &str,
    call: impl FnOnce(&mut M, ModulePtr) -> Result<T, ModuleError>,
) -> Result<T, ModuleError>
where
    M: NativeModule + ?Sized,
{
    let mut bytes = Vec::with_capacity(value.len() + 1);
    bytes.extend_from_slice(value.as_bytes());
    bytes.push(0);

    let size = u32::try_from(bytes.len()).map_err(|_| ModuleError::AllocationFailed(u32::MAX))?;
    let ptr = module.allocate(size)?;

    let result = module
        .write_bytes(ptr, &bytes)
        .and_then(|()| call(module, ptr));

    match (result, module.free(ptr)) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(err)) => Err(err),
        (Err(err), free_result) => {
            if let Err(free_err) = free_result {
                tracing::warn!(ptr, "failed to free argument after call error: {free_err}");
            }
            Err(err)
        }
    }
}
