use crate::error::ModuleError;
use crate::module::{HostScope, ModulePtr, NativeModule, SharedMemoryDescriptor};
use crate::protocol::{CallRequest, CorrelationId};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};

const MEMORY_BYTES: usize = 1 << 16;
const HEAP_START: u32 = 16;
const HEAP_END: u32 = 16_384;
const PIXMAP_AT: u32 = 16_384;

pub(crate) fn call(name: &str, id: i64, args: Value) -> CallRequest {
    let Value::Array(args) = args else {
        panic!("call args must be a json array");
    };

    CallRequest {
        name: name.to_string(),
        id: CorrelationId::from(id),
        args,
    }
}

/// In-memory stand-in for the compiled engine, with scripted behaviors.
pub(crate) struct ScriptedModule {
    memory: Vec<u8>,
    next_ptr: u32,
    live: BTreeSet<ModulePtr>,
    calls: Vec<String>,
    pixmap: Option<(u32, u32, u32)>,
    not_ready: HashMap<String, u32>,
    fail_init: bool,
    shared_memory: Option<SharedMemoryDescriptor>,
}

impl ScriptedModule {
    pub(crate) fn new() -> Self {
        Self {
            memory: vec![0; MEMORY_BYTES],
            next_ptr: HEAP_START,
            live: BTreeSet::new(),
            calls: Vec::new(),
            pixmap: None,
            not_ready: HashMap::new(),
            fail_init: false,
            shared_memory: None,
        }
    }

    pub(crate) fn with_pixmap(mut self, width: u32, height: u32) -> Self {
        self.pixmap = Some((width, height, width * height * 4));
        self
    }

    pub(crate) fn with_bad_pixmap(mut self) -> Self {
        self.pixmap = Some((10, 10, 399));
        self
    }

    /// `expression` reports not-ready `times` times before succeeding.
    pub(crate) fn not_ready(mut self, expression: &str, times: u32) -> Self {
        self.not_ready.insert(expression.to_string(), times);
        self
    }

    pub(crate) fn failing_init(mut self) -> Self {
        self.fail_init = true;
        self
    }

    pub(crate) fn with_shared_memory(mut self) -> Self {
        self.shared_memory = Some(SharedMemoryDescriptor {
            name: "vau-heap".to_string(),
            byte_length: MEMORY_BYTES,
        });
        self
    }

    pub(crate) fn calls(&self) -> &[String] {
        &self.calls
    }

    pub(crate) fn live_allocations(&self) -> usize {
        self.live.len()
    }

    pub(crate) fn read_c_string(&self, ptr: ModulePtr) -> String {
        let tail = &self.memory[ptr as usize..];
        let end = tail.iter().position(|byte| *byte == 0).unwrap_or(tail.len());
        String::from_utf8_lossy(&tail[..end]).into_owned()
    }
}

impl NativeModule for ScriptedModule {
    fn initialize(&mut self, scope: &mut HostScope) -> Result<(), ModuleError> {
        self.calls.push("initialize".to_string());
        if self.fail_init {
            return Err(ModuleError::trap("boot image missing"));
        }
        scope.log("Starting Vau");
        Ok(())
    }

    fn allocate(&mut self, size: u32) -> Result<ModulePtr, ModuleError> {
        let ptr = self.next_ptr;
        let end = ptr
            .checked_add(size)
            .filter(|end| *end <= HEAP_END)
            .ok_or(ModuleError::AllocationFailed(size))?;
        self.next_ptr = end;
        self.live.insert(ptr);
        Ok(ptr)
    }

    fn free(&mut self, ptr: ModulePtr) -> Result<(), ModuleError> {
        if self.live.remove(&ptr) {
            Ok(())
        } else {
            Err(ModuleError::trap(format!("double free of {ptr:#x}")))
        }
    }

    fn write_bytes(&mut self, ptr: ModulePtr, bytes: &[u8]) -> Result<(), ModuleError> {
        let start = ptr as usize;
        let region = self
            .memory
            .get_mut(start..start + bytes.len())
            .ok_or(ModuleError::OutOfBounds {
                ptr,
                len: bytes.len(),
            })?;
        region.copy_from_slice(bytes);
        Ok(())
    }

    fn open_document(&mut self, scope: &mut HostScope, name: ModulePtr) -> Result<(), ModuleError> {
        let name = self.read_c_string(name);
        scope.log(&format!("wasm_open_document {name}"));
        self.calls.push(format!("open_document:{name}"));
        Ok(())
    }

    fn get_page_pixmap(&mut self, scope: &mut HostScope, page: i32) -> Result<(), ModuleError> {
        self.calls.push(format!("get_page_pixmap:{page}"));
        if let Some((width, height, byte_length)) = self.pixmap {
            let start = PIXMAP_AT as usize;
            self.memory[start..start + byte_length as usize].fill(page as u8);
            scope.set_pixel_buffer(&self.memory, PIXMAP_AT, byte_length, width, height);
            self.memory[start..start + byte_length as usize].fill(0xAA);
        }
        Ok(())
    }

    fn evaluate(
        &mut self,
        _scope: &mut HostScope,
        expression: ModulePtr,
    ) -> Result<(), ModuleError> {
        let expression = self.read_c_string(expression);
        self.calls.push(format!("evaluate:{expression}"));

        if expression == "(trap)" {
            return Err(ModuleError::Trap {
                message: "unreachable executed".to_string(),
                trace: Some("0: wasm_eval".to_string()),
            });
        }

        if let Some(remaining) = self.not_ready.get_mut(&expression) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ModuleError::TryLater {
                    resource: expression,
                });
            }
        }

        Ok(())
    }

    fn shared_memory(&self) -> Option<SharedMemoryDescriptor> {
        self.shared_memory.clone()
    }
}
