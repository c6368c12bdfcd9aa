use std::path::Path;
use vau_worker_runtime::{HostScope, ModuleError, ModulePtr, NativeModule};
use wasmtime::{Caller, Engine, Instance, Linker, Memory, Module, Store, TypedFunc};

const HOST_MODULE: &str = "env";

struct Exports {
    init: TypedFunc<(), ()>,
    open_document: TypedFunc<i32, ()>,
    get_page_pixmap: TypedFunc<i32, ()>,
    eval: TypedFunc<i32, ()>,
    malloc: TypedFunc<i32, i32>,
    free: TypedFunc<i32, ()>,
}

impl Exports {
    fn resolve(store: &mut Store<HostScope>, instance: &Instance) -> Result<Self, ModuleError> {
        Ok(Self {
            init: typed_export(store, instance, "wasm_init_vau")?,
            open_document: typed_export(store, instance, "wasm_open_document")?,
            get_page_pixmap: typed_export(store, instance, "wasm_get_page_pixmap")?,
            eval: typed_export(store, instance, "wasm_eval")?,
            malloc: typed_export(store, instance, "malloc")?,
            free: typed_export(store, instance, "free")?,
        })
    }
}

/// The typesetting engine compiled to wasm, driven through wasmtime.
///
/// The store's data slot holds the [`HostScope`] of the call in flight so the
/// imported host functions can reach it.
pub struct WasmModule {
    store: Store<HostScope>,
    memory: Memory,
    exports: Exports,
}

impl WasmModule {
    pub fn load(path: &Path) -> Result<Self, ModuleError> {
        let bytes = std::fs::read(path).map_err(|err| {
            ModuleError::Load(format!(
                "failed to read {}: {err}. This likely indicates that Vau wasn't compiled to wasm.",
                path.display()
            ))
        })?;
        tracing::debug!(path = %path.display(), bytes = bytes.len(), "loading module");
        Self::from_binary(&bytes)
    }

    /// Accepts a wasm binary, or WAT text.
    pub fn from_binary(bytes: &[u8]) -> Result<Self, ModuleError> {
        let engine = Engine::default();
        let module = Module::new(&engine, bytes).map_err(load_error)?;

        let mut linker = Linker::new(&engine);
        define_host_functions(&mut linker).map_err(load_error)?;

        let mut store = Store::new(&engine, HostScope::default());
        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(load_error)?;

        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| ModuleError::MissingExport("memory".to_string()))?;
        let exports = Exports::resolve(&mut store, &instance)?;

        Ok(Self {
            store,
            memory,
            exports,
        })
    }

    fn call_in_scope<P, R>(
        &mut self,
        scope: &mut HostScope,
        func: TypedFunc<P, R>,
        params: P,
    ) -> Result<R, ModuleError>
    where
        P: wasmtime::WasmParams,
        R: wasmtime::WasmResults,
    {
        std::mem::swap(self.store.data_mut(), scope);
        let result = func.call(&mut self.store, params);
        std::mem::swap(self.store.data_mut(), scope);

        let value = result.map_err(trap_error)?;
        match scope.take_pending_resource() {
            Some(resource) => Err(ModuleError::TryLater { resource }),
            None => Ok(value),
        }
    }
}

impl NativeModule for WasmModule {
    fn initialize(&mut self, scope: &mut HostScope) -> Result<(), ModuleError> {
        let init = self.exports.init.clone();
        self.call_in_scope(scope, init, ())
    }

    fn allocate(&mut self, size: u32) -> Result<ModulePtr, ModuleError> {
        let malloc = self.exports.malloc.clone();
        let size_arg = i32::try_from(size).map_err(|_| ModuleError::AllocationFailed(size))?;
        let ptr = malloc
            .call(&mut self.store, size_arg)
            .map_err(trap_error)?;

        if ptr == 0 {
            return Err(ModuleError::AllocationFailed(size));
        }
        Ok(ptr as ModulePtr)
    }

    fn free(&mut self, ptr: ModulePtr) -> Result<(), ModuleError> {
        let free = self.exports.free.clone();
        free.call(&mut self.store, ptr as i32).map_err(trap_error)
    }

    fn write_bytes(&mut self, ptr: ModulePtr, bytes: &[u8]) -> Result<(), ModuleError> {
        self.memory
            .write(&mut self.store, ptr as usize, bytes)
            .map_err(|_| ModuleError::OutOfBounds {
                ptr,
                len: bytes.len(),
            })
    }

    fn open_document(&mut self, scope: &mut HostScope, name: ModulePtr) -> Result<(), ModuleError> {
        let open_document = self.exports.open_document.clone();
        self.call_in_scope(scope, open_document, name as i32)
    }

    fn get_page_pixmap(&mut self, scope: &mut HostScope, page: i32) -> Result<(), ModuleError> {
        let get_page_pixmap = self.exports.get_page_pixmap.clone();
        self.call_in_scope(scope, get_page_pixmap, page)
    }

    fn evaluate(
        &mut self,
        scope: &mut HostScope,
        expression: ModulePtr,
    ) -> Result<(), ModuleError> {
        let eval = self.exports.eval.clone();
        self.call_in_scope(scope, eval, expression as i32)
    }
}

fn define_host_functions(linker: &mut Linker<HostScope>) -> wasmtime::Result<()> {
    linker.func_wrap(
        HOST_MODULE,
        "vaujs_alert",
        |mut caller: Caller<'_, HostScope>, ptr: i32| {
            let message = read_c_string(&mut caller, ptr).unwrap_or_default();
            caller.data_mut().log(&format!("ALERT {message}"));
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "vaujs_set_pixmap",
        |mut caller: Caller<'_, HostScope>, ptr: i32, size: i32, width: i32, height: i32| {
            let Some(memory) = exported_memory(&mut caller) else {
                tracing::warn!("vaujs_set_pixmap called but module exports no memory");
                return;
            };
            let (data, scope) = memory.data_and_store_mut(&mut caller);
            scope.set_pixel_buffer(data, ptr as u32, size as u32, width as u32, height as u32);
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "vaujs_try_later",
        |mut caller: Caller<'_, HostScope>, ptr: i32| {
            let resource = read_c_string(&mut caller, ptr).unwrap_or_default();
            caller.data_mut().try_later(&resource);
        },
    )?;

    Ok(())
}

fn typed_export<P, R>(
    store: &mut Store<HostScope>,
    instance: &Instance,
    name: &str,
) -> Result<TypedFunc<P, R>, ModuleError>
where
    P: wasmtime::WasmParams,
    R: wasmtime::WasmResults,
{
    let func = instance
        .get_func(&mut *store, name)
        .ok_or_else(|| ModuleError::MissingExport(name.to_string()))?;
    func.typed::<P, R>(&*store)
        .map_err(|err| ModuleError::Load(format!("export `{name}` has the wrong signature: {err}")))
}

fn exported_memory(caller: &mut Caller<'_, HostScope>) -> Option<Memory> {
    caller.get_export("memory")?.into_memory()
}

fn read_c_string(caller: &mut Caller<'_, HostScope>, ptr: i32) -> Option<String> {
    let memory = exported_memory(caller)?;
    let data = memory.data(&*caller);
    let tail = data.get(usize::try_from(ptr).ok()?..)?;
    let end = tail.iter().position(|byte| *byte == 0).unwrap_or(tail.len());
    Some(String::from_utf8_lossy(&tail[..end]).into_owned())
}

fn load_error(err: wasmtime::Error) -> ModuleError {
    ModuleError::Load(format!("{err:#}"))
}

fn trap_error(err: wasmtime::Error) -> ModuleError {
    ModuleError::Trap {
        message: format!("{err:#}"),
        trace: Some(format!("{err:?}")),
    }
}
