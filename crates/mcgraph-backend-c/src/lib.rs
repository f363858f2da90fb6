//! Device that translates kernel programs to C, compiles them with the host C compiler and runs
//! them in-process.
//!
//! Buffers live in host memory. `build` generates one translation unit per program
//! ([`codegen::generate_c_module`]), compiles it into a shared library under the cache
//! directory and resolves one symbol per kernel. Libraries are keyed by a fingerprint of the
//! source and the compiler invocation, so identical programs reuse both the on-disk library
//! and the loaded handle.
//!
//! Environment:
//! - `CC`: compiler to invoke (default `cc`).
//! - `MCGRAPH_C_CACHE_DIR`: library cache (default `$TMPDIR/mcgraph_c_backend`).
//! - `MCGRAPH_C_KEEP_SOURCE`: keep the generated `.c` files next to the libraries.

pub mod codegen;

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use libloading::Library;
use lru::LruCache;
use mcgraph::device::registry::register_device_provider;
use mcgraph::device::{
    BindingRole, BoundBuffers, BufferId, Device, DeviceError, DeviceInfo, DeviceResult, HostHeap,
    KernelBindings, ModuleId,
};
use mcgraph::graph::KernelProgram;
use mcgraph::settings::parse_bool;
use tracing::{debug, info, warn};

pub use codegen::{generate_c_module, CModule, CodegenError};

const COMPILER_FLAGS: &[&str] = &["-O3", "-ffp-contract=off"];
const LOADED_LIBRARY_CAPACITY: usize = 32;

static TMP_SEQUENCE: AtomicU64 = AtomicU64::new(0);

type CKernel = unsafe extern "C" fn(*const KernelArgs) -> i32;

/// Mirrors `mcg_kernel_args` in the generated prelude, field for field.
#[repr(C)]
struct KernelArgs {
    input: *const f64,
    variates: *const f64,
    values: *mut f64,
    partials: *mut f64,
    results: *mut f64,
    basis: *mut f64,
    design: *mut f64,
    target: *mut f64,
    coeffs: *const f64,
    output: *mut f64,
}

impl KernelArgs {
    fn new(bound: &mut BoundBuffers) -> Self {
        Self {
            input: bound.as_mut_ptr(BindingRole::Input),
            variates: bound.as_mut_ptr(BindingRole::Variates),
            values: bound.as_mut_ptr(BindingRole::Values),
            partials: bound.as_mut_ptr(BindingRole::Partials),
            results: bound.as_mut_ptr(BindingRole::Results),
            basis: bound.as_mut_ptr(BindingRole::Basis),
            design: bound.as_mut_ptr(BindingRole::Design),
            target: bound.as_mut_ptr(BindingRole::Target),
            coeffs: bound.as_mut_ptr(BindingRole::Coeffs),
            output: bound.as_mut_ptr(BindingRole::Output),
        }
    }
}

struct CompiledModule {
    kernels: Vec<CKernel>,
    required: [(BindingRole, usize); 10],
    // Keeps the symbols in `kernels` mapped.
    _library: Library,
}

impl CompiledModule {
    fn check_bindings(&self, bound: &BoundBuffers) -> DeviceResult<()> {
        for (role, len) in self.required {
            if len > 0 {
                bound.require(role, len)?;
            }
        }
        Ok(())
    }
}

pub struct CJitDevice {
    compiler: String,
    cache_dir: PathBuf,
    keep_source: bool,
    heap: Mutex<HostHeap>,
    modules: Mutex<HashMap<ModuleId, Arc<CompiledModule>>>,
    compiled: Mutex<LruCache<u64, Arc<CompiledModule>>>,
    next_module: AtomicU64,
}

impl CJitDevice {
    /// Device configured from `CC`, `MCGRAPH_C_CACHE_DIR` and `MCGRAPH_C_KEEP_SOURCE`.
    pub fn new() -> Self {
        let cache_dir = std::env::var_os("MCGRAPH_C_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("mcgraph_c_backend"));
        Self::with_cache_dir(cache_dir)
    }

    pub fn with_cache_dir(cache_dir: impl Into<PathBuf>) -> Self {
        let capacity = NonZeroUsize::new(LOADED_LIBRARY_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            compiler: compiler(),
            cache_dir: cache_dir.into(),
            keep_source: std::env::var("MCGRAPH_C_KEEP_SOURCE")
                .map(|value| parse_bool(&value))
                .unwrap_or(false),
            heap: Mutex::new(HostHeap::new()),
            modules: Mutex::new(HashMap::new()),
            compiled: Mutex::new(LruCache::new(capacity)),
            next_module: AtomicU64::new(0),
        }
    }

    /// Whether the configured C compiler can be started.
    pub fn is_available() -> bool {
        Command::new(compiler())
            .arg("--version")
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn live_buffers(&self) -> usize {
        self.heap.lock().expect("host heap poisoned").live_buffers()
    }

    pub fn live_modules(&self) -> usize {
        self.modules.lock().expect("module table poisoned").len()
    }

    fn fingerprint(&self, source: &str) -> u64 {
        let mut hasher = DefaultHasher::new();
        source.hash(&mut hasher);
        self.compiler.hash(&mut hasher);
        COMPILER_FLAGS.hash(&mut hasher);
        hasher.finish()
    }

    fn get_or_compile(
        &self,
        module: &CModule,
        program: &KernelProgram,
    ) -> DeviceResult<Arc<CompiledModule>> {
        let fingerprint = self.fingerprint(&module.source);
        if let Some(found) = self
            .compiled
            .lock()
            .expect("compiled cache poisoned")
            .get(&fingerprint)
            .cloned()
        {
            debug!(fingerprint = %format!("{fingerprint:016x}"), "reusing loaded C module");
            return Ok(found);
        }

        std::fs::create_dir_all(&self.cache_dir)
            .map_err(|err| DeviceError::build(format!("{}: {err}", self.cache_dir.display())))?;
        let ext = lib_ext();
        let src_path = self.cache_dir.join(format!("program_{fingerprint:016x}.c"));
        let lib_path = self
            .cache_dir
            .join(format!("libmcgraph_c_{fingerprint:016x}{ext}"));

        if !lib_path.exists() {
            std::fs::write(&src_path, &module.source)
                .map_err(|err| DeviceError::build(format!("{}: {err}", src_path.display())))?;
            // A library only appears at `lib_path` once fully written.
            let tmp_path = self.cache_dir.join(format!(
                "libmcgraph_c_{fingerprint:016x}.{}-{}.tmp{ext}",
                std::process::id(),
                TMP_SEQUENCE.fetch_add(1, Ordering::Relaxed)
            ));
            let outcome = compile_c(&self.compiler, &src_path, &tmp_path)
                .and_then(|()| {
                    std::fs::rename(&tmp_path, &lib_path)
                        .map_err(|err| DeviceError::build(format!("{}: {err}", lib_path.display())))
                });
            if outcome.is_err() {
                let _ = std::fs::remove_file(&tmp_path);
            }
            if !self.keep_source {
                let _ = std::fs::remove_file(&src_path);
            }
            outcome?;
            info!(
                path = %lib_path.display(),
                kernels = module.entrypoints.len(),
                "compiled C module"
            );
        }

        let library = unsafe { Library::new(&lib_path) }
            .map_err(|err| DeviceError::build(format!("{}: {err}", lib_path.display())))?;
        let mut kernels = Vec::with_capacity(module.entrypoints.len());
        for entrypoint in &module.entrypoints {
            let kernel = unsafe {
                library
                    .get::<CKernel>(entrypoint.as_bytes())
                    .map(|symbol| *symbol)
            }
            .map_err(|err| DeviceError::build(format!("{entrypoint}: {err}")))?;
            kernels.push(kernel);
        }

        let compiled = Arc::new(CompiledModule {
            kernels,
            required: codegen::required_lengths(program),
            _library: library,
        });
        self.compiled
            .lock()
            .expect("compiled cache poisoned")
            .put(fingerprint, Arc::clone(&compiled));
        Ok(compiled)
    }
}

impl Default for CJitDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for CJitDevice {
    fn info(&self) -> DeviceInfo {
        let name = Path::new(&self.compiler)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.compiler.clone());
        DeviceInfo::new("CJit", None, name)
    }

    fn allocate(&self, len: usize) -> DeviceResult<BufferId> {
        Ok(self.heap.lock().expect("host heap poisoned").allocate(len))
    }

    fn release(&self, buffer: BufferId) -> DeviceResult<()> {
        self.heap.lock().expect("host heap poisoned").release(buffer)
    }

    fn upload(&self, buffer: BufferId, offset: usize, data: &[f64]) -> DeviceResult<()> {
        self.heap
            .lock()
            .expect("host heap poisoned")
            .upload(buffer, offset, data)
    }

    fn download(&self, buffer: BufferId, offset: usize, out: &mut [f64]) -> DeviceResult<()> {
        self.heap
            .lock()
            .expect("host heap poisoned")
            .download(buffer, offset, out)
    }

    fn copy(
        &self,
        src: BufferId,
        src_offset: usize,
        dst: BufferId,
        dst_offset: usize,
        len: usize,
    ) -> DeviceResult<()> {
        self.heap
            .lock()
            .expect("host heap poisoned")
            .copy(src, src_offset, dst, dst_offset, len)
    }

    fn build(&self, program: &Arc<KernelProgram>) -> DeviceResult<ModuleId> {
        let module = generate_c_module(program).map_err(|err| DeviceError::build(err.to_string()))?;
        let compiled = self.get_or_compile(&module, program)?;
        let id = ModuleId(self.next_module.fetch_add(1, Ordering::Relaxed) + 1);
        self.modules
            .lock()
            .expect("module table poisoned")
            .insert(id, compiled);
        Ok(id)
    }

    fn release_module(&self, module: ModuleId) -> DeviceResult<()> {
        self.modules
            .lock()
            .expect("module table poisoned")
            .remove(&module)
            .map(|_| ())
            .ok_or(DeviceError::UnknownModule(module))
    }

    fn launch(&self, module: ModuleId, kernel: usize, bindings: &KernelBindings) -> DeviceResult<()> {
        let compiled = self
            .modules
            .lock()
            .expect("module table poisoned")
            .get(&module)
            .cloned()
            .ok_or(DeviceError::UnknownModule(module))?;
        let entry = *compiled.kernels.get(kernel).ok_or_else(|| {
            DeviceError::execution(format!("{module} has no kernel {kernel}"))
        })?;

        let mut heap = self.heap.lock().expect("host heap poisoned");
        let mut bound = heap.bind(bindings)?;
        let result = compiled.check_bindings(&bound).and_then(|()| {
            let args = KernelArgs::new(&mut bound);
            // SAFETY: every buffer the kernel indexes is bound with at least the length the
            // program's layout requires, and stays out of the heap until the call returns.
            let status = unsafe { entry(&args) };
            if status == 0 {
                Ok(())
            } else {
                Err(DeviceError::execution(format!(
                    "{module} kernel {kernel} returned {status}"
                )))
            }
        });
        heap.unbind(bound);
        result
    }
}

fn compiler() -> String {
    std::env::var("CC").unwrap_or_else(|_| "cc".to_string())
}

fn lib_ext() -> &'static str {
    if cfg!(target_os = "macos") {
        ".dylib"
    } else if cfg!(target_os = "windows") {
        ".dll"
    } else {
        ".so"
    }
}

fn compile_c(compiler: &str, src: &Path, out: &Path) -> DeviceResult<()> {
    let mut cmd = Command::new(compiler);
    if cfg!(target_os = "macos") {
        cmd.arg("-dynamiclib");
    } else {
        cmd.arg("-shared").arg("-fPIC");
    }
    cmd.args(COMPILER_FLAGS);
    cmd.arg("-o").arg(out).arg(src);
    if !cfg!(target_os = "windows") {
        cmd.arg("-lm");
    }

    let output = cmd
        .output()
        .map_err(|err| DeviceError::build(format!("failed to start {compiler}: {err}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(DeviceError::build(format!("C compiler failed: {stderr}")));
    }
    Ok(())
}

/// Registers the `CJit` provider; it reports no device when the compiler is missing.
pub fn register_c_device() {
    register_device_provider("CJit", || {
        if CJitDevice::is_available() {
            vec![Arc::new(CJitDevice::new()) as Arc<dyn Device>]
        } else {
            warn!(compiler = %compiler(), "C compiler unavailable, CJit device disabled");
            Vec::new()
        }
    });
}

#[cfg(target_os = "linux")]
#[used]
#[link_section = ".init_array"]
static REGISTER_C_DEVICE: extern "C" fn() = {
    extern "C" fn register() {
        register_c_device();
    }
    register
};
