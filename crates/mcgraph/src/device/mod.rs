//! Device abstraction the compute context programs against.
//!
//! A device owns flat `f64` buffers addressed by [`BufferId`] and compiled modules addressed by
//! [`ModuleId`]. Modules are built from a lowered [`KernelProgram`]; each kernel inside a module
//! is launched by index with a [`KernelBindings`] table that names the buffers it reads and
//! writes. All calls for one calculation are issued from a single thread, in order.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::graph::KernelProgram;

pub mod host;
pub mod registry;

pub use host::{BoundBuffers, HostHeap};

/// Handle to one device buffer of `f64` elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BufferId(pub u64);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buffer#{}", self.0)
    }
}

/// Handle to one compiled module (the kernels of a single program).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModuleId(pub u64);

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "module#{}", self.0)
    }
}

/// Failure reported by a device implementation.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("{op} is not implemented: {reason}")]
    Unimplemented { op: &'static str, reason: String },

    #[error("unknown {0}")]
    UnknownBuffer(BufferId),

    #[error("unknown {0}")]
    UnknownModule(ModuleId),

    #[error("{buffer} holds {len} elements, access needs {required}")]
    OutOfBounds {
        buffer: BufferId,
        len: usize,
        required: usize,
    },

    #[error("program build failed: {message}")]
    Build { message: String },

    #[error("device execution failure: {message}")]
    Execution { message: String },
}

impl DeviceError {
    pub fn unimplemented(op: &'static str, reason: impl Into<String>) -> Self {
        DeviceError::Unimplemented {
            op,
            reason: reason.into(),
        }
    }

    pub fn build(message: impl Into<String>) -> Self {
        DeviceError::Build {
            message: message.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        DeviceError::Execution {
            message: message.into(),
        }
    }
}

/// Convenience alias for results returned by device routines.
pub type DeviceResult<T> = Result<T, DeviceError>;

/// Identity of a device as listed by the framework.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub backend: String,
    /// Hardware index; `None` for devices without one.
    pub index: Option<usize>,
    pub name: String,
}

impl DeviceInfo {
    pub fn new(backend: impl Into<String>, index: Option<usize>, name: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            index,
            name: name.into(),
        }
    }

    /// `<backend>/<index-or-DEFAULT>/<name>`.
    pub fn identifier(&self) -> String {
        match self.index {
            Some(index) => format!("{}/{}/{}", self.backend, index, self.name),
            None => format!("{}/DEFAULT/{}", self.backend, self.name),
        }
    }
}

/// Buffers bound to one kernel launch. Unused roles stay `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelBindings {
    pub input: Option<BufferId>,
    pub variates: Option<BufferId>,
    pub values: Option<BufferId>,
    pub partials: Option<BufferId>,
    pub results: Option<BufferId>,
    pub basis: Option<BufferId>,
    pub design: Option<BufferId>,
    pub target: Option<BufferId>,
    pub coeffs: Option<BufferId>,
    pub output: Option<BufferId>,
}

/// Buffer role inside a launch, in the order backends marshal bindings positionally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingRole {
    Input,
    Variates,
    Values,
    Partials,
    Results,
    Basis,
    Design,
    Target,
    Coeffs,
    Output,
}

impl BindingRole {
    pub const ALL: [BindingRole; 10] = [
        BindingRole::Input,
        BindingRole::Variates,
        BindingRole::Values,
        BindingRole::Partials,
        BindingRole::Results,
        BindingRole::Basis,
        BindingRole::Design,
        BindingRole::Target,
        BindingRole::Coeffs,
        BindingRole::Output,
    ];

    pub fn name(self) -> &'static str {
        match self {
            BindingRole::Input => "input",
            BindingRole::Variates => "variates",
            BindingRole::Values => "values",
            BindingRole::Partials => "partials",
            BindingRole::Results => "results",
            BindingRole::Basis => "basis",
            BindingRole::Design => "design",
            BindingRole::Target => "target",
            BindingRole::Coeffs => "coeffs",
            BindingRole::Output => "output",
        }
    }
}

impl KernelBindings {
    pub fn get(&self, role: BindingRole) -> Option<BufferId> {
        match role {
            BindingRole::Input => self.input,
            BindingRole::Variates => self.variates,
            BindingRole::Values => self.values,
            BindingRole::Partials => self.partials,
            BindingRole::Results => self.results,
            BindingRole::Basis => self.basis,
            BindingRole::Design => self.design,
            BindingRole::Target => self.target,
            BindingRole::Coeffs => self.coeffs,
            BindingRole::Output => self.output,
        }
    }
}

/// Data-parallel device able to run lowered kernel programs.
pub trait Device: Send + Sync {
    fn info(&self) -> DeviceInfo;

    /// Allocates a zero-initialised buffer of `len` elements.
    fn allocate(&self, len: usize) -> DeviceResult<BufferId>;

    fn release(&self, buffer: BufferId) -> DeviceResult<()>;

    fn upload(&self, buffer: BufferId, offset: usize, data: &[f64]) -> DeviceResult<()>;

    fn download(&self, buffer: BufferId, offset: usize, out: &mut [f64]) -> DeviceResult<()>;

    /// Device-to-device copy of `len` elements.
    fn copy(
        &self,
        src: BufferId,
        src_offset: usize,
        dst: BufferId,
        dst_offset: usize,
        len: usize,
    ) -> DeviceResult<()>;

    /// Compiles every kernel of `program` into one module.
    fn build(&self, program: &Arc<KernelProgram>) -> DeviceResult<ModuleId>;

    fn release_module(&self, module: ModuleId) -> DeviceResult<()>;

    /// Runs kernel `kernel` of `module` to completion.
    fn launch(&self, module: ModuleId, kernel: usize, bindings: &KernelBindings)
        -> DeviceResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_uses_default_without_index() {
        assert_eq!(
            DeviceInfo::new("RefCpu", None, "Host").identifier(),
            "RefCpu/DEFAULT/Host"
        );
        assert_eq!(
            DeviceInfo::new("OpenCL", Some(1), "Tesla").identifier(),
            "OpenCL/1/Tesla"
        );
    }

    #[test]
    fn bindings_are_looked_up_by_role() {
        let bindings = KernelBindings {
            coeffs: Some(BufferId(7)),
            ..KernelBindings::default()
        };
        assert_eq!(bindings.get(BindingRole::Coeffs), Some(BufferId(7)));
        assert_eq!(bindings.get(BindingRole::Design), None);
        assert_eq!(BindingRole::ALL[9].name(), "output");
    }

    #[test]
    fn device_error_messages_name_the_failure() {
        let err = DeviceError::OutOfBounds {
            buffer: BufferId(3),
            len: 4,
            required: 8,
        };
        assert_eq!(err.to_string(), "buffer#3 holds 4 elements, access needs 8");
        assert_eq!(
            DeviceError::execution("boom").to_string(),
            "device execution failure: boom"
        );
    }
}
