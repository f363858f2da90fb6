pub mod context;
pub mod debug;
pub mod device;
pub mod error;
pub mod framework;
pub mod graph;
pub mod ir;
pub mod memory;
pub mod numeric;
pub mod reference;
pub mod regression;
pub mod rng;
pub mod settings;

pub use context::{ComputeContext, ComputeState};
pub use debug::DebugInfo;
pub use device::{Device, DeviceError, DeviceInfo, DeviceResult};
pub use error::{ComputeError, ComputeResult};
pub use framework::ComputeFramework;
pub use ir::{OpCode, VariableId};
pub use reference::{InputValue, Recording};
pub use settings::{Precision, Settings};
