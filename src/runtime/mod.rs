pub mod catch;
pub mod frame;
pub mod registry;
pub mod value;
pub mod vm;
pub mod vm_error;

pub use value::Value;
pub use vm::{RunState, Vm, VmConfig};
pub use vm_error::VmError;
