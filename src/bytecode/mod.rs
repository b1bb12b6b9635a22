pub mod builder;
pub mod codec;
pub mod disasm;
pub mod irep;
pub mod load;
pub mod load_error;
pub mod op;
pub mod verify;

pub use irep::{CatchHandler, CatchKind, Irep, IrepArena, IrepId, SymId};
pub use load_error::LoadError;
pub use op::Op;
