//! Engine side of the pool: adapters that launch conversions, the process
//! handle abstraction, and the supervisor that owns engine instances.

pub mod adapter;
pub mod process;
pub mod supervisor;

pub use adapter::{CommandAdapter, EngineAdapter, EngineRequest, LibreOfficeAdapter, SlotContext};
pub use process::{ChildProcess, ProcessExit, ProcessHandle};
pub use supervisor::{EngineInstance, EngineRun, InstanceStatus, Supervisor, SupervisorStats};
