//! The four execution backends — sequential, thread-parallel, task-parallel,
//! distributed — and the lifecycle state machine they all share.

pub mod distributed;
pub mod sequential;
pub mod state;
pub mod task;
pub mod thread;
pub mod tsm;

pub use distributed::{DistributedEngine, GhostCell, GhostStore, WorkingInterval};
pub use sequential::SequentialEngine;
pub use state::{EngineState, Lifecycle};
pub use task::{GroupedOctreeResult, TaskParallelEngine};
pub use thread::ThreadParallelEngine;
pub use tsm::TsmEngine;
