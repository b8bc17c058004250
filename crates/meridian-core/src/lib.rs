//! Cross-channel infrastructure for the Meridian host.
//!
//! Everything here is shared by all worker channels: the in-process
//! [`MessageBus`] carrying protocol messages between channels and worker
//! transports, [`ProcessSupervisor`] for launching worker processes, and
//! the [`SharedMemoryManager`] / [`FunctionDataCache`] pair backing
//! out-of-band payload transfer.

mod bus;
mod error;
mod process;
mod shmem;

pub use bus::{BusEvent, Direction, MessageBus, Subscription};
pub use error::{CoreError, Result};
pub use process::{
    OsProcessSupervisor, OsWorkerProcess, ProcessSupervisor, WorkerDescription, WorkerProcess,
};
pub use shmem::{FunctionDataCache, SharedMemoryManager, DEFAULT_TRANSFER_THRESHOLD};
