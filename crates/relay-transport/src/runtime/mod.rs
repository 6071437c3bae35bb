//! Threads, timers and completion handles.

pub mod executor;
pub mod future;
pub mod idle_tracker;
pub mod pool;
pub mod worker;

pub use executor::SerialExecutor;
pub use future::{
    promise, BindFuture, CloseFuture, ConnectFuture, OpFuture, Promise, UnbindFuture, WriteFuture,
};
pub use idle_tracker::IdleTracker;
pub use pool::{AffinityPool, WorkerLease};
pub use worker::{WorkerContext, WorkerHandle, WorkerStopped, WorkerThread};
