//! The build queue: a bounded-concurrency dispatcher that runs at most one
//! job per build identity and multiplexes the outcome to every waiter.

pub mod queue;

pub use queue::{
    BuildOutcome, BuildQueue, BuildRunner, QueueTaskStatus, StageTracker, WaitHandle,
};
