//! Sequent: a per-thread, prioritized task-sequencing core.
//!
//! A [`SequenceManager`] owns a set of [`TaskQueue`]s. Tasks may be posted
//! from any thread through [`TaskRunner`] handles, but every task executes
//! on the one thread the manager is bound to. The core guarantees, all at
//! once:
//!
//! - FIFO order within a queue and strict priority order across queues,
//!   mediated by a globally monotonic enqueue order;
//! - delayed tasks that never run before their deadline yet merge into the
//!   same FIFO discipline as immediate tasks;
//! - fences that hide a queue's tasks mid-flight and restore their original
//!   order on removal;
//! - lazy reclamation of cancelled tasks without scans on the hot path;
//! - safety against self-destruction: a running task may drop its own
//!   queue, timer, or the manager itself.
//!
//! # Quick start
//!
//! ```
//! use sequent::{Location, SequenceManager, TaskQueueSpec, TaskType};
//!
//! let manager = SequenceManager::new();
//! let queue = manager.create_task_queue(TaskQueueSpec::new("example"));
//! let runner = queue.create_task_runner(TaskType::DEFAULT);
//!
//! runner.post_task(Location::caller(), || println!("hello from the loop"));
//! manager.run_until_idle();
//! ```
//!
//! # Module map
//!
//! - [`manager`]: the [`SequenceManager`] work loop and queue ownership
//! - [`queue`]: task queues, work queues, the delayed heap, selection sets
//! - [`runner`]: posting handles and the guarded posting path
//! - [`time`] / [`time_domain`]: clocks, wake-ups and delay ordering
//! - [`timer`]: one-shot, repeating and retaining timers
//! - [`controller`]: the seam to the thread's wake/park primitive
//! - [`observability`]: structured lifecycle logging
//! - [`test_logging`]: the typed event logger used by the test suites

pub mod controller;
pub mod error;
pub mod manager;
pub mod observability;
pub mod queue;
pub mod runner;
pub mod task;
pub mod test_logging;
pub mod time;
pub mod time_domain;
pub mod timer;
pub mod types;

pub(crate) mod util;

pub use controller::{ParkingController, RecordingController, ThreadController};
pub use error::{Error, ErrorKind, Result};
pub use manager::{SequenceManager, SequenceManagerBuilder, SequenceManagerHandle};
pub use queue::task_queue::{
    InsertFencePosition, OnTaskPostedHandler, QueueObserver, TaskObserver, TaskQueue,
    TaskQueueSpec,
};
pub use runner::{TaskRunner, TaskRunnerSet};
pub use task::{Callback, Location, Nestable, PostedTask, Task, TaskType};
pub use time::{
    LazyNow, MonotonicClock, TestTickClock, TickClock, TimeTicks, WakeUp, WakeUpResolution,
};
pub use time_domain::TimeDomain;
pub use timer::{OneShotTimer, RepeatingTimer, RetainingOneShotTimer};
pub use types::{EnqueueOrder, QueueId, QueuePriority};
