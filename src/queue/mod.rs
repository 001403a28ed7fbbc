//! Task queues and their supporting structures.
//!
//! - [`work_queue`]: the single-priority FIFO with a fence, two per queue
//! - [`delayed_incoming`]: the min-heap of not-yet-due delayed tasks
//! - [`sets`]: per-priority-band indexing of ready work queues
//! - [`task_queue`]: the user-visible [`TaskQueue`](task_queue::TaskQueue)

pub mod delayed_incoming;
pub mod sets;
pub mod task_queue;
pub mod work_queue;

pub use task_queue::{QueueObserver, TaskObserver, TaskQueue, TaskQueueSpec};
pub use work_queue::WorkQueueKind;
