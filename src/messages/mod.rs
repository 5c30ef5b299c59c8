pub mod codec;
pub mod types;

pub use codec::Message;
pub use types::{
    EPStatusReport, ErrorDetails, GlobalState, QueueMessage, Task, TaskResult, TaskState,
    TaskTransition,
};
