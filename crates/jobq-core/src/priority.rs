use serde::{Deserialize, Serialize};
use std::fmt;

/// Priority of a job within its queue.
/// Higher values are popped first; equal priorities pop in put order.
/// Priority never applies across queues.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(i32);

impl Priority {
    /// Priority given to jobs put without one
    pub const NORMAL: Priority = Priority(0);

    /// Create a new priority value
    pub fn new(value: i32) -> Self {
        Priority(value)
    }

    /// Get the raw priority value
    pub fn value(&self) -> i32 {
        self.0
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i32> for Priority {
    fn from(value: i32) -> Self {
        Priority(value)
    }
}

impl From<Priority> for i32 {
    fn from(priority: Priority) -> Self {
        priority.0
    }
}
