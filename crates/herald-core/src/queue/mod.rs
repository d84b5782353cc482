//! Queue module: the in-memory wait list and the storage retry policy.

mod retry;
mod wait_list;

pub use retry::RetryPolicy;
pub use wait_list::WaitList;
