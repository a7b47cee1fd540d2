pub mod event_queue;
pub mod rate_limiter;
pub mod task_manager;
pub mod worker;

pub use event_queue::EventQueue;
pub use rate_limiter::{Admission, LimitData, RateLimiter};
pub use task_manager::TaskManager;
pub use worker::NetworkWorker;
