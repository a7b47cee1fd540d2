pub mod backend;
pub mod batch;
pub mod context;
pub mod manager;

pub use backend::{BackendFuture, HttpBackend, PreparedRequest, ReqwestBackend};
pub use batch::{BatchCallback, BatchRequestHandler};
pub use context::HttpCallback;
pub use manager::{HttpOptions, HttpRequestManager};
