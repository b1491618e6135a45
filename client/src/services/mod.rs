pub mod call_service;
pub mod session_service;

pub use call_service::{CallController, CallDeps};
