pub mod call_channel;

pub use call_channel::{CallEvent, EndReason};
