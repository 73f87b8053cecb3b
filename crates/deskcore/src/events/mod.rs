// crates/deskcore/src/events/mod.rs

mod bus;

pub use bus::{CallId, EventBus, EventEmitter, TaskEvent};
