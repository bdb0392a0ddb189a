pub mod bus;
pub mod types;

pub use crate::bus::{EventBus, Subscription};
pub use crate::types::EventRecord;
