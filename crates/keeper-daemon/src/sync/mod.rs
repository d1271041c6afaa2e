mod engine;
mod layout;
mod lock;
mod restore;

pub use engine::{SyncEngine, SyncOutcome, SyncTrigger};
pub use layout::{Layout, TrackedTree};
