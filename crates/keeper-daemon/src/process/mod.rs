mod lifecycle;
mod outcome;

pub use lifecycle::{GatewaySpec, ProcessLifecycle};
pub use outcome::KeywordSuccess;
