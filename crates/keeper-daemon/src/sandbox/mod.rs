mod local;
mod supervisor;

pub use local::LocalSandbox;
pub use supervisor::HandleSupervisor;
