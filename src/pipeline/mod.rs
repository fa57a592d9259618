//! One stage transition per invocation: claim, run the handler, persist, release.

pub mod dispatcher;
pub mod handlers;
pub mod lock;
pub mod retry;
pub mod validation;

pub use dispatcher::{StepDispatcher, StepOutcome, StepReport};
pub use handlers::StageHandlers;
pub use lock::{LockManager, WorkerId};
pub use retry::{Classification, RetryPolicy};
