//! One-to-one call establishment: the call state machine, the engine that
//! drives it over signaling and media, and the handle applications use.

pub mod config;
mod engine;
pub mod error;
pub mod machine;
pub mod session;
mod surface;

pub use config::CallSettings;
pub use engine::CallSnapshot;
pub use error::CallError;
pub use machine::{BUSY, Context, Effect, NO_ANSWER, REJECTED_BY_TARGET, Transition, Trigger, transition};
pub use session::{CallSession, CallStatus};
pub use surface::CallHandle;
