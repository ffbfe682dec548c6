pub mod bridge;
pub mod channel;
pub mod controller;
pub mod matchmaker;
pub mod queue;
pub mod scope;
pub mod timer;

pub use controller::{
    SessionController, SessionDeps, SessionEvent, SessionHandle, SessionSnapshot, StartOutcome,
};
