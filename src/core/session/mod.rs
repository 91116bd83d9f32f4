//! Session coordination: the state machine, its event vocabulary and the
//! single event loop that owns every piece of session state.

pub mod coordinator;
pub mod events;
pub mod state;

pub use coordinator::Coordinator;
pub use events::{inbox, Command, LinkEvent, Notice, RelayEvent, SessionEvent, SessionHandle, SessionUpdate};
pub use state::{Phase, Role, Session, SessionState};
