mod event;
mod kind;
mod state;

pub use event::{Event, NewEvent};
pub use kind::{EventAction, EventType, ParseKindError};
pub use state::OrganizationState;
