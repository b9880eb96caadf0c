//! The broadcast hub: a single event-loop task that owns the session
//! registry and the bounded message history. Everything else talks to it
//! through a [`HubHandle`].

mod history;
mod hub;

pub use history::{History, HISTORY_CAPACITY};
pub use hub::{Hub, HubError, HubEvent, HubHandle, HubSnapshot, Session};
