pub mod conversations;
pub mod error;
pub mod messages;
pub mod middleware;
pub mod notifications;
pub mod state;
pub mod webhook;

pub use state::{AppState, AppStateInner};
