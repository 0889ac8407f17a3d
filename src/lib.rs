//! Terminal dashboard that tails several log sources side by side.

pub mod app;
pub mod error;
pub mod input;
pub mod local;
pub mod prefs;
pub mod screen;
pub mod session;
pub mod source;
pub mod text;
pub mod tty;

pub use app::{App, AppConfig, AppState, SharedState};
pub use source::{Catalog, LogEvent, LogSource, RawEvent, Subscriber, Subscription};
