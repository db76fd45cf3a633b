//! Terminal session & port-proxy runtime.
//!
//! Owns pseudo-terminal processes independent of any viewer, scrubs
//! terminal query-response noise from their output before it is persisted
//! or replayed, discovers TCP ports opened anywhere in a session's
//! process tree, and exposes those moving backend ports through stable
//! canonical proxy ports.
//!
//! Data flows one direction: session output -> escape filter -> (history,
//! scrollback, hint detector) -> port detector -> proxy manager.

pub mod config;
pub mod detect;
pub mod error;
pub mod events;
pub mod filter;
pub mod history;
pub mod procinfo;
pub mod proxy;
pub mod pty;
pub mod runtime;
pub mod scrollback;
pub mod session;
mod util;

pub use config::RuntimeConfig;
pub use detect::{DetectedPort, PortDetector};
pub use error::{Error, Result};
pub use events::{Event, EventBus};
pub use filter::EscapeFilter;
pub use history::HistoryStore;
pub use proxy::{ProxyManager, ProxyPortConfig};
pub use runtime::PaneRuntime;
pub use session::{CreateOrAttach, SessionInfo, SessionManager};
