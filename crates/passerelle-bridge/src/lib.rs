//! Portal core of the Passerelle chat bridge.
//!
//! A [`Portal`] represents one bridged conversation between a room-based
//! chat server and a remote messaging network. All events touching a
//! conversation are serialized onto the portal's single consumer task;
//! the [`Bridge`] value carries the collaborators and the portal registry.

pub mod api;
pub mod bridge;
pub mod config;
pub mod portal;
pub mod remote;
pub mod users;

mod remote_events;
mod room_events;
mod room_meta;

pub use bridge::Bridge;
pub use config::{BridgeConfig, OverflowPolicy};
pub use portal::{Portal, PortalState, PreferredLogin};
pub use remote::{EventSender, RemoteEvent};
pub use users::{OrigSender, User, UserLogin};

use tracing_subscriber::{fmt, EnvFilter};

/// Initialise tracing for bridge binaries. Library consumers that configure
/// their own subscriber should not call this.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("passerelle_bridge=debug,passerelle_store=info,warn"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
