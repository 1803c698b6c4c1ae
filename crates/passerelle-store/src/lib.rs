pub mod database;
pub mod disappearing;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod portals;
pub mod reactions;
pub mod user_portals;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::{DisappearingMessage, Message, PortalRow, Reaction, UserPortal};
