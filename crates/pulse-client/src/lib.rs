pub mod config;
pub mod connector;
pub mod credential;
pub mod manager;
pub mod net_client;
pub mod presence;
pub mod reconnect;
pub mod rooms;
mod session;
pub mod sync;

pub use config::ClientConfig;
pub use manager::{ConnectionManager, EventSubscription, RealtimeEvent, SessionHandle};
pub use reconnect::ReconnectRegistration;
pub use sync::Phase;
