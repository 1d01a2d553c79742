pub mod memory_transport;
pub mod protocol;
pub mod transport;

#[cfg(feature = "native")]
pub mod ws_transport;
