//! busbar: a message-bus broker. Clients register named services over TCP,
//! look up peers, and send targeted or broadcast messages that the broker
//! forwards to every matching live connection.

pub mod forward;
pub mod handlers;
pub mod registry;
pub mod server;
pub mod typed;

pub use registry::{Registry, RegistryError};
pub use server::{Broker, BrokerConfig, BrokerError, DEFAULT_PORT};
