//! wsio-client
//!
//! Client-side connection manager for a persistent, event-based channel:
//! opens the channel, detects loss, reconnects with a bounded growing delay
//! and publishes one observable connection state.

pub mod connection;
pub mod transport;

pub use connection::{
    ChannelEvent, ChannelFactory, ChannelHandle, ChannelListener, ChannelOptions,
    ConnectionManager, ConnectionParams, ConnectionResolver, ConnectionState, ManagerConfig,
    ManagerSnapshot, StaticResolver,
};
pub use transport::WsChannelFactory;
