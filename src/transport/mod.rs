//! Channel factory implementations

pub mod ws;

pub use ws::{WsChannelFactory, WsChannelHandle};
