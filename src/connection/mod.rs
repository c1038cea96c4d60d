//! Client-side connection lifecycle
//!
//! | Module    | Responsibility                                        |
//! |-----------|-------------------------------------------------------|
//! | `state`   | Lifecycle states                                      |
//! | `config`  | Manager + channel options, env loading                |
//! | `backoff` | Linear retry delay, disconnection episode             |
//! | `timer`   | One armed single-shot timer per concern               |
//! | `channel` | Resolver / factory / handle contracts                 |
//! | `metrics` | Counters                                              |
//! | `manager` | Public handle + supervisor state machine              |

pub mod backoff;
pub mod channel;
pub mod config;
pub mod metrics;
pub mod state;

pub(crate) mod manager;
mod timer;

pub use backoff::{DisconnectionEpisode, LinearBackoff};
pub use channel::{
    ChannelEvent, ChannelFactory, ChannelHandle, ChannelListener, ConnectionParams,
    ConnectionResolver, StaticResolver,
};
pub use config::{ChannelOptions, ManagerConfig};
pub use manager::{ConnectionManager, ManagerSnapshot};
pub use metrics::{ManagerMetrics, ManagerMetricsSnapshot};
pub use state::{ConnectionState, TimerKind};
