//! Flux Tunnel - session orchestration for an external proxy core
//!
//! Turns a remote proxy descriptor into a running, monitored, loop-free
//! tunnel:
//! - compiles a complete proxy-engine configuration
//! - supervises the proxy-core process and drains its logs
//! - establishes the OS tunnel interface and its forwarding bridge
//! - keeps tunnel egress bound to the current physical network
//! - exposes connection state as an observable session
//!
//! # Architecture
//!
//! ```text
//!                   +---------------------+
//!                   | session/ (controller|
//!                   |  + state machine)   |
//!                   +----------+----------+
//!                              |
//!        +---------------------+---------------------+
//!        |                     |                     |
//! +------v------+      +-------v-------+     +-------v-------+
//! |  compiler/  |      |     core/     |     |    tunnel/    |
//! | (artifact)  |      | (supervisor)  |     |   (manager)   |
//! +------+------+      +---------------+     +-------^-------+
//!        |                                           |
//! +------v------+                            +-------+-------+
//! |   config/   |                            |   network/    |
//! +-------------+                            |   (monitor)   |
//!                                            +---------------+
//! ```

pub mod common;
pub mod compiler;
pub mod config;
pub mod core;
pub mod network;
pub mod session;
pub mod tunnel;

pub use common::error::{Error, Result};
pub use common::logs::{LogEvent, LogSink};
pub use compiler::{compile, CompileEnv, CompiledConfig, GeoAssets};
pub use config::{ConnectRequest, OutboundDescriptor, RoutingMode, RoutingPolicy, Settings};
pub use session::{SessionController, SessionState};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
