//! GridAgent server.
//!
//! Accepts encrypted TCP connections from GridAgent devices, keeps a
//! registry of live agent sessions, publishes everything agents report on
//! the topic bus and routes bus commands back to the right agent.
//!
//! The [`Server`] owns the listeners; each connection runs as a session
//! (see [`session`]) and bus commands arrive through the [`Bridge`].

pub mod bridge;
pub mod bus;
pub mod config;
pub mod error;
pub mod http;
pub mod registry;
pub mod server;
pub mod session;
pub mod software;

pub use bridge::Bridge;
pub use bus::{BusClient, BusMessage, MemoryBus, Subscription};
pub use config::{ConfigError, ServerConfig};
pub use error::{BusError, CloseReason, CommandError, DeliveryError, ServerError, SessionError};
pub use registry::{AgentInfo, DeliveryPolicy, Registry, SessionHandle};
pub use server::Server;
pub use session::{run_session, SessionContext};
pub use software::SoftwareStore;
