pub mod controller;
pub mod reconnect;
pub mod registry;
pub mod session;

pub use controller::{ConnectionController, ControllerConfig, InboundSink, RestoreReport, StatusChange};
pub use reconnect::ReconnectPolicy;
pub use registry::SessionRegistry;
pub use session::{ConnectionState, Session, SessionSnapshot};
