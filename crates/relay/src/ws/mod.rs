mod handler;
mod protocol;
mod session;

pub use handler::router;
pub use session::{GatewayState, OrdererFailure, Session, SocketSessions};
