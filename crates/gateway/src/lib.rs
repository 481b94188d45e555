// Beacon Gateway - real-time presence and notification gateway
//
// Holds authenticated WebSocket connections, debounces presence changes into
// friend notifications and fans bus events out to the sockets of this instance.

pub mod auth;
pub mod dispatcher;
pub mod handlers;
pub mod node;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod server;

pub use auth::{Identity, IdentityVerifier, JwtVerifier, TokenAuth};
pub use dispatcher::Dispatcher;
pub use handlers::{BrokerEventRouter, ClientHandlers};
pub use node::GatewayNode;
pub use presence::{PresenceCoordinator, TimerKind};
pub use protocol::{ClientRequest, OutgoingMessage, ProtocolError, SocketFrame};
pub use registry::{Connection, ConnectionRegistry};
pub use server::GatewayServer;
