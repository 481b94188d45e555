// Beacon Broker - shared state and messaging between gateway instances
//
// This crate implements the cross-instance directory of online users, the
// typed event bus used for fan-out, and the correlated request/response client
// used to reach backend services over the broker.

pub mod backends;
pub mod directory;
pub mod event_bus;
pub mod friends;
pub mod reliability;
pub mod rpc;
pub mod transport;

pub use backends::memory::{MemoryDirectory, MemoryTransport};
pub use backends::redis::{RedisDirectory, RedisTransport};
pub use directory::{online_subset, Directory};
pub use event_bus::{
    BusData, BusEvent, EventBus, EventFamily, EventKind, PresenceEvent, PresenceStream,
};
pub use friends::{parse_friend_list, FriendDirectoryClient, FriendLookup, StaticFriends};
pub use rpc::{BrokerEnvelope, CorrelationClient, Inbound};
pub use transport::{MessageStream, Transport, TransportMessage};
