pub mod connctx;
pub mod pool;
pub mod pubsub;
pub mod room_manager;

pub use connctx::{ConnCtx, ConnId, OutgoingFrame};
pub use pool::{AdmissionError, PoolManager, PoolStats, RateDecision};
pub use pubsub::{InMemoryPubSub, PubSubMessage, PubSubTransport};
#[cfg(feature = "redis")]
pub use pubsub::RedisPubSub;
pub use room_manager::{RoomManager, RoomStats};
