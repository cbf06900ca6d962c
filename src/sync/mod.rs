mod gateway;
mod local;
mod session;
mod transport;

pub use gateway::{ConnectionId, PushEvent, Subscription, SyncGateway};
pub use local::LocalTransport;
pub use session::{ClientSyncSession, DEFAULT_POLL_INTERVAL};
pub use transport::{CommandChannel, LinkState, PushLink, PushTransport};
