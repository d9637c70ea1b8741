pub mod envelope;
pub mod fanout;
pub mod handler;
pub mod hub;
pub mod registry;

pub use envelope::{ClientEnvelope, Point, ServerEnvelope, StrokeSegment};
pub use fanout::{ClusterFabric, PublishRequest, RedisFanout};
pub use handler::SessionHandler;
pub use hub::{RoomFabric, RoomHub, Subscriber};
pub use registry::{ConnId, ConnectionHandle, ConnectionRegistry};
