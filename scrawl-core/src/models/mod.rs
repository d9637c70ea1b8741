pub mod id;

pub use id::{generate_id, RoomId, UserId};
