//! TCP stream listing and "follow stream" reconstruction.

pub mod builtin_follow;
pub mod follower;
pub mod printable;
pub mod reconstructor;
pub mod types;

pub use reconstructor::StreamReconstructor;
pub use types::{
    DirectionFilter, FollowBudgets, FollowRequest, FollowResult, MatchMode, PacketRange,
    SearchOptions, TcpStreamEntry,
};
