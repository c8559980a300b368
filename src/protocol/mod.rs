//! Wire protocol shared by the mesh and backend transports

pub mod envelope;
pub mod frame;

pub use envelope::{
    Envelope, ErrorPayload, HitPayload, JoinPayload, LeavePayload, PingPayload, PresencePayload,
    ShotPayload, StatePayload, DEFAULT_SHOT_RANGE_M,
};
pub use frame::{FrameError, FrameSealer};
