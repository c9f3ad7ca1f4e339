pub mod cache;
pub mod config;
pub mod context;
pub mod gate;
pub mod registry;
pub mod topic;
pub mod types;

pub use cache::{Admission, BoundedCache};
pub use config::SkillConfig;
pub use context::{ContextSettings, SkillContext};
pub use gate::{CertaintyGate, ConfidenceModifier, Decision, EntityMatcher, GatePolicy, Rejection};
pub use registry::{Device, DeviceType, DeviceUpdate, NewDevice, Room, SkillRecord};
pub use topic::{TopicPattern, TopicRouter};
pub use types::*;
