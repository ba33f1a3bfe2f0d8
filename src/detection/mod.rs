//! 身份跟踪系统 (Identity Tracking)
//!
//! 把逐帧的人体检测变成跨帧稳定的身份
//! - Tracker:   ByteTrack 式三阶段关联
//! - Formation: 固定队形站位分配
//! - Validator: 骨骼比例稳定性校验
pub mod assignment;
pub mod bytetrack;
pub mod formation;
pub mod tracker;
pub mod types;
pub mod validator;

pub use bytetrack::{IdentityTrack, IdentityTracker};
pub use formation::{FormationAssigner, FormationAxis};
pub use tracker::{
    AppearanceSource, PoseEmbedding, TrackSnapshot, TrackState, Tracker, TrackerOutput,
};
pub use types::{BBox, Detection, PoseKeypoints};
pub use validator::TrackValidator;

use crate::config::{TrackingConfig, TrackingMode, ValidatorConfig};

/// 按配置创建跟踪器
pub fn build_tracker(tracking: &TrackingConfig, validator: &ValidatorConfig) -> Box<dyn Tracker + Send> {
    match tracking.mode {
        TrackingMode::General => Box::new(IdentityTracker::new(tracking.clone(), validator.clone())),
        TrackingMode::Formation => Box::new(FormationAssigner::new(
            tracking.formation.clone(),
            validator.clone(),
            tracking.max_lost_frames,
            tracking.min_keypoint_confidence,
        )),
    }
}
