//! 时间对齐模块
//!
//! 把候选者的动作序列按节奏映射到参考动作, 供姿态评估按对应参考帧比较

pub mod dtw;
pub mod features;

pub use dtw::{AlignmentMap, Boundary, DistanceMetric, DtwAligner};
pub use features::{pose_features, sequence_features, FEATURE_DIM};
