#![allow(clippy::type_complexity)]
// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 队列动作评分核心库
//!
//! 输入外部姿态检测器的逐帧结果, 输出每个人的姿态错误与分数。
pub mod alignment; // 动作时间对齐 (DTW)
pub mod config; // 流水线配置参数
pub mod detection; // 身份跟踪系统
pub mod error; // 错误类型与降级信号
pub mod posture; // 姿态评估
pub mod reference; // 参考动作库与匹配
pub mod scoring; // 错误聚合与计分
pub mod session; // 评分会话

pub use crate::alignment::{AlignmentMap, DistanceMetric, DtwAligner};
pub use crate::config::PipelineConfig;
pub use crate::detection::{BBox, Detection, PoseKeypoints, Tracker, TrackerOutput};
pub use crate::error::{Degradation, ProfileError, SessionError};
pub use crate::posture::{PostureError, PostureEvaluator};
pub use crate::reference::{ReferenceLibrary, ReferenceMatcher, ReferenceProfile};
pub use crate::scoring::{ErrorAggregator, ErrorSequence, ScoringEngine, ScoringPolicy};
pub use crate::session::{FrameResult, Session, SessionMode, SessionRegistry, SessionSummary};

