//! 姿态评估模块
//! - metrics:   关节角度 / 高度 / 平衡指标
//! - smoothing: 关键点与指标的时间平滑
//! - evaluator: 与参考统计比较, 产生逐帧错误

pub mod evaluator;
pub mod metrics;
pub mod smoothing;

pub use evaluator::{severity, ErrorSignature, EvaluationOutcome, PostureError, PostureEvaluator};
pub use metrics::{BodyPart, MetricKey, MetricKind, MetricType, Side};
pub use smoothing::{KeypointSmoother, ScalarSmoother, SmoothingMethod};
