//! 姿态评估: 逐帧指标 → 显著偏差
//!
//! 阈值优先来自参考动作的标准差 (乘以系数后夹在默认阈值的 [min_ratio, max_ratio] 倍之间),
//! 没有统计时使用默认绝对阈值。严重度随偏差亚线性增长并有上限,
//! 小偏差不会被线性放大。

use std::collections::BTreeMap;

use serde::Serialize;

use super::metrics::{BodyPart, MetricKey, MetricType, Side};
use super::smoothing::{KeypointSmoother, ScalarSmoother};
use crate::config::EvaluatorConfig;
use crate::detection::types::PoseKeypoints;
use crate::reference::ReferenceStats;

/// 错误签名: 聚合时按此分组
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ErrorSignature {
    pub metric_type: MetricType,
    pub body_part: BodyPart,
    pub side: Option<Side>,
}

/// 单帧姿态错误
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PostureError {
    pub metric: MetricKey,
    pub metric_type: MetricType,
    pub body_part: BodyPart,
    pub side: Option<Side>,
    /// 实测值
    pub value: f32,
    /// 参考值 (均值或对齐帧的值)
    pub reference: f32,
    pub threshold: f32,
    pub severity: f32,
    pub weight: f32,
    pub deduction: f32,
    pub frame_index: u64,
    pub timestamp: f64,
}

impl PostureError {
    pub fn signature(&self) -> ErrorSignature {
        ErrorSignature {
            metric_type: self.metric_type,
            body_part: self.body_part,
            side: self.side,
        }
    }
}

/// 单帧评估结果
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EvaluationOutcome {
    pub errors: Vec<PostureError>,
    /// 关节缺失或无参考值而无法评估的指标
    pub unavailable: Vec<MetricKey>,
}

/// 偏差严重度: min((|偏差| / 阈值)^exponent, cap)
pub fn severity(deviation: f32, threshold: f32, exponent: f32, cap: f32) -> f32 {
    if threshold <= 0.0 {
        return cap;
    }
    (deviation.abs() / threshold).powf(exponent).min(cap)
}

/// 姿态评估器 (每个人一个, 持有平滑状态)
#[derive(Clone, Debug)]
pub struct PostureEvaluator {
    config: EvaluatorConfig,
    keypoint_smoother: KeypointSmoother,
    metric_smoothers: BTreeMap<MetricKey, ScalarSmoother>,
}

impl PostureEvaluator {
    pub fn new(config: EvaluatorConfig) -> Self {
        let keypoint_smoother =
            KeypointSmoother::new(config.keypoint_smoothing, config.min_keypoint_confidence);
        Self {
            config,
            keypoint_smoother,
            metric_smoothers: BTreeMap::new(),
        }
    }

    /// 按参考统计评估一帧
    pub fn evaluate(
        &mut self,
        keypoints: &PoseKeypoints,
        stats: Option<&ReferenceStats>,
        frame_index: u64,
        timestamp: f64,
    ) -> EvaluationOutcome {
        self.evaluate_aligned(keypoints, stats, None, frame_index, timestamp)
    }

    /// 评估一帧, `aligned` 为时间对齐后的参考帧
    ///
    /// 对齐帧上可计算的指标以该帧的值代替参考均值, 标准差仍取统计表
    pub fn evaluate_aligned(
        &mut self,
        keypoints: &PoseKeypoints,
        stats: Option<&ReferenceStats>,
        aligned: Option<&PoseKeypoints>,
        frame_index: u64,
        timestamp: f64,
    ) -> EvaluationOutcome {
        let mut outcome = EvaluationOutcome::default();
        let min_conf = self.config.min_keypoint_confidence;

        if !keypoints.is_well_formed() {
            outcome.unavailable = MetricKey::all();
            return outcome;
        }
        let keypoints = self.keypoint_smoother.smooth(keypoints);

        for key in MetricKey::all() {
            let metric = self.config.metric(key.kind);
            if !metric.enabled {
                continue;
            }
            let Some(raw) = key.compute(&keypoints, min_conf) else {
                outcome.unavailable.push(key);
                continue;
            };
            let method = self.config.metric_smoothing;
            let value = self
                .metric_smoothers
                .entry(key)
                .or_insert_with(|| ScalarSmoother::new(method))
                .smooth(raw);

            let (reference, threshold) = match stats.and_then(|s| s.get(&key)) {
                Some(st) => {
                    let mean = aligned
                        .and_then(|a| key.compute(a, min_conf))
                        .unwrap_or(st.mean);
                    let default = metric.default_threshold;
                    let threshold = (st.std * self.config.std_multiplier).clamp(
                        self.config.min_ratio * default,
                        self.config.max_ratio * default,
                    );
                    (mean, threshold)
                }
                None => match metric.expected {
                    Some(expected) => (expected, metric.default_threshold),
                    None => {
                        outcome.unavailable.push(key);
                        continue;
                    }
                },
            };

            let deviation = (value - reference).abs();
            if deviation <= threshold {
                continue;
            }
            let severity = severity(
                deviation,
                threshold,
                self.config.severity_exponent,
                self.config.severity_cap,
            );
            outcome.errors.push(PostureError {
                metric: key,
                metric_type: key.kind.metric_type(),
                body_part: key.kind.body_part(),
                side: key.side,
                value,
                reference,
                threshold,
                severity,
                weight: metric.weight,
                deduction: metric.weight * severity,
                frame_index,
                timestamp,
            });
        }
        outcome
    }

    /// 清空平滑状态
    pub fn reset(&mut self) {
        self.keypoint_smoother.reset();
        self.metric_smoothers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::types::tests::standing_pose;
    use crate::detection::types::{LEFT_ELBOW, LEFT_SHOULDER, LEFT_WRIST};
    use crate::posture::metrics::MetricKind;
    use crate::posture::smoothing::SmoothingMethod;
    use crate::reference::MetricStats;
    use approx::assert_abs_diff_eq;

    /// 左臂肘部夹角为 `degrees` 的站立姿态
    fn pose_with_left_arm(degrees: f32) -> PoseKeypoints {
        let mut kp = standing_pose(200.0, 0.0, 200.0);
        let (sx, sy, _) = kp.points[LEFT_SHOULDER];
        let (ex, ey) = (sx, sy + 32.0);
        let rad = degrees.to_radians();
        kp.points[LEFT_ELBOW] = (ex, ey, 0.9);
        kp.points[LEFT_WRIST] = (ex + 30.0 * rad.sin(), ey - 30.0 * rad.cos(), 0.9);
        kp
    }

    fn arm_stats(mean: f32, std: f32) -> ReferenceStats {
        let mut stats = ReferenceStats::default();
        stats.insert(
            &MetricKey::new(MetricKind::ArmAngle, Some(Side::Left)),
            MetricStats { mean, std },
        );
        stats
    }

    #[test]
    fn test_severity_curve() {
        assert_abs_diff_eq!(severity(25.0, 10.0, 0.5, 3.0), 1.5811, epsilon = 1e-3);
        assert_eq!(severity(1000.0, 10.0, 0.5, 3.0), 3.0);
        assert_abs_diff_eq!(severity(20.0, 10.0, 1.0, 3.0), 2.0, epsilon = 1e-6);
    }

    #[test]
    fn test_arm_angle_outlier() {
        let mut eval = PostureEvaluator::new(EvaluatorConfig::default());
        let kp = pose_with_left_arm(70.0);
        let outcome = eval.evaluate(&kp, Some(&arm_stats(45.0, 5.0)), 12, 0.4);

        assert_eq!(outcome.errors.len(), 1);
        let err = &outcome.errors[0];
        assert_eq!(err.metric.to_string(), "arm_angle.left");
        assert_eq!(err.metric_type, MetricType::Angle);
        assert_eq!(err.body_part, BodyPart::Arm);
        assert_eq!(err.side, Some(Side::Left));
        assert_abs_diff_eq!(err.value, 70.0, epsilon = 1e-2);
        assert_abs_diff_eq!(err.threshold, 10.0, epsilon = 1e-6);
        assert_abs_diff_eq!(err.severity, 1.58, epsilon = 1e-2);
        assert_abs_diff_eq!(err.deduction, 1.58, epsilon = 1e-2);
        assert_eq!(err.frame_index, 12);

        // 没有统计且没有目标值的指标不可用
        assert!(outcome
            .unavailable
            .contains(&MetricKey::new(MetricKind::ArmAngle, Some(Side::Right))));
    }

    #[test]
    fn test_adaptive_threshold_is_clamped() {
        let mut eval = PostureEvaluator::new(EvaluatorConfig::default());
        let kp = pose_with_left_arm(70.0);

        // std 很小: 阈值下限 0.5 × 10
        let out = eval.evaluate(&kp, Some(&arm_stats(60.0, 0.1)), 0, 0.0);
        assert_abs_diff_eq!(out.errors[0].threshold, 5.0, epsilon = 1e-6);

        // std 很大: 阈值上限 2 × 10, 偏差 25 仍超出
        let out = eval.evaluate(&kp, Some(&arm_stats(45.0, 50.0)), 1, 0.0);
        assert_abs_diff_eq!(out.errors[0].threshold, 20.0, epsilon = 1e-6);

        // 偏差在阈值内不报错
        let out = eval.evaluate(&kp, Some(&arm_stats(65.0, 5.0)), 2, 0.0);
        assert!(out.errors.is_empty());
    }

    #[test]
    fn test_missing_reference_uses_expected_values() {
        let mut eval = PostureEvaluator::new(EvaluatorConfig::default());
        let mut kp = standing_pose(200.0, 0.0, 200.0);
        // 躯干明显前倾: 肩部整体右移
        kp.points[LEFT_SHOULDER].0 += 40.0;
        kp.points[LEFT_SHOULDER + 1].0 += 40.0;
        let out = eval.evaluate(&kp, None, 0, 0.0);
        let torso = out
            .errors
            .iter()
            .find(|e| e.body_part == BodyPart::Torso)
            .unwrap();
        assert_eq!(torso.reference, 0.0);
        assert_eq!(torso.threshold, 8.0);
        assert_eq!(torso.weight, 0.8);
    }

    #[test]
    fn test_invalid_shape_and_low_confidence() {
        let mut eval = PostureEvaluator::new(EvaluatorConfig::default());
        let short = PoseKeypoints::new(vec![(0.0, 0.0, 0.9); 5]);
        let out = eval.evaluate(&short, None, 0, 0.0);
        assert!(out.errors.is_empty());
        assert_eq!(out.unavailable.len(), MetricKey::all().len());

        let mut kp = pose_with_left_arm(70.0);
        kp.points[LEFT_WRIST].2 = 0.1;
        let out = eval.evaluate(&kp, Some(&arm_stats(45.0, 5.0)), 1, 0.0);
        assert!(out.errors.is_empty());
        assert!(out
            .unavailable
            .contains(&MetricKey::new(MetricKind::ArmAngle, Some(Side::Left))));
    }

    #[test]
    fn test_aligned_frame_overrides_mean() {
        let mut eval = PostureEvaluator::new(EvaluatorConfig::default());
        let kp = pose_with_left_arm(70.0);
        let aligned = pose_with_left_arm(68.0);
        let out = eval.evaluate_aligned(&kp, Some(&arm_stats(45.0, 5.0)), Some(&aligned), 0, 0.0);
        assert!(out.errors.is_empty());
    }

    #[test]
    fn test_metric_smoothing_and_reset() {
        let config = EvaluatorConfig {
            metric_smoothing: SmoothingMethod::MovingAverage { window: 2 },
            ..EvaluatorConfig::default()
        };
        let mut eval = PostureEvaluator::new(config);
        let stats = arm_stats(45.0, 5.0);
        eval.evaluate(&pose_with_left_arm(45.0), Some(&stats), 0, 0.0);
        // 平滑后 (45 + 75) / 2 = 60, 偏差 15
        let out = eval.evaluate(&pose_with_left_arm(75.0), Some(&stats), 1, 0.0);
        assert_abs_diff_eq!(out.errors[0].value, 60.0, epsilon = 0.05);

        eval.reset();
        let out = eval.evaluate(&pose_with_left_arm(75.0), Some(&stats), 2, 0.0);
        assert_abs_diff_eq!(out.errors[0].value, 75.0, epsilon = 0.05);
    }

    #[test]
    fn test_disabled_metric_is_skipped() {
        let mut config = EvaluatorConfig::default();
        if let Some(m) = config.metrics.get_mut("arm_angle") {
            m.enabled = false;
        }
        let mut eval = PostureEvaluator::new(config);
        let out = eval.evaluate(&pose_with_left_arm(70.0), Some(&arm_stats(45.0, 5.0)), 0, 0.0);
        assert!(out.errors.is_empty());
        assert!(!out.unavailable.iter().any(|k| k.kind == MetricKind::ArmAngle));
    }
}
