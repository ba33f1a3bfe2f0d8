//! 评分流水线配置 - 通过JSON文件调整参数

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::alignment::DistanceMetric;
use crate::detection::formation::FormationAxis;
use crate::posture::metrics::MetricKind;
use crate::posture::smoothing::SmoothingMethod;
use crate::scoring::aggregator::AggregationMethod;

/// 身份跟踪方式
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackingMode {
    /// 通用关联跟踪 (运动模型 + 三阶段匹配)
    #[default]
    General,
    /// 固定队形 (队员站位预先已知)
    Formation,
}

/// 身份跟踪参数
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    pub mode: TrackingMode,

    // === 三阶段关联 ===
    pub high_score_threshold: f32, // 高分检测阈值
    pub low_score_threshold: f32,  // 低分阈值 (救援用)
    pub new_track_threshold: f32,  // 新建轨迹最低置信度
    pub match_threshold: f32,      // 匹配相似度阈值 (代价 < 1 - 阈值)
    pub low_match_threshold: f32,  // 低分阶段放宽的阈值
    pub appearance_alpha: f32,     // 代价中 IoU 的权重 α
    pub max_lost_frames: u32,      // 丢失保留窗口
    pub pose_embedding_fallback: bool, // 无外部外观模型时用姿态特征

    // === 卡尔曼滤波 ===
    pub kalman_std_weight_position: f64,
    pub kalman_std_weight_velocity: f64,
    pub predict_keypoints: bool,
    pub keypoint_process_noise: f64,
    pub keypoint_measurement_noise: f64,

    // === 自适应噪声 ===
    pub motion_history: usize,      // 速度历史长度
    pub motion_reference_speed: f32, // 参考速度 (框高/帧)
    pub max_noise_scale: f32,

    pub history_length: usize,  // 关键点/分数历史长度
    pub embedding_momentum: f32, // 外观特征 EMA 动量
    pub min_keypoint_confidence: f32,

    pub formation: FormationConfig,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            mode: TrackingMode::General,
            high_score_threshold: 0.5,
            low_score_threshold: 0.1,
            new_track_threshold: 0.6,
            match_threshold: 0.3,
            low_match_threshold: 0.2,
            appearance_alpha: 0.7,
            max_lost_frames: 60, // 约2秒
            pose_embedding_fallback: false,

            kalman_std_weight_position: 1.0 / 20.0,
            kalman_std_weight_velocity: 1.0 / 160.0,
            predict_keypoints: true,
            keypoint_process_noise: 1.0,
            keypoint_measurement_noise: 4.0,

            motion_history: 10,
            motion_reference_speed: 0.05,
            max_noise_scale: 4.0,

            history_length: 30,
            embedding_momentum: 0.9,
            min_keypoint_confidence: 0.3,

            formation: FormationConfig::default(),
        }
    }
}

/// 固定队形参数
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FormationConfig {
    pub slots: usize,         // 队员数量
    pub init_frames: usize,   // 初始化窗口 (人数恰好等于 slots 的帧数)
    pub axis: FormationAxis,  // 排序轴
    pub ema_alpha: f32,       // 站位 EMA 系数
    pub max_distance: f32,    // 最大匹配距离 (以框高为单位)
    pub ratio_weight: f32,    // 肢体比例差异权重
    pub min_confidence: f32,  // 参与分配的最低检测置信度
}

impl Default for FormationConfig {
    fn default() -> Self {
        Self {
            slots: 0,
            init_frames: 10,
            axis: FormationAxis::X,
            ema_alpha: 0.2,
            max_distance: 1.5,
            ratio_weight: 1.0,
            min_confidence: 0.5,
        }
    }
}

/// 轨迹稳定性校验参数
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    pub min_frames: u32,      // 最少存活帧数
    pub window: usize,        // 比例滑动窗口
    pub min_samples: usize,   // 窗口内最少有效样本
    pub ratio_tolerance: f32, // 比例标准差容差
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            min_frames: 10,
            window: 15,
            min_samples: 5,
            ratio_tolerance: 0.15,
        }
    }
}

/// 参考动作匹配参数
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    pub similarity_threshold: f32,
    pub min_common_joints: usize,
    pub match_interval: u64, // 每隔多少帧重新匹配
    pub min_keypoint_confidence: f32,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.8,
            min_common_joints: 6,
            match_interval: 1,
            min_keypoint_confidence: 0.3,
        }
    }
}

/// 时间对齐 (DTW) 参数
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignmentConfig {
    pub enabled: bool,
    pub window_radius: usize, // 0 表示不限制
    pub distance: DistanceMetric,
    pub realign_interval: u64, // 会话内重新对齐间隔 (帧)
    pub max_history: usize,    // 候选特征历史上限
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            window_radius: 30,
            distance: DistanceMetric::Euclidean,
            realign_interval: 15,
            max_history: 300,
        }
    }
}

/// 单项指标参数
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricConfig {
    pub enabled: bool,
    pub weight: f32,
    pub default_threshold: f32,
    /// 无参考统计时的目标值 (例如肩部水平 = 0°)
    pub expected: Option<f32>,
}

impl Default for MetricConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            weight: 1.0,
            default_threshold: 10.0,
            expected: None,
        }
    }
}

/// 姿态评估参数
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorConfig {
    pub min_keypoint_confidence: f32,
    pub std_multiplier: f32,
    pub min_ratio: f32,
    pub max_ratio: f32,
    pub severity_exponent: f32,
    pub severity_cap: f32,
    pub keypoint_smoothing: SmoothingMethod,
    pub metric_smoothing: SmoothingMethod,
    /// 指标名 (不含左右) → 参数
    pub metrics: BTreeMap<String, MetricConfig>,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        let mut metrics = BTreeMap::new();
        for kind in MetricKind::ALL {
            let config = match kind {
                MetricKind::ArmAngle | MetricKind::LegAngle => MetricConfig::default(),
                MetricKind::ArmHeight => MetricConfig {
                    weight: 0.5,
                    default_threshold: 0.15,
                    ..MetricConfig::default()
                },
                MetricKind::HeadAngle => MetricConfig {
                    weight: 0.5,
                    default_threshold: 15.0,
                    expected: Some(0.0),
                    ..MetricConfig::default()
                },
                MetricKind::ShoulderBalance | MetricKind::HipBalance => MetricConfig {
                    weight: 0.5,
                    default_threshold: 5.0,
                    expected: Some(0.0),
                    ..MetricConfig::default()
                },
                MetricKind::TorsoLean => MetricConfig {
                    weight: 0.8,
                    default_threshold: 8.0,
                    expected: Some(0.0),
                    ..MetricConfig::default()
                },
            };
            metrics.insert(kind.name().to_string(), config);
        }

        Self {
            min_keypoint_confidence: 0.3,
            std_multiplier: 2.0,
            min_ratio: 0.5,
            max_ratio: 2.0,
            severity_exponent: 0.5,
            severity_cap: 3.0,
            keypoint_smoothing: SmoothingMethod::None,
            metric_smoothing: SmoothingMethod::None,
            metrics,
        }
    }
}

impl EvaluatorConfig {
    /// 查找指标参数, 未配置时使用默认值
    pub fn metric(&self, kind: MetricKind) -> MetricConfig {
        self.metrics.get(kind.name()).cloned().unwrap_or_default()
    }
}

/// 错误聚合参数
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    pub min_sequence_length: usize,
    pub max_gap: u64, // 允许的漏检帧数
    pub method: AggregationMethod,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            min_sequence_length: 3,
            max_gap: 2,
            method: AggregationMethod::Mean,
        }
    }
}

/// 计分参数
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub initial_score: f32,
    pub fail_threshold: f32, // 测试模式下低于此分数即停止
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            initial_score: 100.0,
            fail_threshold: 60.0,
        }
    }
}

/// 会话参数
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// 未匹配到参考动作的稳定身份是否按默认阈值评分
    pub score_unmatched: bool,
}

/// 完整流水线配置
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub tracking: TrackingConfig,
    pub validator: ValidatorConfig,
    pub matcher: MatcherConfig,
    pub alignment: AlignmentConfig,
    pub evaluator: EvaluatorConfig,
    pub aggregator: AggregatorConfig,
    pub scoring: ScoringConfig,
    pub session: SessionConfig,
}

impl PipelineConfig {
    /// 从JSON文件加载配置
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .with_context(|| format!("读取配置文件失败: {}", path.display()))?;
        let config: Self = serde_json::from_str(&json)
            .with_context(|| format!("配置文件解析失败: {}", path.display()))?;
        config.validate()?;
        info!(path = %path.display(), "配置已加载");
        Ok(config)
    }

    /// 保存配置到JSON文件
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self).context("序列化配置失败")?;
        fs::write(path, json).with_context(|| format!("保存配置失败: {}", path.display()))?;
        info!(path = %path.display(), "配置已保存");
        Ok(())
    }

    /// 检查数值范围
    pub fn validate(&self) -> Result<()> {
        let t = &self.tracking;
        if !(0.0..=1.0).contains(&t.low_score_threshold)
            || !(0.0..=1.0).contains(&t.high_score_threshold)
            || t.low_score_threshold > t.high_score_threshold
        {
            bail!(
                "检测阈值非法: low={} high={}",
                t.low_score_threshold,
                t.high_score_threshold
            );
        }
        if !(0.0..=1.0).contains(&t.appearance_alpha) {
            bail!("appearance_alpha 必须在 [0,1]: {}", t.appearance_alpha);
        }
        if t.mode == TrackingMode::Formation && t.formation.slots == 0 {
            bail!("队形模式需要 formation.slots > 0");
        }
        let e = &self.evaluator;
        if e.min_ratio <= 0.0 || e.min_ratio > e.max_ratio {
            bail!("阈值比例区间非法: [{}, {}]", e.min_ratio, e.max_ratio);
        }
        if e.severity_cap <= 0.0 || e.severity_exponent <= 0.0 {
            bail!("严重度参数必须为正");
        }
        for (name, metric) in &e.metrics {
            if MetricKind::from_name(name).is_none() {
                bail!("未知指标: {}", name);
            }
            if metric.default_threshold <= 0.0 {
                bail!("指标 {} 的默认阈值必须为正", name);
            }
        }
        if self.aggregator.min_sequence_length == 0 {
            bail!("min_sequence_length 必须 >= 1");
        }
        let s = &self.scoring;
        if s.initial_score <= 0.0 || s.fail_threshold < 0.0 || s.fail_threshold > s.initial_score {
            bail!(
                "计分参数非法: initial={} fail={}",
                s.initial_score,
                s.fail_threshold
            );
        }
        Ok(())
    }

    /// 打印当前配置
    pub fn print_summary(&self) {
        info!(
            mode = ?self.tracking.mode,
            high = self.tracking.high_score_threshold,
            low = self.tracking.low_score_threshold,
            max_lost = self.tracking.max_lost_frames,
            "跟踪器配置"
        );
        info!(
            enabled = self.alignment.enabled,
            radius = self.alignment.window_radius,
            distance = ?self.alignment.distance,
            "时间对齐配置"
        );
        info!(
            min_len = self.aggregator.min_sequence_length,
            max_gap = self.aggregator.max_gap,
            method = ?self.aggregator.method,
            "错误聚合配置"
        );
        info!(
            initial = self.scoring.initial_score,
            fail = self.scoring.fail_threshold,
            "计分配置"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.evaluator.metrics.len(), MetricKind::ALL.len());
        assert_eq!(config.tracking.max_lost_frames, 60);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{ "scoring": { "fail_threshold": 50.0 }, "aggregator": { "method": "median" } }"#;
        let config: PipelineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.scoring.fail_threshold, 50.0);
        assert_eq!(config.scoring.initial_score, 100.0);
        assert_eq!(config.aggregator.method, AggregationMethod::Median);
        assert_eq!(config.aggregator.min_sequence_length, 3);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = PipelineConfig::default();
        config.scoring.fail_threshold = 150.0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.tracking.mode = TrackingMode::Formation;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config
            .evaluator
            .metrics
            .insert("elbow_spin".to_string(), MetricConfig::default());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_load_file() {
        let path = std::env::temp_dir().join(format!("drill_score_cfg_{}.json", std::process::id()));
        let mut config = PipelineConfig::default();
        config.alignment.enabled = true;
        config.save(&path).unwrap();
        let loaded = PipelineConfig::load(&path).unwrap();
        assert!(loaded.alignment.enabled);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_missing_file_is_error() {
        assert!(PipelineConfig::load("/nonexistent/drill_score.json").is_err());
    }
}
