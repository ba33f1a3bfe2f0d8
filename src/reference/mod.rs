//! 参考动作 (标准动作) 库
//!
//! 每个参考动作包含有序的关键点序列和逐指标统计表 `指标名[.左右] -> {mean, std}`。
//! 参考库由调用方显式构建, 通过 `Arc` 在会话间只读共享。

pub mod matcher;

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::alignment::sequence_features;
use crate::detection::types::{PoseKeypoints, NUM_KEYPOINTS};
use crate::error::ProfileError;
use crate::posture::metrics::MetricKey;

pub use matcher::{pose_similarity, ReferenceMatcher};

/// 单项指标统计
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricStats {
    pub mean: f32,
    pub std: f32,
}

/// 指标统计表
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReferenceStats(pub BTreeMap<String, MetricStats>);

impl ReferenceStats {
    /// 查找指标统计; 区分左右的指标找不到时退回不分左右的条目
    pub fn get(&self, key: &MetricKey) -> Option<MetricStats> {
        self.0
            .get(&key.to_string())
            .or_else(|| key.side.and_then(|_| self.0.get(key.kind.name())))
            .copied()
    }

    pub fn insert(&mut self, key: &MetricKey, stats: MetricStats) {
        self.0.insert(key.to_string(), stats);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// 从关键点序列统计所有指标的均值与标准差
    pub fn from_frames(frames: &[PoseKeypoints], min_conf: f32) -> Self {
        let mut stats = Self::default();
        for key in MetricKey::all() {
            let values: Vec<f32> = frames
                .iter()
                .filter_map(|kp| key.compute(kp, min_conf))
                .collect();
            if values.is_empty() {
                continue;
            }
            let n = values.len() as f32;
            let mean = values.iter().sum::<f32>() / n;
            let std = (values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n).sqrt();
            stats.insert(&key, MetricStats { mean, std });
        }
        stats
    }
}

/// 参考动作
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReferenceProfile {
    pub id: String,
    #[serde(default)]
    pub frames: Vec<PoseKeypoints>,
    /// 为空时由关键点序列自动统计
    #[serde(default)]
    pub stats: ReferenceStats,
}

impl ReferenceProfile {
    /// 由关键点序列构建, 统计表自动生成
    pub fn from_frames(id: impl Into<String>, frames: Vec<PoseKeypoints>, min_conf: f32) -> Self {
        let stats = ReferenceStats::from_frames(&frames, min_conf);
        Self {
            id: id.into(),
            frames,
            stats,
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// 平均姿态: 每个关节取可信观测的均值, 从未可信的关节置信度为 0
    pub fn mean_pose(&self, min_conf: f32) -> Option<PoseKeypoints> {
        if self.frames.is_empty() {
            return None;
        }
        let joints = self
            .frames
            .iter()
            .map(|kp| kp.points.len())
            .max()
            .unwrap_or(NUM_KEYPOINTS);

        let mut sums = vec![(0.0_f32, 0.0_f32, 0.0_f32, 0_u32); joints];
        for kp in &self.frames {
            for (idx, sum) in sums.iter_mut().enumerate() {
                if let Some((x, y)) = kp.point(idx, min_conf) {
                    sum.0 += x;
                    sum.1 += y;
                    sum.2 += kp.points[idx].2;
                    sum.3 += 1;
                }
            }
        }

        Some(PoseKeypoints::new(
            sums.into_iter()
                .map(|(x, y, c, n)| {
                    if n == 0 {
                        (0.0, 0.0, 0.0)
                    } else {
                        let n = n as f32;
                        (x / n, y / n, c / n)
                    }
                })
                .collect(),
        ))
    }

    /// 指定参考帧的指标值
    pub fn metric_at(&self, frame: usize, key: &MetricKey, min_conf: f32) -> Option<f32> {
        key.compute(self.frames.get(frame)?, min_conf)
    }
}

/// 参考库条目: 参考动作 + 预计算的平均姿态与特征序列
#[derive(Clone, Debug)]
pub struct ReferenceEntry {
    pub profile: ReferenceProfile,
    pub mean_pose: Option<PoseKeypoints>,
    pub features: Array2<f32>,
}

/// JSON 文件内容: 单个参考动作或数组
#[derive(Deserialize)]
#[serde(untagged)]
enum ProfileFile {
    Many(Vec<ReferenceProfile>),
    One(ReferenceProfile),
}

/// 参考动作库
#[derive(Clone, Debug, Default)]
pub struct ReferenceLibrary {
    entries: Vec<ReferenceEntry>,
    min_conf: f32,
}

impl ReferenceLibrary {
    /// 构建参考库
    ///
    /// 没有帧的参考动作与重复ID都是错误; 统计表为空时自动统计
    pub fn new(profiles: Vec<ReferenceProfile>, min_conf: f32) -> Result<Self, ProfileError> {
        let mut entries: Vec<ReferenceEntry> = Vec::with_capacity(profiles.len());
        for mut profile in profiles {
            if profile.frames.is_empty() {
                return Err(ProfileError::EmptySequence(profile.id));
            }
            if entries.iter().any(|e| e.profile.id == profile.id) {
                return Err(ProfileError::DuplicateId(profile.id));
            }
            if profile.stats.is_empty() {
                profile.stats = ReferenceStats::from_frames(&profile.frames, min_conf);
            }
            let mean_pose = profile.mean_pose(min_conf);
            let features = sequence_features(&profile.frames, min_conf);
            entries.push(ReferenceEntry {
                profile,
                mean_pose,
                features,
            });
        }
        Ok(Self { entries, min_conf })
    }

    /// 从JSON字符串解析 (单个对象或数组)
    pub fn parse_profiles(json: &str) -> Result<Vec<ReferenceProfile>, ProfileError> {
        Ok(match serde_json::from_str::<ProfileFile>(json)? {
            ProfileFile::Many(profiles) => profiles,
            ProfileFile::One(profile) => vec![profile],
        })
    }

    /// 从多个JSON文件加载
    pub fn load_json<P: AsRef<Path>>(paths: &[P], min_conf: f32) -> Result<Self, ProfileError> {
        let mut profiles = Vec::new();
        for path in paths {
            let path = path.as_ref();
            let json = fs::read_to_string(path).map_err(|source| ProfileError::Io {
                path: path.display().to_string(),
                source,
            })?;
            profiles.extend(Self::parse_profiles(&json)?);
        }
        let library = Self::new(profiles, min_conf)?;
        info!(count = library.len(), "参考动作已加载");
        Ok(library)
    }

    pub fn get(&self, id: &str) -> Option<&ReferenceEntry> {
        self.entries.iter().find(|e| e.profile.id == id)
    }

    pub fn entries(&self) -> &[ReferenceEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn min_conf(&self) -> f32 {
        self.min_conf
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::alignment::FEATURE_DIM;
    use crate::detection::types::tests::standing_pose;
    use crate::detection::types::{LEFT_ELBOW, LEFT_WRIST, RIGHT_ELBOW, RIGHT_WRIST};
    use crate::posture::metrics::{MetricKind, Side};

    /// 双臂上举的姿态
    pub(crate) fn arms_up_pose(cx: f32, top: f32, scale: f32) -> PoseKeypoints {
        let mut kp = standing_pose(cx, top, scale);
        let s = scale / 100.0;
        kp.points[LEFT_ELBOW] = (cx - 14.0 * s, top + 2.0 * s, 0.9);
        kp.points[RIGHT_ELBOW] = (cx + 14.0 * s, top + 2.0 * s, 0.9);
        kp.points[LEFT_WRIST] = (cx - 15.0 * s, top - 12.0 * s, 0.9);
        kp.points[RIGHT_WRIST] = (cx + 15.0 * s, top - 12.0 * s, 0.9);
        kp
    }

    #[test]
    fn test_stats_lookup_falls_back_to_unsided() {
        let mut stats = ReferenceStats::default();
        stats.0.insert("arm_angle".into(), MetricStats { mean: 90.0, std: 4.0 });
        stats.0.insert("arm_angle.right".into(), MetricStats { mean: 45.0, std: 5.0 });

        let left = MetricKey::new(MetricKind::ArmAngle, Some(Side::Left));
        let right = MetricKey::new(MetricKind::ArmAngle, Some(Side::Right));
        assert_eq!(stats.get(&left).unwrap().mean, 90.0);
        assert_eq!(stats.get(&right).unwrap().mean, 45.0);
        assert!(stats.get(&MetricKey::new(MetricKind::TorsoLean, None)).is_none());
    }

    #[test]
    fn test_stats_json_shape() {
        let json = r#"{ "arm_angle.left": { "mean": 45.0, "std": 5.0 } }"#;
        let stats: ReferenceStats = serde_json::from_str(json).unwrap();
        let key: MetricKey = "arm_angle.left".parse().unwrap();
        assert_eq!(stats.get(&key), Some(MetricStats { mean: 45.0, std: 5.0 }));
    }

    #[test]
    fn test_from_frames_derives_stats() {
        let frames = vec![standing_pose(100.0, 0.0, 200.0); 5];
        let profile = ReferenceProfile::from_frames("stand", frames, 0.3);
        let torso = profile
            .stats
            .get(&MetricKey::new(MetricKind::TorsoLean, None))
            .unwrap();
        assert!(torso.mean.abs() < 1e-3);
        assert_eq!(torso.std, 0.0);
        assert_eq!(profile.stats.len(), MetricKey::all().len());

        let key = MetricKey::new(MetricKind::TorsoLean, None);
        let first = profile.metric_at(0, &key, 0.3).unwrap();
        assert!((first - torso.mean).abs() < 1e-4);
        assert!(profile.metric_at(5, &key, 0.3).is_none());
    }

    #[test]
    fn test_mean_pose() {
        let profile = ReferenceProfile {
            id: "p".into(),
            frames: vec![standing_pose(100.0, 0.0, 100.0), standing_pose(110.0, 0.0, 100.0)],
            stats: ReferenceStats::default(),
        };
        let mean = profile.mean_pose(0.3).unwrap();
        let expected = standing_pose(105.0, 0.0, 100.0);
        for (a, b) in mean.points.iter().zip(&expected.points) {
            assert!((a.0 - b.0).abs() < 1e-4 && (a.1 - b.1).abs() < 1e-4);
        }
    }

    #[test]
    fn test_library_rejects_empty_and_duplicate() {
        let empty = ReferenceProfile {
            id: "empty".into(),
            frames: Vec::new(),
            stats: ReferenceStats::default(),
        };
        assert!(matches!(
            ReferenceLibrary::new(vec![empty], 0.3),
            Err(ProfileError::EmptySequence(id)) if id == "empty"
        ));

        let p = ReferenceProfile::from_frames("a", vec![standing_pose(0.0, 0.0, 100.0)], 0.3);
        assert!(matches!(
            ReferenceLibrary::new(vec![p.clone(), p], 0.3),
            Err(ProfileError::DuplicateId(_))
        ));
    }

    #[test]
    fn test_library_precomputes_features() {
        let frames = vec![standing_pose(0.0, 0.0, 100.0); 3];
        let profile = ReferenceProfile {
            id: "a".into(),
            frames,
            stats: ReferenceStats::default(),
        };
        let library = ReferenceLibrary::new(vec![profile], 0.3).unwrap();
        let entry = library.get("a").unwrap();
        assert_eq!(entry.features.dim(), (3, FEATURE_DIM));
        assert!(entry.mean_pose.is_some());
        // 空统计表自动补齐
        assert!(!entry.profile.stats.is_empty());
        assert!(library.get("b").is_none());
    }

    #[test]
    fn test_parse_single_and_array() {
        let one = r#"{ "id": "a", "frames": [[[0.0, 0.0, 0.9]]] }"#;
        assert_eq!(ReferenceLibrary::parse_profiles(one).unwrap().len(), 1);
        let many = r#"[{ "id": "a", "frames": [] }, { "id": "b" }]"#;
        let profiles = ReferenceLibrary::parse_profiles(many).unwrap();
        assert_eq!(profiles[1].id, "b");
        assert!(ReferenceLibrary::parse_profiles("{").is_err());
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let err = ReferenceLibrary::load_json(&["/nonexistent/profile.json"], 0.3).unwrap_err();
        assert!(matches!(err, ProfileError::Io { .. }));
    }
}
