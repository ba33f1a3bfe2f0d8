//! 身份 → 参考动作 匹配
//!
//! 对每个稳定身份, 计算其当前姿态与各参考动作平均姿态的归一化相似度
//! (与位置、尺度无关), 相似度超过阈值时绑定最相似的参考动作。
//! 已有绑定只要相似度仍在阈值之上就保持不变。

use std::collections::BTreeMap;

use tracing::{debug, info};

use super::ReferenceLibrary;
use crate::config::MatcherConfig;
use crate::detection::types::PoseKeypoints;

/// 归一化姿态相似度 ∈ [0, 1]
///
/// 只使用双方都可信的关节: 以公共关节质心为原点, 缩放到单位 RMS 半径,
/// 相似度 = (1 + cos) / 2。公共关节不足 `min_common` 时返回 None
pub fn pose_similarity(
    a: &PoseKeypoints,
    b: &PoseKeypoints,
    min_conf: f32,
    min_common: usize,
) -> Option<f32> {
    let n = a.points.len().min(b.points.len());
    let (pa, pb): (Vec<(f32, f32)>, Vec<(f32, f32)>) = (0..n)
        .filter_map(|i| Some((a.point(i, min_conf)?, b.point(i, min_conf)?)))
        .unzip();
    if pa.len() < min_common.max(2) {
        return None;
    }

    let va = normalize(&pa)?;
    let vb = normalize(&pb)?;
    let dot: f32 = va.iter().zip(&vb).map(|(x, y)| x * y).sum();
    let na = va.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb = vb.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na < 1e-9 || nb < 1e-9 {
        return None;
    }
    let cos = (dot / (na * nb)).clamp(-1.0, 1.0);
    Some((1.0 + cos) / 2.0)
}

/// 去中心 + 单位 RMS 半径, 展平为 [x0, y0, x1, y1, ...]
fn normalize(points: &[(f32, f32)]) -> Option<Vec<f32>> {
    let n = points.len() as f32;
    let cx = points.iter().map(|p| p.0).sum::<f32>() / n;
    let cy = points.iter().map(|p| p.1).sum::<f32>() / n;
    let rms = (points
        .iter()
        .map(|(x, y)| (x - cx).powi(2) + (y - cy).powi(2))
        .sum::<f32>()
        / n)
        .sqrt();
    if rms < 1e-6 {
        return None;
    }
    Some(
        points
            .iter()
            .flat_map(|(x, y)| [(x - cx) / rms, (y - cy) / rms])
            .collect(),
    )
}

/// 参考动作匹配器 (每个会话一个)
#[derive(Clone, Debug)]
pub struct ReferenceMatcher {
    config: MatcherConfig,
    bindings: BTreeMap<u32, String>,
    frames_seen: u64,
}

impl ReferenceMatcher {
    pub fn new(config: MatcherConfig) -> Self {
        Self {
            config,
            bindings: BTreeMap::new(),
            frames_seen: 0,
        }
    }

    /// 匹配稳定身份, 返回本帧 {身份: 参考动作ID}
    ///
    /// 未绑定的身份每帧都尝试匹配; 已绑定的身份每 `match_interval` 帧复核一次
    pub fn match_tracks(
        &mut self,
        stable: &[(u32, &PoseKeypoints)],
        library: &ReferenceLibrary,
    ) -> BTreeMap<u32, String> {
        let recheck = self.frames_seen % self.config.match_interval.max(1) == 0;
        self.frames_seen += 1;

        let mut result = BTreeMap::new();
        for &(id, keypoints) in stable {
            let current = self.bindings.get(&id).cloned();
            if let (Some(profile_id), false) = (&current, recheck) {
                result.insert(id, profile_id.clone());
                continue;
            }

            let best = self.best_profile(keypoints, library);
            let sticky = current.as_ref().and_then(|profile_id| {
                let sim = self.similarity_to(keypoints, library, profile_id)?;
                (sim >= self.config.similarity_threshold).then(|| profile_id.clone())
            });

            match sticky.or_else(|| best.map(|(profile_id, _)| profile_id)) {
                Some(profile_id) => {
                    if current.as_deref() != Some(profile_id.as_str()) {
                        info!(track = id, profile = %profile_id, "身份绑定参考动作");
                    }
                    self.bindings.insert(id, profile_id.clone());
                    result.insert(id, profile_id);
                }
                None => {
                    if let Some(old) = self.bindings.remove(&id) {
                        debug!(track = id, profile = %old, "相似度低于阈值, 解除绑定");
                    }
                }
            }
        }
        result
    }

    fn similarity_to(
        &self,
        keypoints: &PoseKeypoints,
        library: &ReferenceLibrary,
        profile_id: &str,
    ) -> Option<f32> {
        let mean = library.get(profile_id)?.mean_pose.as_ref()?;
        pose_similarity(
            keypoints,
            mean,
            self.config.min_keypoint_confidence,
            self.config.min_common_joints,
        )
    }

    /// 相似度最高且超过阈值的参考动作
    fn best_profile(
        &self,
        keypoints: &PoseKeypoints,
        library: &ReferenceLibrary,
    ) -> Option<(String, f32)> {
        library
            .entries()
            .iter()
            .filter_map(|entry| {
                let sim = pose_similarity(
                    keypoints,
                    entry.mean_pose.as_ref()?,
                    self.config.min_keypoint_confidence,
                    self.config.min_common_joints,
                )?;
                Some((entry.profile.id.clone(), sim))
            })
            .filter(|(_, sim)| *sim >= self.config.similarity_threshold)
            .fold(None, |best: Option<(String, f32)>, cand| match best {
                Some(b) if b.1 >= cand.1 => Some(b),
                _ => Some(cand),
            })
    }

    /// 当前绑定
    pub fn binding(&self, id: u32) -> Option<&str> {
        self.bindings.get(&id).map(String::as_str)
    }

    /// 丢弃已不存在的身份
    pub fn retain(&mut self, alive: impl Fn(u32) -> bool) {
        self.bindings.retain(|id, _| alive(*id));
    }

    pub fn reset(&mut self) {
        self.bindings.clear();
        self.frames_seen = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::types::tests::standing_pose;
    use crate::detection::types::{LEFT_ELBOW, LEFT_WRIST, RIGHT_ELBOW, RIGHT_WRIST};
    use crate::reference::tests::arms_up_pose;
    use crate::reference::ReferenceProfile;

    fn library() -> ReferenceLibrary {
        let stand = ReferenceProfile::from_frames(
            "stand",
            vec![standing_pose(100.0, 0.0, 100.0); 3],
            0.3,
        );
        let up = ReferenceProfile::from_frames("up", vec![arms_up_pose(100.0, 0.0, 100.0); 3], 0.3);
        ReferenceLibrary::new(vec![stand, up], 0.3).unwrap()
    }

    fn matcher(threshold: f32) -> ReferenceMatcher {
        ReferenceMatcher::new(MatcherConfig {
            similarity_threshold: threshold,
            ..MatcherConfig::default()
        })
    }

    /// 双臂平举
    fn arms_level_pose(cx: f32, top: f32, scale: f32) -> PoseKeypoints {
        let mut kp = standing_pose(cx, top, scale);
        let s = scale / 100.0;
        kp.points[LEFT_ELBOW] = (cx - 28.0 * s, top + 18.0 * s, 0.9);
        kp.points[RIGHT_ELBOW] = (cx + 28.0 * s, top + 18.0 * s, 0.9);
        kp.points[LEFT_WRIST] = (cx - 44.0 * s, top + 18.0 * s, 0.9);
        kp.points[RIGHT_WRIST] = (cx + 44.0 * s, top + 18.0 * s, 0.9);
        kp
    }

    #[test]
    fn test_similarity_is_translation_and_scale_invariant() {
        let a = standing_pose(100.0, 0.0, 100.0);
        let b = standing_pose(640.0, 220.0, 310.0);
        let sim = pose_similarity(&a, &b, 0.3, 6).unwrap();
        assert!((sim - 1.0).abs() < 1e-4);

        let up = arms_up_pose(100.0, 0.0, 100.0);
        let sim_up = pose_similarity(&a, &up, 0.3, 6).unwrap();
        assert!(sim_up < 0.95 && sim_up > 0.5);
    }

    #[test]
    fn test_too_few_common_joints() {
        let a = standing_pose(100.0, 0.0, 100.0);
        let mut b = a.clone();
        for p in b.points.iter_mut().skip(4) {
            p.2 = 0.0;
        }
        assert!(pose_similarity(&a, &b, 0.3, 6).is_none());
    }

    #[test]
    fn test_best_profile_is_bound() {
        let lib = library();
        let mut m = matcher(0.95);
        let up = arms_up_pose(500.0, 80.0, 180.0);
        let stand = standing_pose(900.0, 80.0, 180.0);
        let result = m.match_tracks(&[(1, &up), (2, &stand)], &lib);
        assert_eq!(result.get(&1).map(String::as_str), Some("up"));
        assert_eq!(result.get(&2).map(String::as_str), Some("stand"));
    }

    #[test]
    fn test_below_threshold_is_unmatched() {
        let lib = library();
        let mut m = matcher(0.99);
        let level = arms_level_pose(100.0, 0.0, 100.0);
        assert!(m.match_tracks(&[(1, &level)], &lib).is_empty());
        assert!(m.binding(1).is_none());
    }

    #[test]
    fn test_binding_is_sticky_above_threshold() {
        let lib = library();
        let mut m = matcher(0.95);
        let stand = standing_pose(100.0, 0.0, 100.0);
        m.match_tracks(&[(1, &stand)], &lib);
        assert_eq!(m.binding(1), Some("stand"));

        // 平举与上举略更相似, 但与原绑定仍超过阈值
        let level = arms_level_pose(100.0, 0.0, 100.0);
        let result = m.match_tracks(&[(1, &level)], &lib);
        assert_eq!(result.get(&1).map(String::as_str), Some("stand"));

        // 无绑定的新身份选择最相似的
        let result = m.match_tracks(&[(2, &level)], &lib);
        assert_eq!(result.get(&2).map(String::as_str), Some("up"));

        // 原绑定跌破阈值后重新匹配
        let up = arms_up_pose(100.0, 0.0, 100.0);
        let result = m.match_tracks(&[(1, &up)], &lib);
        assert_eq!(result.get(&1).map(String::as_str), Some("up"));
    }

    #[test]
    fn test_match_interval_skips_recheck() {
        let lib = library();
        let mut m = ReferenceMatcher::new(MatcherConfig {
            similarity_threshold: 0.95,
            match_interval: 5,
            ..MatcherConfig::default()
        });
        let stand = standing_pose(100.0, 0.0, 100.0);
        let up = arms_up_pose(100.0, 0.0, 100.0);
        m.match_tracks(&[(1, &stand)], &lib);
        // 复核间隔内保持原绑定
        for _ in 0..4 {
            let result = m.match_tracks(&[(1, &up)], &lib);
            assert_eq!(result.get(&1).map(String::as_str), Some("stand"));
        }
        let result = m.match_tracks(&[(1, &up)], &lib);
        assert_eq!(result.get(&1).map(String::as_str), Some("up"));
    }

    #[test]
    fn test_retain_and_reset() {
        let lib = library();
        let mut m = matcher(0.95);
        let stand = standing_pose(100.0, 0.0, 100.0);
        m.match_tracks(&[(1, &stand), (2, &stand)], &lib);
        m.retain(|id| id == 2);
        assert!(m.binding(1).is_none());
        assert_eq!(m.binding(2), Some("stand"));
        m.reset();
        assert!(m.binding(2).is_none());
    }
}
