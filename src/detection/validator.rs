//! 轨迹稳定性校验
//!
//! 同一个人的肢体/躯干长度比在帧间基本恒定。ID 切换到另一个人或检测到
//! 残缺人体时比例会跳变, 因此用滑动窗口内比例的标准差判断轨迹是否可信。
//! 轨迹一旦判定为稳定便一直保持, 直到被移除。

use std::collections::{HashMap, VecDeque};

use crate::config::ValidatorConfig;
use crate::detection::types::PoseKeypoints;

#[derive(Clone, Debug, Default)]
struct RatioWindow {
    ratios: VecDeque<f32>,
    frames_seen: u32,
    stable: bool,
}

/// 轨迹校验器
#[derive(Clone, Debug)]
pub struct TrackValidator {
    config: ValidatorConfig,
    min_conf: f32,
    tracks: HashMap<u32, RatioWindow>,
}

impl TrackValidator {
    pub fn new(config: ValidatorConfig, min_conf: f32) -> Self {
        Self {
            config,
            min_conf,
            tracks: HashMap::new(),
        }
    }

    /// 记录一次关联到检测的观测, 返回该轨迹当前是否稳定
    pub fn observe(&mut self, id: u32, keypoints: &PoseKeypoints) -> bool {
        let window = self.config.window.max(1);
        let state = self.tracks.entry(id).or_default();
        state.frames_seen += 1;

        if let Some(ratio) = keypoints.limb_torso_ratio(self.min_conf) {
            state.ratios.push_back(ratio);
            while state.ratios.len() > window {
                state.ratios.pop_front();
            }
        }

        if !state.stable
            && state.frames_seen >= self.config.min_frames
            && state.ratios.len() >= self.config.min_samples.max(1)
            && ratio_std(&state.ratios) < self.config.ratio_tolerance
        {
            state.stable = true;
            tracing::debug!(track = id, frames = state.frames_seen, "轨迹判定为稳定");
        }
        state.stable
    }

    pub fn is_stable(&self, id: u32) -> bool {
        self.tracks.get(&id).is_some_and(|s| s.stable)
    }

    /// 轨迹被移除时丢弃其状态
    pub fn forget(&mut self, id: u32) {
        self.tracks.remove(&id);
    }

    pub fn reset(&mut self) {
        self.tracks.clear();
    }
}

fn ratio_std(ratios: &VecDeque<f32>) -> f32 {
    let n = ratios.len() as f32;
    let mean = ratios.iter().sum::<f32>() / n;
    (ratios.iter().map(|r| (r - mean).powi(2)).sum::<f32>() / n).sqrt()
}
