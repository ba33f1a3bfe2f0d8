//! 固定队形身份分配
//! Formation-based identity assignment for drills with a known line-up
//!
//! 队列训练中队员站位固定、外观相似, 运动模型容易在交叉时互换ID。
//! 初始化窗口内按排序轴确定每个站位, 之后按与站位的距离和肢体比例做最优分配。

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::assignment::linear_assignment;
use super::tracker::{AppearanceSource, TrackSnapshot, TrackState, Tracker, TrackerOutput};
use super::types::{BBox, Detection, PoseKeypoints};
use super::validator::TrackValidator;
use crate::config::{FormationConfig, ValidatorConfig};

/// 站位排序轴
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormationAxis {
    /// 横排 (从左到右)
    #[default]
    X,
    /// 纵列 (从上到下)
    Y,
}

impl FormationAxis {
    fn key(&self, bbox: &BBox) -> f32 {
        let (cx, cy) = bbox.center();
        match self {
            FormationAxis::X => cx,
            FormationAxis::Y => cy,
        }
    }
}

/// 单个站位
#[derive(Clone, Debug)]
struct Slot {
    id: u32,
    state: TrackState,
    center: (f32, f32),
    ratio: Option<f32>,
    bbox: BBox,
    keypoints: PoseKeypoints,
    hits: u32,
    frames_lost: u32,
    visible: bool,
    score: f32,

    // 初始化窗口累计
    sum_center: (f32, f32),
    sum_ratio: f32,
    ratio_count: u32,
}

impl Slot {
    fn new(id: u32) -> Self {
        Self {
            id,
            state: TrackState::New,
            center: (0.0, 0.0),
            ratio: None,
            bbox: BBox::default(),
            keypoints: PoseKeypoints::default(),
            hits: 0,
            frames_lost: 0,
            visible: false,
            score: 0.0,
            sum_center: (0.0, 0.0),
            sum_ratio: 0.0,
            ratio_count: 0,
        }
    }

    fn observe(&mut self, det: &Detection) {
        self.bbox = det.bbox;
        self.keypoints = det.keypoints.clone();
        self.hits += 1;
        self.frames_lost = 0;
        self.visible = true;
        self.score = det.confidence;
        self.state = TrackState::Tracked;
    }

    fn snapshot(&self) -> TrackSnapshot {
        TrackSnapshot {
            id: self.id,
            state: self.state,
            bbox: self.bbox,
            keypoints: self.keypoints.clone(),
            visible: self.visible,
            hits: self.hits,
            frames_lost: self.frames_lost,
            score: self.score,
        }
    }
}

/// 队形分配器
pub struct FormationAssigner {
    config: FormationConfig,
    max_lost_frames: u32,
    min_keypoint_conf: f32,
    slots: Vec<Slot>,
    /// 已累计的有效初始化帧数
    init_seen: usize,
    locked: bool,
    validator: TrackValidator,
}

impl FormationAssigner {
    pub fn new(
        config: FormationConfig,
        validator: ValidatorConfig,
        max_lost_frames: u32,
        min_keypoint_conf: f32,
    ) -> Self {
        Self {
            config,
            max_lost_frames,
            min_keypoint_conf,
            slots: Vec::new(),
            init_seen: 0,
            locked: false,
            validator: TrackValidator::new(validator, min_keypoint_conf),
        }
    }

    /// 队形是否已锁定
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// 初始化阶段: 人数恰好等于站位数时按排序轴绑定
    fn init_step(&mut self, mut confident: Vec<&Detection>, frame_index: u64) {
        if self.slots.is_empty() {
            self.slots = (1..=self.config.slots as u32).map(Slot::new).collect();
        }
        if confident.len() != self.config.slots {
            return;
        }

        let axis = self.config.axis;
        confident.sort_by(|a, b| axis.key(&a.bbox).total_cmp(&axis.key(&b.bbox)));
        for (slot, det) in self.slots.iter_mut().zip(confident) {
            let (cx, cy) = det.bbox.center();
            slot.sum_center.0 += cx;
            slot.sum_center.1 += cy;
            if let Some(r) = det.keypoints.limb_torso_ratio(self.min_keypoint_conf) {
                slot.sum_ratio += r;
                slot.ratio_count += 1;
            }
            slot.observe(det);
            self.validator.observe(slot.id, &det.keypoints);
        }
        self.init_seen += 1;

        if self.init_seen >= self.config.init_frames.max(1) {
            let n = self.init_seen as f32;
            for slot in &mut self.slots {
                slot.center = (slot.sum_center.0 / n, slot.sum_center.1 / n);
                slot.ratio = (slot.ratio_count > 0).then(|| slot.sum_ratio / slot.ratio_count as f32);
            }
            self.locked = true;
            info!(
                slots = self.config.slots,
                frame = frame_index,
                "队形已锁定"
            );
        }
    }

    /// 锁定后: 站位距离 + 肢体比例的最优分配
    fn assign_step(&mut self, confident: Vec<&Detection>) {
        let ratios: Vec<Option<f32>> = confident
            .iter()
            .map(|d| d.keypoints.limb_torso_ratio(self.min_keypoint_conf))
            .collect();

        let cost: Vec<Vec<f64>> = self
            .slots
            .iter()
            .map(|slot| {
                confident
                    .iter()
                    .zip(&ratios)
                    .map(|(det, ratio)| {
                        let (cx, cy) = det.bbox.center();
                        let h = det.bbox.height().max(1.0);
                        let dist = ((cx - slot.center.0).powi(2) + (cy - slot.center.1).powi(2))
                            .sqrt()
                            / h;
                        let ratio_diff = match (slot.ratio, ratio) {
                            (Some(a), Some(b)) => (a - b).abs(),
                            _ => 0.0,
                        };
                        (dist + self.config.ratio_weight * ratio_diff) as f64
                    })
                    .collect()
            })
            .collect();

        let result = linear_assignment(&cost, confident.len(), self.config.max_distance as f64);
        let alpha = self.config.ema_alpha.clamp(0.0, 1.0);
        let mut matched = vec![false; self.slots.len()];

        for &(si, di) in &result.matches {
            let det = confident[di];
            let slot = &mut self.slots[si];
            let (cx, cy) = det.bbox.center();
            slot.center = (
                (1.0 - alpha) * slot.center.0 + alpha * cx,
                (1.0 - alpha) * slot.center.1 + alpha * cy,
            );
            if let Some(r) = ratios[di] {
                slot.ratio = Some(match slot.ratio {
                    Some(prev) => (1.0 - alpha) * prev + alpha * r,
                    None => r,
                });
            }
            slot.observe(det);
            self.validator.observe(slot.id, &det.keypoints);
            matched[si] = true;
        }

        for (slot, _) in self.slots.iter_mut().zip(&matched).filter(|(_, m)| !**m) {
            slot.frames_lost += 1;
            slot.state = if slot.frames_lost > self.max_lost_frames {
                TrackState::Removed
            } else {
                TrackState::Lost
            };
        }

        if !result.unmatched_cols.is_empty() {
            debug!(count = result.unmatched_cols.len(), "检测未分配到任何站位");
        }
    }
}

impl Tracker for FormationAssigner {
    fn update(
        &mut self,
        detections: &[Detection],
        frame_index: u64,
        _appearance: Option<&dyn AppearanceSource>,
    ) -> TrackerOutput {
        for slot in &mut self.slots {
            slot.visible = false;
        }

        let confident: Vec<&Detection> = detections
            .iter()
            .filter(|d| d.confidence >= self.config.min_confidence)
            .collect();

        if self.locked {
            self.assign_step(confident);
        } else {
            self.init_step(confident, frame_index);
        }

        // 站位固定, 超出丢失窗口的站位不对外输出, 重新出现时沿用原ID
        let live: Vec<&Slot> = self
            .slots
            .iter()
            .filter(|s| s.hits > 0 && s.state != TrackState::Removed)
            .collect();

        TrackerOutput {
            visible: live.iter().filter(|s| s.visible).map(|s| s.id).collect(),
            stable: live
                .iter()
                .filter(|s| self.validator.is_stable(s.id))
                .map(|s| s.id)
                .collect(),
            tracks: live.iter().map(|s| s.snapshot()).collect(),
            singular: false,
        }
    }

    fn reset(&mut self) {
        self.slots.clear();
        self.init_seen = 0;
        self.locked = false;
        self.validator.reset();
    }

    fn track_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.hits > 0 && s.state != TrackState::Removed)
            .count()
    }
}
