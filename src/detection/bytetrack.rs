//! ByteTrack 式身份跟踪
//! ByteTrack-style identity tracking with three-stage association
//!
//! 核心思想:
//! 1. 高低分检测框分开处理
//! 2. 高分框优先与新建/跟踪中的轨迹匹配 (IoU, 可选外观)
//! 3. 低分框救援未匹配的跟踪中轨迹
//! 4. 剩余高分框找回丢失窗口内的轨迹, ID 不变
//!
//! 匹配使用匈牙利算法求全局最优, ID 严格递增且不复用

use std::collections::VecDeque;

use tracing::{debug, trace};

use super::assignment::linear_assignment;
use super::tracker::{
    compute_iou, motion_noise_scales, AppearanceSource, KalmanBoxFilter, KalmanKeypointFilter,
    PoseEmbedding, TrackSnapshot, TrackState, Tracker, TrackerOutput,
};
use super::types::{cosine_similarity, BBox, Detection, PoseKeypoints};
use super::validator::TrackValidator;
use crate::config::{TrackingConfig, ValidatorConfig};

/// 单条身份轨迹
#[derive(Clone, Debug)]
pub struct IdentityTrack {
    /// 唯一跟踪ID
    pub id: u32,

    pub state: TrackState,

    /// 当前边界框 (卡尔曼滤波平滑后)
    pub bbox: BBox,

    kalman: KalmanBoxFilter,
    keypoint_filter: Option<KalmanKeypointFilter>,

    /// 最近一次关联到的原始关键点
    keypoints: PoseKeypoints,

    /// 外观特征 (EMA, L2 归一化)
    embedding: Option<Vec<f32>>,

    /// 最近一次观测到的框 (计算速度用)
    last_observed: BBox,

    /// 相对框高的中心位移历史
    speeds: VecDeque<f32>,

    /// 检测置信度历史
    scores: VecDeque<f32>,

    /// 连续丢失帧数
    pub frames_lost: u32,

    /// 累计关联次数
    pub hits: u32,

    pub start_frame: u64,
    pub last_frame: u64,

    /// 本帧是否有检测关联
    visible: bool,
}

impl IdentityTrack {
    fn new(
        id: u32,
        detection: &Detection,
        embedding: Option<Vec<f32>>,
        frame_index: u64,
        config: &TrackingConfig,
    ) -> Self {
        let kalman = KalmanBoxFilter::new(
            &detection.bbox,
            config.kalman_std_weight_position,
            config.kalman_std_weight_velocity,
        );
        let keypoint_filter = config.predict_keypoints.then(|| {
            KalmanKeypointFilter::new(
                &detection.keypoints,
                config.keypoint_process_noise,
                config.keypoint_measurement_noise,
                config.min_keypoint_confidence,
            )
        });

        let mut scores = VecDeque::with_capacity(config.history_length.max(1));
        scores.push_back(detection.confidence);

        Self {
            id,
            state: TrackState::New,
            bbox: kalman.get_state_bbox(),
            kalman,
            keypoint_filter,
            keypoints: detection.keypoints.clone(),
            embedding,
            last_observed: detection.bbox,
            speeds: VecDeque::with_capacity(config.motion_history.max(1)),
            scores,
            frames_lost: 0,
            hits: 1,
            start_frame: frame_index,
            last_frame: frame_index,
            visible: true,
        }
    }

    fn noise_scales(&self, config: &TrackingConfig) -> (f64, f64) {
        let speeds: Vec<f32> = self.speeds.iter().copied().collect();
        motion_noise_scales(&speeds, config.motion_reference_speed, config.max_noise_scale)
    }

    fn predict(&mut self, config: &TrackingConfig) {
        let (q_scale, _) = self.noise_scales(config);
        self.kalman.predict(q_scale);
        if let Some(filter) = &mut self.keypoint_filter {
            filter.predict(q_scale);
        }
        self.bbox = self.kalman.get_state_bbox();
        self.visible = false;
    }

    /// 融合检测, 返回是否使用了伪逆
    fn update(
        &mut self,
        detection: &Detection,
        embedding: Option<Vec<f32>>,
        frame_index: u64,
        config: &TrackingConfig,
    ) -> bool {
        let gap = frame_index.saturating_sub(self.last_frame).max(1) as f32;
        let (ox, oy) = self.last_observed.center();
        let (nx, ny) = detection.bbox.center();
        let height = detection.bbox.height().max(1.0);
        let speed = ((nx - ox).powi(2) + (ny - oy).powi(2)).sqrt() / height / gap;
        self.speeds.push_back(speed);
        while self.speeds.len() > config.motion_history.max(1) {
            self.speeds.pop_front();
        }

        let (_, r_scale) = self.noise_scales(config);
        let singular = self.kalman.update(&detection.bbox, r_scale);
        if let Some(filter) = &mut self.keypoint_filter {
            filter.update(&detection.keypoints, r_scale);
        }
        self.bbox = self.kalman.get_state_bbox();
        self.keypoints = detection.keypoints.clone();
        self.last_observed = detection.bbox;

        if let Some(new) = embedding {
            self.embedding = Some(match self.embedding.take() {
                Some(old) if old.len() == new.len() => {
                    blend_embedding(&old, &new, config.embedding_momentum)
                }
                _ => new,
            });
        }

        self.scores.push_back(detection.confidence);
        while self.scores.len() > config.history_length.max(1) {
            self.scores.pop_front();
        }

        self.frames_lost = 0;
        self.hits += 1;
        self.last_frame = frame_index;
        self.visible = true;
        singular
    }

    fn mark_missed(&mut self) {
        self.frames_lost += 1;
    }

    /// 当前关键点: 开启关键点预测时取滤波结果, 否则取最近观测
    pub fn keypoints(&self) -> PoseKeypoints {
        match &self.keypoint_filter {
            Some(filter) => filter.keypoints(),
            None => self.keypoints.clone(),
        }
    }

    pub fn mean_score(&self) -> f32 {
        if self.scores.is_empty() {
            return 0.0;
        }
        self.scores.iter().sum::<f32>() / self.scores.len() as f32
    }

    fn snapshot(&self) -> TrackSnapshot {
        TrackSnapshot {
            id: self.id,
            state: self.state,
            bbox: self.bbox,
            keypoints: self.keypoints(),
            visible: self.visible,
            hits: self.hits,
            frames_lost: self.frames_lost,
            score: self.mean_score(),
        }
    }
}

fn blend_embedding(old: &[f32], new: &[f32], momentum: f32) -> Vec<f32> {
    let m = momentum.clamp(0.0, 1.0);
    let mut out: Vec<f32> = old
        .iter()
        .zip(new)
        .map(|(a, b)| m * a + (1.0 - m) * b)
        .collect();
    let norm = out.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 1e-6 {
        out.iter_mut().for_each(|x| *x /= norm);
    }
    out
}

/// 一次关联的结果 (轨迹下标, 检测下标)
struct StageResult {
    matches: Vec<(usize, usize)>,
    unmatched_dets: Vec<usize>,
}

/// 身份跟踪器
pub struct IdentityTracker {
    /// 存活轨迹 (New / Tracked / Lost)
    tracks: Vec<IdentityTrack>,

    /// 下一个分配的ID
    next_id: u32,

    config: TrackingConfig,
    validator: TrackValidator,

    /// 已处理的帧数 (第一帧的新轨迹直接确认)
    frames_processed: u64,
}

impl IdentityTracker {
    pub fn new(config: TrackingConfig, validator: ValidatorConfig) -> Self {
        let validator = TrackValidator::new(validator, config.min_keypoint_confidence);
        Self {
            tracks: Vec::new(),
            next_id: 1,
            config,
            validator,
            frames_processed: 0,
        }
    }

    pub fn tracks(&self) -> &[IdentityTrack] {
        &self.tracks
    }

    /// 在给定轨迹与检测之间做最优匹配
    fn associate(
        &self,
        track_indices: &[usize],
        det_indices: &[usize],
        detections: &[Detection],
        embeddings: &[Option<Vec<f32>>],
        threshold: f32,
        with_appearance: bool,
    ) -> StageResult {
        if track_indices.is_empty() || det_indices.is_empty() {
            return StageResult {
                matches: Vec::new(),
                unmatched_dets: det_indices.to_vec(),
            };
        }

        let alpha = self.config.appearance_alpha.clamp(0.0, 1.0) as f64;
        let cost: Vec<Vec<f64>> = track_indices
            .iter()
            .map(|&ti| {
                let track = &self.tracks[ti];
                det_indices
                    .iter()
                    .map(|&di| {
                        let iou_cost = 1.0 - compute_iou(&track.bbox, &detections[di].bbox) as f64;
                        let cos = match (with_appearance, &track.embedding, &embeddings[di]) {
                            (true, Some(a), Some(b)) => cosine_similarity(a, b),
                            _ => None,
                        };
                        match cos {
                            Some(cos) => alpha * iou_cost + (1.0 - alpha) * (1.0 - cos as f64),
                            None => iou_cost,
                        }
                    })
                    .collect()
            })
            .collect();

        let result = linear_assignment(&cost, det_indices.len(), 1.0 - threshold as f64);
        StageResult {
            matches: result
                .matches
                .iter()
                .map(|&(r, c)| (track_indices[r], det_indices[c]))
                .collect(),
            unmatched_dets: result.unmatched_cols.iter().map(|&c| det_indices[c]).collect(),
        }
    }

    /// 把匹配结果写入轨迹, 返回是否出现奇异矩阵
    fn apply_matches(
        &mut self,
        matches: &[(usize, usize)],
        detections: &[Detection],
        embeddings: &mut [Option<Vec<f32>>],
        matched: &mut [bool],
        frame_index: u64,
    ) -> bool {
        let mut singular = false;
        for &(ti, di) in matches {
            let track = &mut self.tracks[ti];
            singular |= track.update(&detections[di], embeddings[di].take(), frame_index, &self.config);
            match track.state {
                TrackState::New => track.state = TrackState::Tracked,
                TrackState::Lost => {
                    debug!(track = track.id, frame = frame_index, "丢失轨迹已找回");
                    track.state = TrackState::Tracked;
                }
                _ => {}
            }
            self.validator.observe(track.id, &detections[di].keypoints);
            matched[ti] = true;
        }
        singular
    }
}

impl Tracker for IdentityTracker {
    /// 更新跟踪 (三阶段匹配)
    fn update(
        &mut self,
        detections: &[Detection],
        frame_index: u64,
        appearance: Option<&dyn AppearanceSource>,
    ) -> TrackerOutput {
        let first_frame = self.frames_processed == 0;
        self.frames_processed += 1;

        // 1. 所有轨迹先预测
        for track in &mut self.tracks {
            track.predict(&self.config);
        }

        // 外观特征: 外部来源优先, 否则按配置使用姿态特征
        let fallback = PoseEmbedding;
        let source: Option<&dyn AppearanceSource> = match appearance {
            Some(source) => Some(source),
            None if self.config.pose_embedding_fallback => Some(&fallback),
            None => None,
        };
        let mut embeddings: Vec<Option<Vec<f32>>> = detections
            .iter()
            .map(|d| source.and_then(|s| s.embed(d)))
            .collect();

        // 2. 分离高低分检测框
        let mut high_dets = Vec::new();
        let mut low_dets = Vec::new();
        for (idx, det) in detections.iter().enumerate() {
            if det.confidence >= self.config.high_score_threshold {
                high_dets.push(idx);
            } else if det.confidence >= self.config.low_score_threshold {
                low_dets.push(idx);
            }
        }

        let mut matched = vec![false; self.tracks.len()];
        let mut singular = false;

        // 3. 第一轮: 高分检测 + 新建/跟踪中轨迹
        let active: Vec<usize> = (0..self.tracks.len())
            .filter(|&i| matches!(self.tracks[i].state, TrackState::New | TrackState::Tracked))
            .collect();
        let stage1 = self.associate(
            &active,
            &high_dets,
            detections,
            &embeddings,
            self.config.match_threshold,
            true,
        );
        singular |= self.apply_matches(&stage1.matches, detections, &mut embeddings, &mut matched, frame_index);

        // 4. 第二轮: 低分检测救援未匹配的跟踪中轨迹 (仅 IoU)
        let unmatched_tracked: Vec<usize> = active
            .iter()
            .copied()
            .filter(|&i| !matched[i] && self.tracks[i].state == TrackState::Tracked)
            .collect();
        let stage2 = self.associate(
            &unmatched_tracked,
            &low_dets,
            detections,
            &embeddings,
            self.config.low_match_threshold,
            false,
        );
        singular |= self.apply_matches(&stage2.matches, detections, &mut embeddings, &mut matched, frame_index);

        // 5. 第三轮: 剩余高分检测找回丢失轨迹
        let lost: Vec<usize> = (0..self.tracks.len())
            .filter(|&i| {
                self.tracks[i].state == TrackState::Lost
                    && self.tracks[i].frames_lost <= self.config.max_lost_frames
            })
            .collect();
        let stage3 = self.associate(
            &lost,
            &stage1.unmatched_dets,
            detections,
            &embeddings,
            self.config.match_threshold,
            true,
        );
        singular |= self.apply_matches(&stage3.matches, detections, &mut embeddings, &mut matched, frame_index);

        // 6. 未匹配轨迹的生命周期
        for (idx, track) in self.tracks.iter_mut().enumerate() {
            if matched[idx] {
                continue;
            }
            match track.state {
                TrackState::New => track.state = TrackState::Removed,
                TrackState::Tracked => {
                    track.state = TrackState::Lost;
                    track.mark_missed();
                    trace!(track = track.id, frame = frame_index, "轨迹丢失");
                }
                TrackState::Lost => {
                    track.mark_missed();
                    if track.frames_lost > self.config.max_lost_frames {
                        track.state = TrackState::Removed;
                    }
                }
                TrackState::Removed => {}
            }
        }

        // 7. 未匹配的高分检测 → 新建轨迹
        for &di in &stage3.unmatched_dets {
            let det = &detections[di];
            if det.confidence < self.config.new_track_threshold {
                continue;
            }
            let mut track = IdentityTrack::new(
                self.next_id,
                det,
                embeddings[di].take(),
                frame_index,
                &self.config,
            );
            if first_frame {
                track.state = TrackState::Tracked;
            }
            debug!(track = track.id, frame = frame_index, "新建轨迹");
            self.validator.observe(track.id, &det.keypoints);
            self.tracks.push(track);
            self.next_id += 1;
        }

        // 8. 删除已移除的轨迹
        let validator = &mut self.validator;
        self.tracks.retain(|t| {
            if t.state == TrackState::Removed {
                validator.forget(t.id);
                trace!(track = t.id, "轨迹已移除");
                false
            } else {
                true
            }
        });

        TrackerOutput {
            visible: self.tracks.iter().filter(|t| t.visible).map(|t| t.id).collect(),
            stable: self
                .tracks
                .iter()
                .filter(|t| self.validator.is_stable(t.id))
                .map(|t| t.id)
                .collect(),
            tracks: self.tracks.iter().map(|t| t.snapshot()).collect(),
            singular,
        }
    }

    fn reset(&mut self) {
        self.tracks.clear();
        self.validator.reset();
        self.next_id = 1;
        self.frames_processed = 0;
    }

    fn track_count(&self) -> usize {
        self.tracks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::types::tests::person_detection;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn tracker() -> IdentityTracker {
        IdentityTracker::new(TrackingConfig::default(), ValidatorConfig::default())
    }

    fn jittered(rng: &mut StdRng, cx: f32, top: f32, conf: f32) -> Detection {
        let dx = rng.gen_range(-1.0..1.0);
        let dy = rng.gen_range(-1.0..1.0);
        person_detection(cx + dx, top + dy, 200.0, conf)
    }

    #[test]
    fn test_ids_strictly_increasing() {
        let mut t = tracker();
        let mut rng = StdRng::seed_from_u64(7);
        let mut seen = Vec::new();
        for frame in 0..30u64 {
            let mut dets = vec![jittered(&mut rng, 100.0, 50.0, 0.9)];
            if frame >= 5 {
                dets.push(jittered(&mut rng, 400.0, 50.0, 0.9));
            }
            if frame >= 12 {
                dets.push(jittered(&mut rng, 700.0, 50.0, 0.9));
            }
            let out = t.update(&dets, frame, None);
            for snap in &out.tracks {
                if !seen.contains(&snap.id) {
                    seen.push(snap.id);
                }
            }
        }
        assert_eq!(seen, vec![1, 2, 3]);
        assert_eq!(t.track_count(), 3);
    }

    #[test]
    fn test_occlusion_recovery_keeps_id() {
        let mut t = tracker();
        let mut rng = StdRng::seed_from_u64(42);
        let speed = 2.0;
        let mut id = None;

        for frame in 0..60u64 {
            let cx = 100.0 + speed * frame as f32;
            // 第 25..35 帧被遮挡
            let dets = if (25..35).contains(&frame) {
                Vec::new()
            } else {
                vec![jittered(&mut rng, cx, 50.0, 0.9)]
            };
            let out = t.update(&dets, frame, None);
            if frame == 0 {
                id = out.visible.first().copied();
            }
            if (25..35).contains(&frame) {
                assert!(out.visible.is_empty());
                assert_eq!(out.tracks[0].state, TrackState::Lost);
            } else {
                assert_eq!(out.visible, vec![id.unwrap()], "第 {} 帧", frame);
                assert_eq!(out.tracks[0].state, TrackState::Tracked);
            }
        }
        assert_eq!(t.track_count(), 1);
    }

    #[test]
    fn test_zero_detections_age_tracks() {
        let mut t = tracker();
        t.update(&[person_detection(100.0, 50.0, 200.0, 0.9)], 0, None);
        for frame in 1..4u64 {
            let out = t.update(&[], frame, None);
            assert!(out.visible.is_empty());
            assert_eq!(out.tracks[0].frames_lost, frame as u32);
        }
    }

    #[test]
    fn test_removed_after_max_lost_and_id_not_reused() {
        let config = TrackingConfig {
            max_lost_frames: 5,
            ..TrackingConfig::default()
        };
        let mut t = IdentityTracker::new(config, ValidatorConfig::default());
        t.update(&[person_detection(100.0, 50.0, 200.0, 0.9)], 0, None);
        for frame in 1..=5u64 {
            t.update(&[], frame, None);
            assert_eq!(t.track_count(), 1);
        }
        t.update(&[], 6, None);
        assert_eq!(t.track_count(), 0);

        let out = t.update(&[person_detection(100.0, 50.0, 200.0, 0.9)], 7, None);
        assert_eq!(out.tracks[0].id, 2);
    }

    #[test]
    fn test_new_track_confirmation() {
        let mut t = tracker();
        let out = t.update(&[person_detection(100.0, 50.0, 200.0, 0.9)], 0, None);
        // 第一帧直接确认
        assert_eq!(out.tracks[0].state, TrackState::Tracked);

        let dets = [
            person_detection(100.0, 50.0, 200.0, 0.9),
            person_detection(500.0, 50.0, 200.0, 0.9),
        ];
        let out = t.update(&dets, 1, None);
        assert_eq!(out.track(2).unwrap().state, TrackState::New);

        let out = t.update(&dets, 2, None);
        assert_eq!(out.track(2).unwrap().state, TrackState::Tracked);

        // 未被第二次关联的新轨迹直接移除
        let out = t.update(
            &[
                person_detection(100.0, 50.0, 200.0, 0.9),
                person_detection(500.0, 50.0, 200.0, 0.9),
                person_detection(900.0, 50.0, 200.0, 0.9),
            ],
            3,
            None,
        );
        assert_eq!(out.track(3).unwrap().state, TrackState::New);
        let out = t.update(&dets, 4, None);
        assert!(out.track(3).is_none());
    }

    #[test]
    fn test_low_score_detection_rescues_track() {
        let mut t = tracker();
        t.update(&[person_detection(100.0, 50.0, 200.0, 0.9)], 0, None);
        let out = t.update(&[person_detection(101.0, 50.0, 200.0, 0.3)], 1, None);
        assert_eq!(out.visible, vec![1]);
        assert_eq!(out.tracks[0].state, TrackState::Tracked);

        // 低分检测不会新建轨迹
        let out = t.update(
            &[
                person_detection(101.0, 50.0, 200.0, 0.9),
                person_detection(600.0, 50.0, 200.0, 0.3),
            ],
            2,
            None,
        );
        assert_eq!(out.tracks.len(), 1);
    }

    #[test]
    fn test_pose_embedding_fallback_and_stability() {
        let config = TrackingConfig {
            pose_embedding_fallback: true,
            ..TrackingConfig::default()
        };
        let mut t = IdentityTracker::new(config, ValidatorConfig::default());
        let mut rng = StdRng::seed_from_u64(3);
        let mut out = TrackerOutput::default();
        for frame in 0..20u64 {
            let dets = [
                jittered(&mut rng, 100.0, 50.0, 0.9),
                jittered(&mut rng, 500.0, 50.0, 0.9),
            ];
            out = t.update(&dets, frame, None);
        }
        assert_eq!(out.visible, vec![1, 2]);
        assert_eq!(out.stable, vec![1, 2]);
        assert!(t.tracks().iter().all(|track| track.embedding.is_some()));
    }

    #[test]
    fn test_reset_restarts_ids() {
        let mut t = tracker();
        t.update(&[person_detection(100.0, 50.0, 200.0, 0.9)], 0, None);
        t.reset();
        assert_eq!(t.track_count(), 0);
        let out = t.update(&[person_detection(100.0, 50.0, 200.0, 0.9)], 0, None);
        assert_eq!(out.tracks[0].id, 1);
    }
}
