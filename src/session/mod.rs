//! 评分会话 (Session) 与会话注册表
//!
//! 一个会话对应一路视频: 严格按帧号递增逐帧处理
//! 检测 → 身份跟踪 → 参考匹配 → (时间对齐) → 姿态评估 → 错误聚合 → 计分。
//! 会话之间只共享只读的配置与参考库。

mod person;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use self::person::PersonState;
use crate::alignment::DtwAligner;
use crate::config::PipelineConfig;
use crate::detection::{build_tracker, AppearanceSource, Detection, Tracker};
use crate::error::{Degradation, SessionError};
use crate::posture::PostureError;
use crate::reference::{ReferenceLibrary, ReferenceMatcher};
use crate::scoring::{ErrorSequence, ScoringEngine, ScoringPolicy};

/// 会话模式
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    /// 测试: 扣分, 低于淘汰线停止
    Testing,
    /// 练习: 只记录错误
    Practising,
}

/// 单人单帧结果
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PersonFrameResult {
    /// 本帧检出的姿态错误
    pub errors: Vec<PostureError>,
    /// 本帧结束并计入分数的错误序列
    pub emitted: Vec<ErrorSequence>,
    pub score: f32,
    pub stopped: bool,
    pub profile_id: Option<String>,
}

/// 单帧处理结果
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FrameResult {
    pub frame_index: u64,
    pub timestamp: f64,
    pub persons: BTreeMap<u32, PersonFrameResult>,
    /// 本帧的降级信号
    pub degraded: Vec<Degradation>,
}

/// 单人汇总
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PersonSummary {
    pub score: f32,
    pub stopped: bool,
    pub stopped_at: Option<u64>,
    /// 已计分的错误序列数
    pub error_count: usize,
    /// 其中聚合序列的数量
    pub sequence_count: usize,
}

/// 会话汇总 (可序列化, 由调用方持久化)
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub mode: SessionMode,
    pub started_at: DateTime<Utc>,
    pub frames_processed: u64,
    pub last_frame: Option<u64>,
    pub persons: BTreeMap<u32, PersonSummary>,
}

/// 单个评分会话
pub struct Session {
    id: String,
    mode: SessionMode,
    started_at: DateTime<Utc>,
    config: Arc<PipelineConfig>,
    library: Arc<ReferenceLibrary>,
    appearance: Option<Arc<dyn AppearanceSource + Send + Sync>>,
    tracker: Box<dyn Tracker + Send>,
    matcher: ReferenceMatcher,
    aligner: DtwAligner,
    persons: BTreeMap<u32, PersonState>,
    engine: ScoringEngine,
    last_frame: Option<u64>,
    frames_processed: u64,
}

impl Session {
    pub fn new(
        id: impl Into<String>,
        mode: SessionMode,
        config: Arc<PipelineConfig>,
        library: Arc<ReferenceLibrary>,
        appearance: Option<Arc<dyn AppearanceSource + Send + Sync>>,
    ) -> Self {
        let policy = match mode {
            SessionMode::Testing => ScoringPolicy::Testing {
                fail_threshold: config.scoring.fail_threshold,
            },
            SessionMode::Practising => ScoringPolicy::Practising,
        };
        Self {
            id: id.into(),
            mode,
            started_at: Utc::now(),
            tracker: build_tracker(&config.tracking, &config.validator),
            matcher: ReferenceMatcher::new(config.matcher.clone()),
            aligner: DtwAligner::from_config(&config.alignment),
            persons: BTreeMap::new(),
            engine: ScoringEngine::new(policy, config.scoring.initial_score),
            last_frame: None,
            frames_processed: 0,
            config,
            library,
            appearance,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    /// 处理一帧检测
    ///
    /// 帧号必须严格递增, 否则返回错误且不改变任何状态
    pub fn process_frame(
        &mut self,
        detections: &[Detection],
        timestamp: f64,
        frame_index: u64,
    ) -> Result<FrameResult, SessionError> {
        if let Some(last) = self.last_frame {
            if frame_index <= last {
                return Err(SessionError::FrameOutOfOrder {
                    session: self.id.clone(),
                    last,
                    got: frame_index,
                });
            }
        }

        let mut degraded = Vec::new();
        if detections.is_empty() {
            debug!(session = %self.id, frame = frame_index, "本帧无检测");
            degraded.push(Degradation::DetectionEmpty);
        }

        // 1. 身份跟踪
        let appearance = self
            .appearance
            .as_deref()
            .map(|a| a as &dyn AppearanceSource);
        let output = self.tracker.update(detections, frame_index, appearance);
        if output.singular {
            warn!(session = %self.id, frame = frame_index, "协方差矩阵奇异, 已使用伪逆");
            degraded.push(Degradation::AssociationSingular);
        }

        // 2. 可评估的身份: 本帧可见且已稳定
        let mut candidates = Vec::new();
        for track in output.tracks.iter().filter(|t| t.visible) {
            if !track.keypoints.is_well_formed() {
                warn!(
                    session = %self.id,
                    track = track.id,
                    len = track.keypoints.points.len(),
                    "关键点格式错误, 跳过该身份"
                );
                degraded.push(Degradation::InvalidKeypointShape {
                    person: track.id,
                    len: track.keypoints.points.len(),
                });
                continue;
            }
            if output.stable.contains(&track.id) {
                candidates.push(track);
            }
        }

        // 3. 参考匹配
        let stable: Vec<(u32, _)> = candidates.iter().map(|t| (t.id, &t.keypoints)).collect();
        let bindings = self.matcher.match_tracks(&stable, &self.library);
        let alive: Vec<u32> = output.tracks.iter().map(|t| t.id).collect();
        self.matcher.retain(|id| alive.contains(&id));

        let mut persons = BTreeMap::new();
        let min_conf = self.config.evaluator.min_keypoint_confidence;

        // 4. 逐人评估
        for track in candidates {
            let entry = bindings.get(&track.id).and_then(|pid| self.library.get(pid));
            if entry.is_none() {
                if !self.config.session.score_unmatched {
                    continue;
                }
                degraded.push(Degradation::MissingReference { person: track.id });
            }

            self.engine.register(track.id);
            let state = self
                .persons
                .entry(track.id)
                .or_insert_with(|| PersonState::new(&self.config));
            state.bind(entry.map(|e| e.profile.id.as_str()));

            let mut errors = Vec::new();
            if !self.engine.is_stopped(track.id) {
                let aligned = match entry {
                    Some(entry) if self.config.alignment.enabled => state
                        .alignment
                        .step(&track.keypoints, entry, &self.aligner, &self.config.alignment, min_conf)
                        .and_then(|j| entry.profile.frames.get(j)),
                    _ => None,
                };
                let outcome = state.evaluator.evaluate_aligned(
                    &track.keypoints,
                    entry.map(|e| &e.profile.stats),
                    aligned,
                    frame_index,
                    timestamp,
                );
                errors = outcome.errors;
            }

            let mut emitted = Vec::new();
            for error in &errors {
                emitted.extend(state.aggregator.push(error.clone()));
            }
            persons.insert(
                track.id,
                PersonFrameResult {
                    errors,
                    emitted,
                    score: 0.0,
                    stopped: false,
                    profile_id: state.profile_id.clone(),
                },
            );
        }

        // 5. 结束无法延续的错误段; 已移除的身份全部结束
        let mut removed = Vec::new();
        for (&id, state) in self.persons.iter_mut() {
            let closed = if alive.contains(&id) {
                state.aggregator.advance(frame_index)
            } else {
                removed.push(id);
                state.aggregator.finalize()
            };
            if closed.is_empty() {
                continue;
            }
            persons
                .entry(id)
                .or_insert_with(|| PersonFrameResult {
                    errors: Vec::new(),
                    emitted: Vec::new(),
                    score: 0.0,
                    stopped: false,
                    profile_id: state.profile_id.clone(),
                })
                .emitted
                .extend(closed);
        }
        for id in removed {
            debug!(session = %self.id, person = id, "身份已移除, 结束其错误段");
            self.persons.remove(&id);
        }

        // 6. 计分
        for (&id, result) in persons.iter_mut() {
            let state = self.engine.apply(id, &result.emitted);
            result.score = state.score;
            result.stopped = state.stopped;
        }

        self.last_frame = Some(frame_index);
        self.frames_processed += 1;

        Ok(FrameResult {
            frame_index,
            timestamp,
            persons,
            degraded,
        })
    }

    /// 所有人的当前分数
    pub fn scores(&self) -> BTreeMap<u32, f32> {
        self.engine.scores()
    }

    /// 所有人已计分的错误序列
    pub fn errors(&self) -> BTreeMap<u32, Vec<ErrorSequence>> {
        self.engine.errors()
    }

    /// 恢复初始状态: 跟踪器、匹配、平滑与聚合状态全部清空, 分数恢复初始值
    pub fn reset(&mut self) {
        self.tracker.reset();
        self.matcher.reset();
        self.persons.clear();
        let ids: Vec<u32> = self.engine.persons().map(|(id, _)| *id).collect();
        for id in ids {
            self.engine.reset_person(id);
        }
        self.last_frame = None;
        self.frames_processed = 0;
        info!(session = %self.id, "会话已重置");
    }

    /// 结束所有未完成的错误段并计分, 返回每人完整的错误记录
    pub fn finalize(&mut self) -> BTreeMap<u32, Vec<ErrorSequence>> {
        for (&id, state) in self.persons.iter_mut() {
            let closed = state.aggregator.finalize();
            if !closed.is_empty() {
                self.engine.apply(id, &closed);
            }
        }
        info!(
            session = %self.id,
            frames = self.frames_processed,
            persons = self.engine.scores().len(),
            "会话已结束"
        );
        self.engine.errors()
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.id.clone(),
            mode: self.mode,
            started_at: self.started_at,
            frames_processed: self.frames_processed,
            last_frame: self.last_frame,
            persons: self
                .engine
                .persons()
                .map(|(id, s)| {
                    (
                        *id,
                        PersonSummary {
                            score: s.score,
                            stopped: s.stopped,
                            stopped_at: s.stopped_at,
                            error_count: s.errors.len(),
                            sequence_count: s.errors.iter().filter(|e| e.is_sequence).count(),
                        },
                    )
                })
                .collect(),
        }
    }
}

/// 会话注册表 (由编排层显式创建并持有)
pub struct SessionRegistry {
    config: Arc<PipelineConfig>,
    library: Arc<ReferenceLibrary>,
    appearance: Option<Arc<dyn AppearanceSource + Send + Sync>>,
    sessions: HashMap<String, Session>,
}

impl SessionRegistry {
    pub fn new(config: Arc<PipelineConfig>, library: Arc<ReferenceLibrary>) -> Self {
        Self {
            config,
            library,
            appearance: None,
            sessions: HashMap::new(),
        }
    }

    /// 注入外观特征来源 (例如 ReID 模型)
    pub fn with_appearance_source(mut self, source: Arc<dyn AppearanceSource + Send + Sync>) -> Self {
        self.appearance = Some(source);
        self
    }

    /// 启动会话
    pub fn start(&mut self, session_id: &str, mode: SessionMode) -> Result<(), SessionError> {
        if self.sessions.contains_key(session_id) {
            return Err(SessionError::DuplicateSession(session_id.to_string()));
        }
        let session = Session::new(
            session_id,
            mode,
            self.config.clone(),
            self.library.clone(),
            self.appearance.clone(),
        );
        self.sessions.insert(session_id.to_string(), session);
        info!(session = session_id, ?mode, "会话已启动");
        Ok(())
    }

    fn session_mut(&mut self, session_id: &str) -> Result<&mut Session, SessionError> {
        self.sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    pub fn session(&self, session_id: &str) -> Result<&Session, SessionError> {
        self.sessions
            .get(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    pub fn process_frame(
        &mut self,
        session_id: &str,
        detections: &[Detection],
        timestamp: f64,
        frame_index: u64,
    ) -> Result<FrameResult, SessionError> {
        self.session_mut(session_id)?
            .process_frame(detections, timestamp, frame_index)
    }

    pub fn get_score(&self, session_id: &str) -> Result<BTreeMap<u32, f32>, SessionError> {
        Ok(self.session(session_id)?.scores())
    }

    pub fn get_errors(
        &self,
        session_id: &str,
    ) -> Result<BTreeMap<u32, Vec<ErrorSequence>>, SessionError> {
        Ok(self.session(session_id)?.errors())
    }

    pub fn reset(&mut self, session_id: &str) -> Result<(), SessionError> {
        self.session_mut(session_id)?.reset();
        Ok(())
    }

    pub fn finalize(
        &mut self,
        session_id: &str,
    ) -> Result<BTreeMap<u32, Vec<ErrorSequence>>, SessionError> {
        Ok(self.session_mut(session_id)?.finalize())
    }

    pub fn summary(&self, session_id: &str) -> Result<SessionSummary, SessionError> {
        Ok(self.session(session_id)?.summary())
    }

    /// 删除会话, 不存在时什么也不做; 返回是否确实删除了会话
    pub fn delete(&mut self, session_id: &str) -> bool {
        let removed = self.sessions.remove(session_id).is_some();
        if removed {
            info!(session = session_id, "会话已删除");
        }
        removed
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{TrackingConfig, ValidatorConfig};
    use crate::detection::types::tests::{person_detection, standing_pose};
    use crate::detection::types::{BBox, PoseKeypoints, LEFT_ELBOW, LEFT_WRIST};
    use crate::reference::ReferenceProfile;

    fn test_config() -> PipelineConfig {
        PipelineConfig {
            tracking: TrackingConfig {
                predict_keypoints: false,
                ..TrackingConfig::default()
            },
            validator: ValidatorConfig {
                min_frames: 3,
                min_samples: 3,
                ..ValidatorConfig::default()
            },
            ..PipelineConfig::default()
        }
    }

    fn standing_library() -> ReferenceLibrary {
        let profile =
            ReferenceProfile::from_frames("stand", vec![standing_pose(100.0, 0.0, 100.0); 5], 0.3);
        ReferenceLibrary::new(vec![profile], 0.3).unwrap()
    }

    fn registry(config: PipelineConfig, library: ReferenceLibrary) -> SessionRegistry {
        SessionRegistry::new(Arc::new(config), Arc::new(library))
    }

    /// 左手腕前平举的检测 (肘部角度约 83°)
    fn bent_arm_detection() -> Detection {
        let mut det = person_detection(300.0, 50.0, 200.0, 0.9);
        let (ex, ey, _) = det.keypoints.points[LEFT_ELBOW];
        det.keypoints.points[LEFT_WRIST] = (ex + 28.0, ey, 0.9);
        det
    }

    /// 第 5..15 帧左臂弯曲, 其余站立
    fn run_drill(reg: &mut SessionRegistry, id: &str, frames: u64) -> Vec<FrameResult> {
        (0..frames)
            .map(|f| {
                let det = if (5..15).contains(&f) {
                    bent_arm_detection()
                } else {
                    person_detection(300.0, 50.0, 200.0, 0.9)
                };
                reg.process_frame(id, &[det], f as f64 / 30.0, f).unwrap()
            })
            .collect()
    }

    #[test]
    fn test_default_config_step_change_and_occlusion() {
        // 默认配置: 关键点卡尔曼滤波开启, 稳定判定需要 10 帧
        let mut reg = registry(PipelineConfig::default(), standing_library());
        reg.start("d", SessionMode::Testing).unwrap();

        let left_arm = |r: &FrameResult| {
            r.persons
                .values()
                .flat_map(|p| p.errors.iter())
                .map(|e| e.metric.to_string())
                .filter(|m| m == "arm_angle.left" || m == "arm_height.left")
                .collect::<Vec<_>>()
        };

        let results: Vec<FrameResult> = (0..50u64)
            .map(|f| {
                let mut det = if f < 12 {
                    person_detection(300.0, 50.0, 200.0, 0.9)
                } else {
                    bent_arm_detection()
                };
                if f >= 40 {
                    // 左腕被遮挡, 检测器给出低置信度
                    det.keypoints.points[LEFT_WRIST].2 = 0.05;
                }
                reg.process_frame("d", &[det], f as f64 / 30.0, f).unwrap()
            })
            .collect();

        for r in &results[25..40] {
            assert_eq!(r.persons.len(), 1);
            assert!(
                left_arm(r).iter().any(|m| m == "arm_angle.left"),
                "frame {} 未报告弯臂",
                r.frame_index
            );
        }
        for r in &results[40..] {
            assert!(left_arm(r).is_empty(), "frame {} 遮挡关节仍被评估", r.frame_index);
        }
    }

    #[test]
    fn test_lifecycle_errors() {
        let mut reg = registry(test_config(), standing_library());
        assert_eq!(
            reg.process_frame("missing", &[], 0.0, 0),
            Err(SessionError::NotFound("missing".into()))
        );
        assert!(reg.get_score("missing").is_err());

        reg.start("s1", SessionMode::Testing).unwrap();
        assert_eq!(
            reg.start("s1", SessionMode::Practising),
            Err(SessionError::DuplicateSession("s1".into()))
        );
        assert_eq!(reg.session("s1").unwrap().mode(), SessionMode::Testing);

        assert!(reg.delete("s1"));
        assert!(!reg.delete("s1"));
        assert!(reg.is_empty());
    }

    #[test]
    fn test_out_of_order_frame_is_rejected_without_mutation() {
        let mut reg = registry(test_config(), standing_library());
        reg.start("s", SessionMode::Testing).unwrap();
        run_drill(&mut reg, "s", 4);
        let before = reg.summary("s").unwrap();

        let err = reg
            .process_frame("s", &[person_detection(300.0, 50.0, 200.0, 0.9)], 0.0, 3)
            .unwrap_err();
        assert_eq!(
            err,
            SessionError::FrameOutOfOrder {
                session: "s".into(),
                last: 3,
                got: 3
            }
        );
        assert_eq!(reg.summary("s").unwrap(), before);
    }

    #[test]
    fn test_testing_mode_aggregates_persistent_error() {
        let mut reg = registry(test_config(), standing_library());
        reg.start("s", SessionMode::Testing).unwrap();
        let results = run_drill(&mut reg, "s", 25);

        // 稳定后绑定参考动作并逐帧报告错误
        let frame7 = &results[7].persons[&1];
        assert_eq!(frame7.profile_id.as_deref(), Some("stand"));
        assert!(frame7
            .errors
            .iter()
            .any(|e| e.metric.to_string() == "arm_angle.left"));
        // 持续中的错误段尚未扣分
        assert_eq!(frame7.score, 100.0);

        let errors = reg.get_errors("s").unwrap();
        let person = &errors[&1];
        assert_eq!(person.len(), 2);
        assert!(person.iter().all(|s| s.is_sequence && s.frame_count == 10));
        assert!(person.iter().all(|s| s.start_frame == 5 && s.end_frame == 14));

        let total: f32 = person.iter().map(|s| s.deduction).sum();
        let score = reg.get_score("s").unwrap()[&1];
        assert!((score - (100.0 - total)).abs() < 1e-4);
        assert!(score < 100.0 && score > 90.0);
    }

    #[test]
    fn test_practising_mode_keeps_score() {
        let mut reg = registry(test_config(), standing_library());
        reg.start("p", SessionMode::Practising).unwrap();
        run_drill(&mut reg, "p", 25);
        assert_eq!(reg.get_score("p").unwrap()[&1], 100.0);
        assert_eq!(reg.get_errors("p").unwrap()[&1].len(), 2);
    }

    #[test]
    fn test_stopped_person_ignores_later_errors() {
        let mut config = test_config();
        config.scoring.fail_threshold = 99.0;
        let mut reg = registry(config, standing_library());
        reg.start("s", SessionMode::Testing).unwrap();
        let results = run_drill(&mut reg, "s", 25);
        let last = results.last().unwrap();
        assert!(last.persons.is_empty() || last.persons[&1].stopped);

        let summary = reg.summary("s").unwrap();
        let person = &summary.persons[&1];
        assert!(person.stopped);
        assert!(person.stopped_at.is_some());

        // 停止后再出现错误也不会扣分
        let score = reg.get_score("s").unwrap()[&1];
        for f in 25..40u64 {
            reg.process_frame("s", &[bent_arm_detection()], f as f64 / 30.0, f)
                .unwrap();
        }
        reg.finalize("s").unwrap();
        assert_eq!(reg.get_score("s").unwrap()[&1], score);
    }

    #[test]
    fn test_reset_restores_initial_state() {
        let mut reg = registry(test_config(), standing_library());
        reg.start("s", SessionMode::Testing).unwrap();
        run_drill(&mut reg, "s", 25);
        assert!(reg.get_score("s").unwrap()[&1] < 100.0);

        reg.reset("s").unwrap();
        assert!(reg.get_score("s").unwrap().values().all(|s| *s == 100.0));
        assert!(reg.get_errors("s").unwrap().values().all(Vec::is_empty));
        assert_eq!(reg.summary("s").unwrap().frames_processed, 0);

        // 重置后帧号可以从头开始
        assert!(reg
            .process_frame("s", &[person_detection(300.0, 50.0, 200.0, 0.9)], 0.0, 0)
            .is_ok());

        // 没有任何活动的会话也可以重置
        reg.start("empty", SessionMode::Practising).unwrap();
        assert!(reg.reset("empty").is_ok());
    }

    #[test]
    fn test_finalize_flushes_open_sequences() {
        let mut reg = registry(test_config(), standing_library());
        reg.start("s", SessionMode::Testing).unwrap();
        for f in 0..12u64 {
            let det = if f >= 5 {
                bent_arm_detection()
            } else {
                person_detection(300.0, 50.0, 200.0, 0.9)
            };
            reg.process_frame("s", &[det], f as f64, f).unwrap();
        }
        // 错误仍在持续, 尚未计分
        assert!(reg.get_errors("s").unwrap()[&1].is_empty());

        let flushed = reg.finalize("s").unwrap();
        assert_eq!(flushed[&1].len(), 2);
        assert!(flushed[&1].iter().all(|s| s.end_frame == 11));
        assert!(reg.get_score("s").unwrap()[&1] < 100.0);
    }

    #[test]
    fn test_degradation_signals() {
        let mut reg = registry(test_config(), standing_library());
        reg.start("s", SessionMode::Testing).unwrap();

        let empty = reg.process_frame("s", &[], 0.0, 0).unwrap();
        assert_eq!(empty.degraded, vec![Degradation::DetectionEmpty]);

        let malformed = Detection::new(
            BBox::new(0.0, 0.0, 80.0, 200.0),
            0.9,
            PoseKeypoints::new(vec![(10.0, 10.0, 0.9); 5]),
        );
        let out = reg.process_frame("s", &[malformed], 0.1, 1).unwrap();
        assert!(out
            .degraded
            .contains(&Degradation::InvalidKeypointShape { person: 1, len: 5 }));
        assert!(out.persons.is_empty());
    }

    #[test]
    fn test_unmatched_person_policy() {
        // 参考库为空: 默认不评分
        let mut reg = registry(test_config(), ReferenceLibrary::default());
        reg.start("s", SessionMode::Testing).unwrap();
        for f in 0..6u64 {
            let out = reg
                .process_frame("s", &[bent_arm_detection()], f as f64, f)
                .unwrap();
            assert!(out.persons.is_empty());
        }

        // 开启后按默认阈值评分并报告缺少参考
        let mut config = test_config();
        config.session.score_unmatched = true;
        let mut reg = registry(config, ReferenceLibrary::default());
        reg.start("s", SessionMode::Testing).unwrap();
        let mut last = None;
        for f in 0..6u64 {
            last = Some(
                reg.process_frame("s", &[person_detection(300.0, 50.0, 200.0, 0.9)], f as f64, f)
                    .unwrap(),
            );
        }
        let last = last.unwrap();
        assert!(last
            .degraded
            .contains(&Degradation::MissingReference { person: 1 }));
        assert_eq!(last.persons[&1].profile_id, None);
        assert!(last.persons[&1].errors.is_empty());
    }

    #[test]
    fn test_alignment_enabled_session() {
        // 参考动作: 左腕逐帧上移; 候选者以相同节奏完成
        let frames: Vec<PoseKeypoints> = (0..40)
            .map(|t| {
                let mut kp = standing_pose(100.0, 0.0, 100.0);
                kp.points[LEFT_WRIST].1 -= t as f32 * 1.0;
                kp
            })
            .collect();
        let profile = ReferenceProfile::from_frames("rise", frames, 0.3);
        let library = ReferenceLibrary::new(vec![profile], 0.3).unwrap();

        let mut config = test_config();
        config.alignment.enabled = true;
        config.alignment.realign_interval = 5;
        let mut reg = registry(config, library);
        reg.start("s", SessionMode::Testing).unwrap();

        for f in 0..40u64 {
            let mut det = person_detection(300.0, 50.0, 200.0, 0.9);
            det.keypoints.points[LEFT_WRIST].1 -= f as f32 * 2.0;
            let out = reg.process_frame("s", &[det], f as f64 / 30.0, f).unwrap();
            if let Some(p) = out.persons.get(&1) {
                assert!(p.errors.is_empty(), "frame {}: {:?}", f, p.errors);
            }
        }
        let flushed = reg.finalize("s").unwrap();
        assert!(flushed[&1].is_empty());
        assert_eq!(reg.get_score("s").unwrap()[&1], 100.0);
    }

    /// 统计调用次数的外观来源
    struct CountingAppearance(std::sync::atomic::AtomicUsize);

    impl AppearanceSource for CountingAppearance {
        fn embed(&self, _detection: &Detection) -> Option<Vec<f32>> {
            self.0.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            Some(vec![1.0, 0.0, 0.0])
        }
    }

    #[test]
    fn test_injected_appearance_source() {
        let source = Arc::new(CountingAppearance(Default::default()));
        let mut reg = registry(test_config(), standing_library())
            .with_appearance_source(source.clone());
        reg.start("s", SessionMode::Testing).unwrap();
        let results = run_drill(&mut reg, "s", 10);

        assert_eq!(source.0.load(std::sync::atomic::Ordering::Relaxed), 10);
        assert!(results.iter().flat_map(|r| r.persons.keys()).all(|id| *id == 1));
    }

    #[test]
    fn test_sessions_are_independent() {
        let mut reg = registry(test_config(), standing_library());
        reg.start("a", SessionMode::Testing).unwrap();
        reg.start("b", SessionMode::Testing).unwrap();
        run_drill(&mut reg, "a", 25);
        assert!(reg.get_score("b").unwrap().is_empty());
        assert_eq!(reg.len(), 2);
        assert!(reg.contains("a"));
    }
}
