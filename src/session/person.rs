//! 会话内的单人状态: 评估器、聚合器与时间对齐游标

use std::collections::VecDeque;

use ndarray::Array2;
use tracing::trace;

use crate::alignment::{pose_features, Boundary, DtwAligner, FEATURE_DIM};
use crate::config::{AlignmentConfig, PipelineConfig};
use crate::detection::types::PoseKeypoints;
use crate::posture::PostureEvaluator;
use crate::reference::ReferenceEntry;
use crate::scoring::ErrorAggregator;

/// 节奏比的合理范围, 超出时视为对齐失败
const MIN_TEMPO: f64 = 0.25;
const MAX_TEMPO: f64 = 4.0;

/// 实时对齐游标
///
/// 每隔 `realign_interval` 帧用特征历史对参考序列做一次开放首尾的 DTW,
/// 其间参考帧按 1 / 节奏比 逐帧前进
#[derive(Clone, Debug, Default)]
pub(crate) struct AlignmentCursor {
    history: VecDeque<[f32; FEATURE_DIM]>,
    cursor: Option<f64>,
    tempo: f64,
    since_align: u64,
}

impl AlignmentCursor {
    /// 记录一帧并返回对应的参考帧
    pub(crate) fn step(
        &mut self,
        keypoints: &PoseKeypoints,
        reference: &ReferenceEntry,
        aligner: &DtwAligner,
        config: &AlignmentConfig,
        min_conf: f32,
    ) -> Option<usize> {
        let ref_len = reference.features.nrows();
        if ref_len == 0 {
            return None;
        }

        self.history.push_back(pose_features(keypoints, min_conf));
        while self.history.len() > config.max_history.max(1) {
            self.history.pop_front();
        }

        let due = self.cursor.is_none() || self.since_align + 1 >= config.realign_interval.max(1);
        if due {
            let mut candidate = Array2::<f32>::zeros((self.history.len(), FEATURE_DIM));
            for (i, row) in self.history.iter().enumerate() {
                for (j, v) in row.iter().enumerate() {
                    candidate[[i, j]] = *v;
                }
            }
            // 候选历史可能从参考动作中途开始, 首尾都开放;
            // 周期性参考中并列的终点取离游标预期位置最近的一个, 避免跳回前一周期
            let expected = self
                .cursor
                .map(|c| (c + 1.0 / self.tempo.max(MIN_TEMPO)).round().max(0.0) as usize);
            let map = aligner.align_near(&candidate, &reference.features, Boundary::OPEN, expected);
            if let Some(j) = map.last_reference() {
                let tempo = map.tempo_ratio();
                self.tempo = if tempo.is_finite() && (MIN_TEMPO..=MAX_TEMPO).contains(&tempo) {
                    tempo
                } else {
                    1.0
                };
                self.cursor = Some(j as f64);
                trace!(reference_frame = j, tempo = self.tempo, "重新对齐");
            }
            self.since_align = 0;
        } else if let Some(cursor) = self.cursor.as_mut() {
            *cursor += 1.0 / self.tempo.max(MIN_TEMPO);
            self.since_align += 1;
        }

        self.cursor
            .map(|c| (c.round().max(0.0) as usize).min(ref_len - 1))
    }

    pub(crate) fn clear(&mut self) {
        *self = Self::default();
    }
}

/// 会话中一个人的处理状态
#[derive(Clone, Debug)]
pub(crate) struct PersonState {
    pub(crate) evaluator: PostureEvaluator,
    pub(crate) aggregator: ErrorAggregator,
    pub(crate) alignment: AlignmentCursor,
    pub(crate) profile_id: Option<String>,
}

impl PersonState {
    pub(crate) fn new(config: &PipelineConfig) -> Self {
        Self {
            evaluator: PostureEvaluator::new(config.evaluator.clone()),
            aggregator: ErrorAggregator::new(config.aggregator.clone()),
            alignment: AlignmentCursor::default(),
            profile_id: None,
        }
    }

    /// 绑定的参考动作变化时清空对齐历史
    pub(crate) fn bind(&mut self, profile_id: Option<&str>) {
        if self.profile_id.as_deref() != profile_id {
            self.alignment.clear();
            self.profile_id = profile_id.map(str::to_string);
        }
    }
}
