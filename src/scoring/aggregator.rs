//! 错误聚合: 持续性错误 → 一次有界扣分
//!
//! 同一签名 (类别, 部位, 左右) 的错误按帧号分段, 允许最多 `max_gap` 帧漏检。
//! 长度达到 `min_sequence_length` 的段合并为一个错误序列, 只扣一次分;
//! 更短的段保持为逐帧错误。持续数百帧的轻微错误不会被扣数百次。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::AggregatorConfig;
use crate::posture::evaluator::{ErrorSignature, PostureError};
use crate::posture::metrics::MetricKey;

/// 段内严重度的合并方式
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationMethod {
    #[default]
    Mean,
    Median,
    Max,
}

impl AggregationMethod {
    pub fn apply(&self, values: &[f32]) -> f32 {
        if values.is_empty() {
            return 0.0;
        }
        match self {
            AggregationMethod::Mean => values.iter().sum::<f32>() / values.len() as f32,
            AggregationMethod::Median => {
                let mut sorted = values.to_vec();
                sorted.sort_by(|a, b| a.total_cmp(b));
                let mid = sorted.len() / 2;
                if sorted.len() % 2 == 0 {
                    (sorted[mid - 1] + sorted[mid]) / 2.0
                } else {
                    sorted[mid]
                }
            }
            AggregationMethod::Max => values.iter().copied().fold(f32::MIN, f32::max),
        }
    }
}

/// 错误序列 (聚合后的扣分单元)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorSequence {
    pub signature: ErrorSignature,
    pub metric: MetricKey,
    pub start_frame: u64,
    pub end_frame: u64,
    pub start_timestamp: f64,
    pub end_timestamp: f64,
    /// 段内错误帧数
    pub frame_count: usize,
    /// 合并后的严重度
    pub severity: f32,
    pub weight: f32,
    pub deduction: f32,
    /// false 表示过短未聚合的单帧错误
    pub is_sequence: bool,
}

impl ErrorSequence {
    fn single(error: &PostureError) -> Self {
        Self {
            signature: error.signature(),
            metric: error.metric,
            start_frame: error.frame_index,
            end_frame: error.frame_index,
            start_timestamp: error.timestamp,
            end_timestamp: error.timestamp,
            frame_count: 1,
            severity: error.severity,
            weight: error.weight,
            deduction: error.deduction,
            is_sequence: false,
        }
    }
}

/// 输出排序: (起始帧, 签名)
fn sort_sequences(sequences: &mut [ErrorSequence]) {
    sequences.sort_by(|a, b| {
        a.start_frame
            .cmp(&b.start_frame)
            .then_with(|| a.signature.cmp(&b.signature))
    });
}

/// 错误聚合器 (每个人一个, 流式)
#[derive(Clone, Debug)]
pub struct ErrorAggregator {
    config: AggregatorConfig,
    /// 每个签名当前未结束的段
    open: BTreeMap<ErrorSignature, Vec<PostureError>>,
}

impl ErrorAggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        Self {
            config,
            open: BTreeMap::new(),
        }
    }

    /// 批量聚合 (输入按帧号有序)
    pub fn aggregate(config: &AggregatorConfig, errors: &[PostureError]) -> Vec<ErrorSequence> {
        let mut aggregator = Self::new(config.clone());
        let mut out = Vec::new();
        for error in errors {
            out.extend(aggregator.push(error.clone()));
        }
        out.extend(aggregator.finalize());
        sort_sequences(&mut out);
        out
    }

    /// 加入一个错误, 返回因此结束的段
    pub fn push(&mut self, error: PostureError) -> Vec<ErrorSequence> {
        let signature = error.signature();
        let max_step = self.config.max_gap + 1;
        let mut out = Vec::new();

        let continues = self
            .open
            .get(&signature)
            .and_then(|run| run.last())
            .is_some_and(|last| error.frame_index.saturating_sub(last.frame_index) <= max_step);

        if !continues {
            if let Some(run) = self.open.remove(&signature) {
                out.extend(self.close(run));
            }
        }
        self.open.entry(signature).or_default().push(error);
        out
    }

    /// 当前帧处理完毕, 结束下一帧已无法延续的段
    pub fn advance(&mut self, frame_index: u64) -> Vec<ErrorSequence> {
        let max_gap = self.config.max_gap;
        let expired: Vec<ErrorSignature> = self
            .open
            .iter()
            .filter(|(_, run)| {
                run.last()
                    .is_some_and(|last| frame_index.saturating_sub(last.frame_index) > max_gap)
            })
            .map(|(sig, _)| *sig)
            .collect();

        let mut out = Vec::new();
        for sig in expired {
            if let Some(run) = self.open.remove(&sig) {
                out.extend(self.close(run));
            }
        }
        sort_sequences(&mut out);
        out
    }

    /// 结束所有段 (会话结束时调用)
    pub fn finalize(&mut self) -> Vec<ErrorSequence> {
        let open = std::mem::take(&mut self.open);
        let mut out: Vec<ErrorSequence> = open.into_values().flat_map(|run| self.close(run)).collect();
        sort_sequences(&mut out);
        out
    }

    /// 未结束的错误数
    pub fn pending(&self) -> usize {
        self.open.values().map(Vec::len).sum()
    }

    pub fn reset(&mut self) {
        self.open.clear();
    }

    fn close(&self, run: Vec<PostureError>) -> Vec<ErrorSequence> {
        let (Some(first), Some(last)) = (run.first(), run.last()) else {
            return Vec::new();
        };
        if run.len() < self.config.min_sequence_length {
            return run.iter().map(ErrorSequence::single).collect();
        }

        let severities: Vec<f32> = run.iter().map(|e| e.severity).collect();
        let severity = self.config.method.apply(&severities);
        vec![ErrorSequence {
            signature: first.signature(),
            metric: first.metric,
            start_frame: first.frame_index,
            end_frame: last.frame_index,
            start_timestamp: first.timestamp,
            end_timestamp: last.timestamp,
            frame_count: run.len(),
            severity,
            weight: first.weight,
            deduction: first.weight * severity,
            is_sequence: true,
        }]
    }
}
