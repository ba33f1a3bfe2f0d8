//! 计分引擎
//!
//! 每个人一个状态机: Active → Active / Stopped。
//! - 测试模式: 扣分 (不低于 0), 低于淘汰线即停止, 停止后的错误全部忽略
//! - 练习模式: 只记录错误, 分数不变, 永不停止

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::aggregator::ErrorSequence;

/// 计分策略
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum ScoringPolicy {
    Testing { fail_threshold: f32 },
    Practising,
}

/// 单人计分状态
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PersonScoreState {
    pub score: f32,
    pub stopped: bool,
    /// 停止时的帧号
    pub stopped_at: Option<u64>,
    /// 已记录的错误序列 (按产生顺序)
    pub errors: Vec<ErrorSequence>,
}

impl PersonScoreState {
    fn new(initial_score: f32) -> Self {
        Self {
            score: initial_score,
            stopped: false,
            stopped_at: None,
            errors: Vec::new(),
        }
    }
}

/// 计分引擎 (每个会话一个)
#[derive(Clone, Debug)]
pub struct ScoringEngine {
    policy: ScoringPolicy,
    initial_score: f32,
    persons: BTreeMap<u32, PersonScoreState>,
}

impl ScoringEngine {
    pub fn new(policy: ScoringPolicy, initial_score: f32) -> Self {
        Self {
            policy,
            initial_score,
            persons: BTreeMap::new(),
        }
    }

    pub fn policy(&self) -> ScoringPolicy {
        self.policy
    }

    /// 确保该人有计分状态
    pub fn register(&mut self, person: u32) -> &PersonScoreState {
        let initial = self.initial_score;
        self.persons
            .entry(person)
            .or_insert_with(|| PersonScoreState::new(initial))
    }

    /// 应用一批错误序列, 返回该人的最新状态
    pub fn apply(&mut self, person: u32, sequences: &[ErrorSequence]) -> &PersonScoreState {
        let initial = self.initial_score;
        let policy = self.policy;
        let state = self
            .persons
            .entry(person)
            .or_insert_with(|| PersonScoreState::new(initial));

        for seq in sequences {
            if state.stopped {
                break;
            }
            state.errors.push(seq.clone());

            let ScoringPolicy::Testing { fail_threshold } = policy else {
                continue;
            };
            state.score = (state.score - seq.deduction.max(0.0)).clamp(0.0, initial);
            if state.score < fail_threshold {
                state.stopped = true;
                state.stopped_at = Some(seq.end_frame);
                warn!(
                    person,
                    score = state.score,
                    fail_threshold,
                    frame = seq.end_frame,
                    "分数低于淘汰线, 停止评分"
                );
            }
        }
        state
    }

    pub fn state(&self, person: u32) -> Option<&PersonScoreState> {
        self.persons.get(&person)
    }

    pub fn is_stopped(&self, person: u32) -> bool {
        self.persons.get(&person).is_some_and(|s| s.stopped)
    }

    /// 所有人的当前分数
    pub fn scores(&self) -> BTreeMap<u32, f32> {
        self.persons.iter().map(|(id, s)| (*id, s.score)).collect()
    }

    /// 所有人已记录的错误序列
    pub fn errors(&self) -> BTreeMap<u32, Vec<ErrorSequence>> {
        self.persons
            .iter()
            .map(|(id, s)| (*id, s.errors.clone()))
            .collect()
    }

    pub fn persons(&self) -> impl Iterator<Item = (&u32, &PersonScoreState)> {
        self.persons.iter()
    }

    /// 恢复单人初始状态
    pub fn reset_person(&mut self, person: u32) {
        if let Some(state) = self.persons.get_mut(&person) {
            *state = PersonScoreState::new(self.initial_score);
            info!(person, "计分已重置");
        }
    }

    pub fn reset(&mut self) {
        self.persons.clear();
    }
}
