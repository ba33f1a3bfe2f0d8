//! 时间平滑 (关键点 / 指标数值流)
//!
//! 每个人独立持有平滑状态, 会话重置时必须清空

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::detection::types::PoseKeypoints;

/// 平滑方式
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum SmoothingMethod {
    /// 不平滑
    #[default]
    None,
    /// 滑动窗口均值
    MovingAverage { window: usize },
    /// 指数平滑, alpha 为新值权重
    Exponential { alpha: f32 },
}

/// 标量平滑器
#[derive(Clone, Debug)]
pub struct ScalarSmoother {
    method: SmoothingMethod,
    history: VecDeque<f32>,
    ema: Option<f32>,
}

impl ScalarSmoother {
    pub fn new(method: SmoothingMethod) -> Self {
        let capacity = match method {
            SmoothingMethod::MovingAverage { window } => window.max(1),
            _ => 0,
        };
        Self {
            method,
            history: VecDeque::with_capacity(capacity),
            ema: None,
        }
    }

    /// 输入新值, 返回平滑后的值
    pub fn smooth(&mut self, value: f32) -> f32 {
        match self.method {
            SmoothingMethod::None => value,
            SmoothingMethod::MovingAverage { window } => {
                self.history.push_back(value);
                while self.history.len() > window.max(1) {
                    self.history.pop_front();
                }
                self.history.iter().sum::<f32>() / self.history.len() as f32
            }
            SmoothingMethod::Exponential { alpha } => {
                let alpha = alpha.clamp(0.0, 1.0);
                let next = match self.ema {
                    Some(prev) => alpha * value + (1.0 - alpha) * prev,
                    None => value,
                };
                self.ema = Some(next);
                next
            }
        }
    }

    pub fn reset(&mut self) {
        self.history.clear();
        self.ema = None;
    }
}

/// 关键点平滑器: 每个关节的 x/y 分别平滑, 低置信度关节不参与
#[derive(Clone, Debug)]
pub struct KeypointSmoother {
    method: SmoothingMethod,
    min_conf: f32,
    joints: Vec<(ScalarSmoother, ScalarSmoother)>,
}

impl KeypointSmoother {
    pub fn new(method: SmoothingMethod, min_conf: f32) -> Self {
        Self {
            method,
            min_conf,
            joints: Vec::new(),
        }
    }

    pub fn smooth(&mut self, keypoints: &PoseKeypoints) -> PoseKeypoints {
        if self.method == SmoothingMethod::None {
            return keypoints.clone();
        }
        while self.joints.len() < keypoints.points.len() {
            self.joints.push((
                ScalarSmoother::new(self.method),
                ScalarSmoother::new(self.method),
            ));
        }

        let points = keypoints
            .points
            .iter()
            .zip(self.joints.iter_mut())
            .map(|(&(x, y, c), (sx, sy))| {
                if c < self.min_conf || !x.is_finite() || !y.is_finite() {
                    (x, y, c)
                } else {
                    (sx.smooth(x), sy.smooth(y), c)
                }
            })
            .collect();
        PoseKeypoints::new(points)
    }

    pub fn reset(&mut self) {
        self.joints.clear();
    }
}
