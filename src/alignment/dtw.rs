//! 动态时间规整 (DTW)
//! Dynamic time warping between a candidate and a reference pose sequence
//!
//! 候选者比参考动作快或慢 10% 时, 逐帧直接比较会让每一帧都因节奏被扣分,
//! 掩盖真正的动作错误; 对齐后按对应参考帧比较。

use ndarray::{Array2, ArrayView1};
use serde::{Deserialize, Serialize};

use super::features::sequence_features;
use crate::config::AlignmentConfig;
use crate::detection::types::PoseKeypoints;

/// 逐元素距离
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    #[default]
    Euclidean,
    Manhattan,
    Cosine,
}

impl DistanceMetric {
    pub fn distance(&self, a: ArrayView1<f32>, b: ArrayView1<f32>) -> f64 {
        match self {
            DistanceMetric::Euclidean => a
                .iter()
                .zip(b.iter())
                .map(|(x, y)| ((x - y) as f64).powi(2))
                .sum::<f64>()
                .sqrt(),
            DistanceMetric::Manhattan => a
                .iter()
                .zip(b.iter())
                .map(|(x, y)| ((x - y) as f64).abs())
                .sum(),
            DistanceMetric::Cosine => {
                let dot: f64 = a.iter().zip(b.iter()).map(|(x, y)| (x * y) as f64).sum();
                let na = a.iter().map(|x| (x * x) as f64).sum::<f64>().sqrt();
                let nb = b.iter().map(|x| (x * x) as f64).sum::<f64>().sqrt();
                match (na < 1e-12, nb < 1e-12) {
                    (true, true) => 0.0,
                    (true, false) | (false, true) => 1.0,
                    _ => 1.0 - (dot / (na * nb)).clamp(-1.0, 1.0),
                }
            }
        }
    }
}

/// 路径边界条件
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Boundary {
    /// 起点可以是任意参考帧 (候选历史被截断时)
    pub open_begin: bool,
    /// 终点可以是任意参考帧 (候选动作尚未结束时)
    pub open_end: bool,
}

impl Boundary {
    pub const FULL: Boundary = Boundary {
        open_begin: false,
        open_end: false,
    };
    pub const OPEN_END: Boundary = Boundary {
        open_begin: false,
        open_end: true,
    };
    pub const OPEN: Boundary = Boundary {
        open_begin: true,
        open_end: true,
    };
}

/// 对齐结果: 候选帧 → 参考帧
///
/// 路径在两个坐标上都单调不减; 一个候选帧对应多个参考帧时取第一个
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AlignmentMap {
    path: Vec<(usize, usize)>,
    mapping: Vec<usize>,
    cost: f64,
    tempo_ratio: f64,
}

impl AlignmentMap {
    pub fn empty() -> Self {
        Self {
            path: Vec::new(),
            mapping: Vec::new(),
            cost: 0.0,
            tempo_ratio: 1.0,
        }
    }

    fn from_path(path: Vec<(usize, usize)>, n: usize, cost: f64) -> Self {
        let mut mapping = vec![usize::MAX; n];
        for &(i, j) in &path {
            if mapping[i] == usize::MAX {
                mapping[i] = j;
            }
        }

        let tempo_ratio = match (path.first(), path.last()) {
            (Some(&(c0, r0)), Some(&(c1, r1))) => {
                (c1 - c0 + 1) as f64 / (r1 - r0 + 1) as f64
            }
            _ => 1.0,
        };

        Self {
            path,
            mapping,
            cost,
            tempo_ratio,
        }
    }

    /// 候选帧对应的参考帧
    pub fn lookup(&self, candidate_index: usize) -> Option<usize> {
        self.mapping
            .get(candidate_index)
            .copied()
            .filter(|&j| j != usize::MAX)
    }

    /// 候选长度 / 参考长度 (沿对齐路径)
    pub fn tempo_ratio(&self) -> f64 {
        self.tempo_ratio
    }

    pub fn cost(&self) -> f64 {
        self.cost
    }

    /// 平均每步代价
    pub fn normalized_cost(&self) -> f64 {
        if self.path.is_empty() {
            0.0
        } else {
            self.cost / self.path.len() as f64
        }
    }

    pub fn path(&self) -> &[(usize, usize)] {
        &self.path
    }

    /// 已映射的候选帧数
    pub fn len(&self) -> usize {
        self.mapping.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mapping.is_empty()
    }

    /// 最后一个候选帧对应的参考帧
    pub fn last_reference(&self) -> Option<usize> {
        self.path.last().map(|&(_, j)| j)
    }
}

/// 终点代价视为并列的相对容差
const END_TIE_TOLERANCE: f64 = 1e-6;

/// DTW 对齐器
#[derive(Clone, Debug)]
pub struct DtwAligner {
    /// Sakoe-Chiba 窗口半径, 0 表示不限制
    window_radius: usize,
    distance: DistanceMetric,
}

impl DtwAligner {
    pub fn new(window_radius: usize, distance: DistanceMetric) -> Self {
        Self {
            window_radius,
            distance,
        }
    }

    pub fn from_config(config: &AlignmentConfig) -> Self {
        Self::new(config.window_radius, config.distance)
    }

    /// 全序列对齐 (首尾对齐)
    pub fn align(&self, candidate: &Array2<f32>, reference: &Array2<f32>) -> AlignmentMap {
        self.align_with(candidate, reference, Boundary::FULL)
    }

    /// 直接对关键点序列对齐
    pub fn align_poses(
        &self,
        candidate: &[PoseKeypoints],
        reference: &[PoseKeypoints],
        min_conf: f32,
    ) -> AlignmentMap {
        self.align(
            &sequence_features(candidate, min_conf),
            &sequence_features(reference, min_conf),
        )
    }

    /// 指定边界条件的对齐
    pub fn align_with(
        &self,
        candidate: &Array2<f32>,
        reference: &Array2<f32>,
        boundary: Boundary,
    ) -> AlignmentMap {
        self.align_near(candidate, reference, boundary, None)
    }

    /// 开放终点对齐, 终点代价并列时取最接近 `end_hint` 的参考帧
    ///
    /// 周期性参考动作中同一姿态会在多个周期出现, 没有提示时取最早的一个
    pub fn align_near(
        &self,
        candidate: &Array2<f32>,
        reference: &Array2<f32>,
        boundary: Boundary,
        end_hint: Option<usize>,
    ) -> AlignmentMap {
        let n = candidate.nrows();
        let m = reference.nrows();
        if n == 0 || m == 0 || candidate.ncols() != reference.ncols() {
            return AlignmentMap::empty();
        }

        let inf = f64::INFINITY;
        let mut acc = Array2::<f64>::from_elem((n, m), inf);

        for i in 0..n {
            let (lo, hi) = self.band(i, n, m, boundary);
            for j in lo..=hi {
                let d = self.distance.distance(candidate.row(i), reference.row(j));
                let best_prev = if i == 0 && j == 0 {
                    0.0
                } else if i == 0 {
                    if boundary.open_begin {
                        0.0
                    } else {
                        acc[[0, j - 1]]
                    }
                } else if j == 0 {
                    acc[[i - 1, 0]]
                } else {
                    acc[[i - 1, j - 1]].min(acc[[i - 1, j]]).min(acc[[i, j - 1]])
                };
                acc[[i, j]] = d + best_prev;
            }
        }

        // 终点
        let end_j = if boundary.open_end {
            let last = acc.row(n - 1);
            let best = last.iter().copied().fold(inf, f64::min);
            let tolerance = END_TIE_TOLERANCE * (1.0 + best.abs());
            let mut ties = (0..m).filter(|&j| last[j] <= best + tolerance);
            let picked = match end_hint {
                Some(hint) => ties.min_by_key(|&j| j.abs_diff(hint)),
                None => ties.next(),
            };
            picked.unwrap_or(m - 1)
        } else {
            m - 1
        };
        let cost = acc[[n - 1, end_j]];
        if !cost.is_finite() {
            return AlignmentMap::empty();
        }

        // 回溯: 同代价时优先对角, 其次竖直, 最后水平
        let mut path = vec![(n - 1, end_j)];
        let (mut i, mut j) = (n - 1, end_j);
        loop {
            if i == 0 && (j == 0 || boundary.open_begin) {
                break;
            }
            if i == 0 {
                j -= 1;
            } else if j == 0 {
                i -= 1;
            } else {
                let diag = acc[[i - 1, j - 1]];
                let up = acc[[i - 1, j]];
                let left = acc[[i, j - 1]];
                if diag <= up && diag <= left {
                    i -= 1;
                    j -= 1;
                } else if up <= left {
                    i -= 1;
                } else {
                    j -= 1;
                }
            }
            path.push((i, j));
        }
        path.reverse();

        AlignmentMap::from_path(path, n, cost)
    }

    /// 第 i 个候选帧允许的参考帧区间 [lo, hi]
    fn band(&self, i: usize, n: usize, m: usize, boundary: Boundary) -> (usize, usize) {
        if self.window_radius == 0 || boundary.open_begin {
            return (0, m - 1);
        }
        let (center, radius) = if boundary.open_end {
            (i.min(m - 1), self.window_radius)
        } else {
            let center = if n > 1 {
                ((i as f64) * (m - 1) as f64 / (n - 1) as f64).round() as usize
            } else {
                0
            };
            (center, self.window_radius.max(n.abs_diff(m)))
        };
        (center.saturating_sub(radius), (center + radius).min(m - 1))
    }
}
