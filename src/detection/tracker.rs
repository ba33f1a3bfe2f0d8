//! 多目标跟踪公共组件
//! Common components for multi-person tracking

use nalgebra::{Matrix4, SMatrix, SVector, Vector4};
use serde::Serialize;

use super::types::{BBox, Detection, PoseKeypoints};

// ========== 公共数据结构 ==========

/// 轨迹生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum TrackState {
    /// 新建, 尚未确认
    #[default]
    New,
    /// 正常跟踪中
    Tracked,
    /// 暂时丢失 (保留窗口内可找回)
    Lost,
    /// 已移除, ID 不再复用
    Removed,
}

/// 单条轨迹的对外快照
#[derive(Debug, Clone, Serialize)]
pub struct TrackSnapshot {
    pub id: u32,
    pub state: TrackState,
    pub bbox: BBox,
    pub keypoints: PoseKeypoints,
    /// 本帧是否有检测关联
    pub visible: bool,
    /// 累计被跟踪的帧数
    pub hits: u32,
    pub frames_lost: u32,
    /// 近期检测置信度均值
    pub score: f32,
}

/// 跟踪器单帧输出
#[derive(Debug, Clone, Default, Serialize)]
pub struct TrackerOutput {
    /// 本帧可见的身份
    pub visible: Vec<u32>,
    /// 历史上判定为稳定的身份
    pub stable: Vec<u32>,
    /// 所有存活轨迹的最新状态
    pub tracks: Vec<TrackSnapshot>,
    /// 本帧是否有协方差矩阵奇异 (已用伪逆替代)
    pub singular: bool,
}

impl TrackerOutput {
    pub fn track(&self, id: u32) -> Option<&TrackSnapshot> {
        self.tracks.iter().find(|t| t.id == id)
    }
}

// ========== 外观特征 ==========

/// 外观特征来源 (例如外部 ReID 模型), 由调用方注入
pub trait AppearanceSource {
    /// 返回检测的外观向量, 无法提取时返回 None
    fn embed(&self, detection: &Detection) -> Option<Vec<f32>>;
}

/// 基于姿态关键点的外观特征 (无外部模型时的后备)
#[derive(Debug, Clone, Copy, Default)]
pub struct PoseEmbedding;

impl AppearanceSource for PoseEmbedding {
    fn embed(&self, detection: &Detection) -> Option<Vec<f32>> {
        detection.keypoints.extract_reid_features(&detection.bbox)
    }
}

// ========== 卡尔曼滤波器 ==========

/// 边界框卡尔曼滤波器 (匀速运动模型)
/// 状态向量: [cx, cy, w, h, vx, vy, vw, vh], 观测: [cx, cy, w, h]
///
/// 噪声标准差与框高成正比, 并由调用方按近期运动强度缩放
#[derive(Clone, Debug)]
pub struct KalmanBoxFilter {
    /// 状态估计
    x: SVector<f64, 8>,
    /// 估计误差协方差
    p: SMatrix<f64, 8, 8>,
    /// 状态转移矩阵 F
    motion: SMatrix<f64, 8, 8>,
    /// 位置噪声权重 (相对框高)
    std_weight_position: f64,
    /// 速度噪声权重 (相对框高)
    std_weight_velocity: f64,
}

impl KalmanBoxFilter {
    /// 创建新的卡尔曼滤波器
    ///
    /// # 参数
    /// - `bbox`: 初始边界框
    /// - `std_weight_position`: 位置噪声权重 (典型 1/20)
    /// - `std_weight_velocity`: 速度噪声权重 (典型 1/160)
    pub fn new(bbox: &BBox, std_weight_position: f64, std_weight_velocity: f64) -> Self {
        let [cx, cy, w, h] = bbox.to_cxcywh();
        let mut x = SVector::<f64, 8>::zeros();
        x[0] = cx as f64;
        x[1] = cy as f64;
        x[2] = w.max(1.0) as f64;
        x[3] = h.max(1.0) as f64;

        let hh = x[3];
        let sp = 2.0 * std_weight_position * hh;
        let sv = 10.0 * std_weight_velocity * hh;
        let std = SVector::<f64, 8>::from_iterator([sp, sp, sp, sp, sv, sv, sv, sv]);
        let p = SMatrix::<f64, 8, 8>::from_diagonal(&std.component_mul(&std));

        let mut motion = SMatrix::<f64, 8, 8>::identity();
        for i in 0..4 {
            motion[(i, i + 4)] = 1.0;
        }

        Self {
            x,
            p,
            motion,
            std_weight_position,
            std_weight_velocity,
        }
    }

    /// 预测下一帧状态
    ///
    /// `q_scale`: 过程噪声缩放 (运动越剧烈越大)
    pub fn predict(&mut self, q_scale: f64) {
        // x = F x
        self.x = self.motion * self.x;
        self.x[2] = self.x[2].max(1.0);
        self.x[3] = self.x[3].max(1.0);

        // P = F P Fᵀ + Q
        let h = self.x[3];
        let sp = self.std_weight_position * h;
        let sv = self.std_weight_velocity * h;
        let q = SVector::<f64, 8>::from_iterator([sp, sp, sp, sp, sv, sv, sv, sv]);
        let q = SMatrix::<f64, 8, 8>::from_diagonal(&(q.component_mul(&q) * q_scale));
        self.p = self.motion * self.p * self.motion.transpose() + q;
    }

    /// 融合观测值
    ///
    /// `r_scale`: 观测噪声缩放。返回 true 表示新息协方差奇异, 已改用伪逆
    pub fn update(&mut self, bbox: &BBox, r_scale: f64) -> bool {
        let [cx, cy, w, h] = bbox.to_cxcywh();
        let z = Vector4::new(cx as f64, cy as f64, w as f64, h as f64);
        let sr = self.std_weight_position * self.x[3];

        // 新息 y = z - H x
        let y = z - self.x.fixed_rows::<4>(0);

        // S = H P Hᵀ + R
        let innov: Matrix4<f64> = self.p.fixed_view::<4, 4>(0, 0).into_owned()
            + Matrix4::from_diagonal_element(sr * sr * r_scale);
        let (innov_inv, singular) = match innov.try_inverse() {
            Some(inv) => (inv, false),
            None => match innov.pseudo_inverse(1e-12) {
                Ok(pinv) => (pinv, true),
                // SVD 不收敛: 放弃本次观测
                Err(_) => return true,
            },
        };

        // K = P Hᵀ S⁻¹
        let k: SMatrix<f64, 8, 4> = self.p.fixed_view::<8, 4>(0, 0) * innov_inv;

        self.x += k * y;
        self.x[2] = self.x[2].max(1.0);
        self.x[3] = self.x[3].max(1.0);

        // P = (I - K H) P
        let mut kh = SMatrix::<f64, 8, 8>::zeros();
        kh.fixed_view_mut::<8, 4>(0, 0).copy_from(&k);
        self.p = (SMatrix::<f64, 8, 8>::identity() - kh) * self.p;

        singular
    }

    /// 获取当前状态的边界框
    pub fn get_state_bbox(&self) -> BBox {
        BBox::from_cxcywh(
            self.x[0] as f32,
            self.x[1] as f32,
            self.x[2] as f32,
            self.x[3] as f32,
        )
    }

    /// 获取速度向量 (中心点, 像素/帧)
    pub fn get_velocity(&self) -> (f32, f32) {
        (self.x[4] as f32, self.x[5] as f32)
    }
}

/// 单坐标轴的 [位置, 速度] 滤波状态
#[derive(Clone, Copy, Debug)]
struct AxisState {
    pos: f64,
    vel: f64,
    p: [[f64; 2]; 2],
}

impl AxisState {
    fn new(pos: f64) -> Self {
        Self {
            pos,
            vel: 0.0,
            p: [[10.0, 0.0], [0.0, 10.0]],
        }
    }

    fn predict(&mut self, q: f64) {
        self.pos += self.vel;
        let [[p00, p01], [p10, p11]] = self.p;
        // P = F P Fᵀ + Q, F = [[1,1],[0,1]]
        self.p = [
            [p00 + p01 + p10 + p11 + q, p01 + p11],
            [p10 + p11, p11 + q],
        ];
    }

    fn update(&mut self, z: f64, r: f64) {
        let s = self.p[0][0] + r;
        if s <= f64::EPSILON {
            return;
        }
        let k0 = self.p[0][0] / s;
        let k1 = self.p[1][0] / s;
        let y = z - self.pos;
        self.pos += k0 * y;
        self.vel += k1 * y;
        let [[p00, p01], [p10, p11]] = self.p;
        self.p = [
            [(1.0 - k0) * p00, (1.0 - k0) * p01],
            [p10 - k1 * p00, p11 - k1 * p01],
        ];
    }
}

/// 关键点卡尔曼滤波器 (每个关节独立的匀速模型)
#[derive(Clone, Debug)]
pub struct KalmanKeypointFilter {
    joints: Vec<Option<(AxisState, AxisState, f32)>>,
    q: f64,
    r: f64,
    min_conf: f32,
}

impl KalmanKeypointFilter {
    pub fn new(keypoints: &PoseKeypoints, q: f64, r: f64, min_conf: f32) -> Self {
        let mut filter = Self {
            joints: vec![None; keypoints.points.len()],
            q,
            r,
            min_conf,
        };
        filter.update(keypoints, 1.0);
        filter
    }

    pub fn predict(&mut self, q_scale: f64) {
        let q = self.q * q_scale;
        for (ax, ay, conf) in self.joints.iter_mut().flatten() {
            ax.predict(q);
            ay.predict(q);
            // 仅预测未观测时置信度逐帧衰减
            *conf *= 0.5;
        }
    }

    pub fn update(&mut self, keypoints: &PoseKeypoints, r_scale: f64) {
        if self.joints.len() < keypoints.points.len() {
            self.joints.resize(keypoints.points.len(), None);
        }
        let r = self.r * r_scale;
        for (slot, &(x, y, c)) in self.joints.iter_mut().zip(&keypoints.points) {
            let observed = x.is_finite() && y.is_finite() && c >= self.min_conf;
            if !observed {
                // 检测器判为遮挡: 保留运动状态, 但对外置信度取本帧观测值
                if let Some((_, _, conf)) = slot {
                    *conf = if c < self.min_conf { c.max(0.0) } else { 0.0 };
                }
                continue;
            }
            match slot {
                Some((ax, ay, conf)) => {
                    ax.update(x as f64, r);
                    ay.update(y as f64, r);
                    *conf = c;
                }
                None => *slot = Some((AxisState::new(x as f64), AxisState::new(y as f64), c)),
            }
        }
    }

    /// 滤波后的关键点
    pub fn keypoints(&self) -> PoseKeypoints {
        PoseKeypoints::new(
            self.joints
                .iter()
                .map(|j| match j {
                    Some((ax, ay, c)) => (ax.pos as f32, ay.pos as f32, *c),
                    None => (0.0, 0.0, 0.0),
                })
                .collect(),
        )
    }
}

// ========== 跟踪器统一接口 ==========

/// 多目标跟踪器 Trait
///
/// 通用关联跟踪 (ByteTrack式) 与固定队形分配都实现此接口
pub trait Tracker {
    /// 更新跟踪器
    ///
    /// # 参数
    /// - `detections`: 当前帧的检测 (框 + 置信度 + 关键点)
    /// - `frame_index`: 帧序号, 必须严格递增
    /// - `appearance`: 可选的外观特征来源
    ///
    /// # 返回
    /// 当前帧的跟踪输出
    fn update(
        &mut self,
        detections: &[Detection],
        frame_index: u64,
        appearance: Option<&dyn AppearanceSource>,
    ) -> TrackerOutput;

    /// 重置跟踪器 (清除所有跟踪)
    fn reset(&mut self);

    /// 获取当前跟踪数量
    fn track_count(&self) -> usize;
}

// ========== 工具函数 ==========

/// 计算两个边界框的IOU (Intersection over Union)
pub fn compute_iou(bbox1: &BBox, bbox2: &BBox) -> f32 {
    let x1 = bbox1.x1.max(bbox2.x1);
    let y1 = bbox1.y1.max(bbox2.y1);
    let x2 = bbox1.x2.min(bbox2.x2);
    let y2 = bbox1.y2.min(bbox2.y2);

    if x2 <= x1 || y2 <= y1 {
        return 0.0;
    }

    let intersection = (x2 - x1) * (y2 - y1);
    let union = bbox1.area() + bbox2.area() - intersection;

    if union <= 0.0 {
        return 0.0;
    }

    intersection / union
}

/// 近期运动强度 → (过程噪声缩放, 观测噪声缩放)
///
/// `speeds` 为相对框高的中心位移; 均值越大过程噪声越大, 方差越大观测噪声越大
pub fn motion_noise_scales(speeds: &[f32], reference_speed: f32, max_scale: f32) -> (f64, f64) {
    if speeds.is_empty() || reference_speed <= 0.0 {
        return (1.0, 1.0);
    }
    let n = speeds.len() as f32;
    let mean = speeds.iter().sum::<f32>() / n;
    let var = speeds.iter().map(|s| (s - mean).powi(2)).sum::<f32>() / n;

    let max_scale = max_scale.max(1.0);
    let q = (1.0 + mean / reference_speed).clamp(1.0, max_scale);
    let r = (1.0 + var.sqrt() / reference_speed).clamp(1.0, max_scale);
    (q as f64, r as f64)
}
