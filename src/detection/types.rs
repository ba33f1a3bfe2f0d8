//! 检测输入数据结构定义
//! Data structures consumed from the external pose detector

use serde::{Deserialize, Serialize};

// ========== 公共常量 ==========

/// COCO 关键点数量
pub const NUM_KEYPOINTS: usize = 17;

/// 关键点最低可信度 (低于此值视为缺失)
pub const MIN_KEYPOINT_CONF: f32 = 0.3;

// COCO 17关键点: 0-鼻子, 5-左肩, 6-右肩, 7-左肘, 8-右肘, 9-左腕, 10-右腕,
// 11-左髋, 12-右髋, 13-左膝, 14-右膝, 15-左脚踝, 16-右脚踝
pub const NOSE: usize = 0;
pub const LEFT_SHOULDER: usize = 5;
pub const RIGHT_SHOULDER: usize = 6;
pub const LEFT_ELBOW: usize = 7;
pub const RIGHT_ELBOW: usize = 8;
pub const LEFT_WRIST: usize = 9;
pub const RIGHT_WRIST: usize = 10;
pub const LEFT_HIP: usize = 11;
pub const RIGHT_HIP: usize = 12;
pub const LEFT_KNEE: usize = 13;
pub const RIGHT_KNEE: usize = 14;
pub const LEFT_ANKLE: usize = 15;
pub const RIGHT_ANKLE: usize = 16;

// ========== 数据结构 ==========

/// 边界框 (x1, y1) 左上 / (x2, y2) 右下
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// 由中心点和宽高构造
    pub fn from_cxcywh(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self {
            x1: cx - w / 2.0,
            y1: cy - h / 2.0,
            x2: cx + w / 2.0,
            y2: cy + h / 2.0,
        }
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    /// 获取中心点
    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    /// [cx, cy, w, h]
    pub fn to_cxcywh(&self) -> [f32; 4] {
        let (cx, cy) = self.center();
        [cx, cy, self.width(), self.height()]
    }
}

/// 姿态关键点 (Pose keypoints)
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PoseKeypoints {
    pub points: Vec<(f32, f32, f32)>, // (x, y, confidence)
}

/// 单帧单人检测结果 (检测器 → 跟踪器)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BBox,
    pub confidence: f32,
    #[serde(default)]
    pub keypoints: PoseKeypoints,
}

impl Detection {
    pub fn new(bbox: BBox, confidence: f32, keypoints: PoseKeypoints) -> Self {
        Self {
            bbox,
            confidence,
            keypoints,
        }
    }
}

impl PoseKeypoints {
    pub fn new(points: Vec<(f32, f32, f32)>) -> Self {
        Self { points }
    }

    /// 关键点数量是否符合COCO格式
    pub fn is_well_formed(&self) -> bool {
        self.points.len() == NUM_KEYPOINTS
    }

    /// 取出可信关键点坐标,缺失或低置信度时返回 None
    pub fn point(&self, idx: usize, min_conf: f32) -> Option<(f32, f32)> {
        let &(x, y, c) = self.points.get(idx)?;
        if c < min_conf || !x.is_finite() || !y.is_finite() {
            return None;
        }
        Some((x, y))
    }

    /// 两个关键点的中点
    pub fn midpoint(&self, a: usize, b: usize, min_conf: f32) -> Option<(f32, f32)> {
        let (x1, y1) = self.point(a, min_conf)?;
        let (x2, y2) = self.point(b, min_conf)?;
        Some(((x1 + x2) / 2.0, (y1 + y2) / 2.0))
    }

    /// 两点间距离
    pub fn bone_length(&self, a: usize, b: usize, min_conf: f32) -> Option<f32> {
        let (x1, y1) = self.point(a, min_conf)?;
        let (x2, y2) = self.point(b, min_conf)?;
        Some(((x2 - x1).powi(2) + (y2 - y1).powi(2)).sqrt())
    }

    /// 三点夹角 (以 b 为顶点, 弧度)
    pub fn angle_3points(&self, a: usize, b: usize, c: usize, min_conf: f32) -> Option<f32> {
        let (x1, y1) = self.point(a, min_conf)?;
        let (x2, y2) = self.point(b, min_conf)?;
        let (x3, y3) = self.point(c, min_conf)?;

        let v1 = (x1 - x2, y1 - y2);
        let v2 = (x3 - x2, y3 - y2);
        let mag1 = (v1.0 * v1.0 + v1.1 * v1.1).sqrt();
        let mag2 = (v2.0 * v2.0 + v2.1 * v2.1).sqrt();
        if mag1 < 1e-6 || mag2 < 1e-6 {
            return None;
        }

        let dot = v1.0 * v2.0 + v1.1 * v2.1;
        Some((dot / (mag1 * mag2)).clamp(-1.0, 1.0).acos())
    }

    /// 躯干长度: 左右肩-髋距离的平均
    pub fn torso_length(&self, min_conf: f32) -> Option<f32> {
        let lengths: Vec<f32> = [
            self.bone_length(LEFT_SHOULDER, LEFT_HIP, min_conf),
            self.bone_length(RIGHT_SHOULDER, RIGHT_HIP, min_conf),
        ]
        .into_iter()
        .flatten()
        .collect();

        if lengths.is_empty() {
            // 单侧全部缺失时用肩中点-髋中点
            let (sx, sy) = self.midpoint(LEFT_SHOULDER, RIGHT_SHOULDER, min_conf)?;
            let (hx, hy) = self.midpoint(LEFT_HIP, RIGHT_HIP, min_conf)?;
            let len = ((sx - hx).powi(2) + (sy - hy).powi(2)).sqrt();
            return (len > 1e-6).then_some(len);
        }

        let len = lengths.iter().sum::<f32>() / lengths.len() as f32;
        (len > 1e-6).then_some(len)
    }

    /// 肢体/躯干长度比 (上臂与大腿的平均长度 / 躯干长度)
    ///
    /// 同一个人的骨骼比例在帧间应基本恒定,用于判断轨迹是否稳定
    pub fn limb_torso_ratio(&self, min_conf: f32) -> Option<f32> {
        let torso = self.torso_length(min_conf)?;
        let limbs: Vec<f32> = [
            self.bone_length(LEFT_SHOULDER, LEFT_ELBOW, min_conf),
            self.bone_length(RIGHT_SHOULDER, RIGHT_ELBOW, min_conf),
            self.bone_length(LEFT_HIP, LEFT_KNEE, min_conf),
            self.bone_length(RIGHT_HIP, RIGHT_KNEE, min_conf),
        ]
        .into_iter()
        .flatten()
        .collect();

        if limbs.is_empty() {
            return None;
        }
        Some(limbs.iter().sum::<f32>() / limbs.len() as f32 / torso)
    }

    /// 可信关键点数量
    pub fn visible_count(&self, min_conf: f32) -> usize {
        self.points.iter().filter(|(_, _, c)| *c >= min_conf).count()
    }

    /// 提取ReID特征向量 (基于姿态关键点)
    /// 返回64维特征向量, 无关键点时返回 None
    pub fn extract_reid_features(&self, bbox: &BBox) -> Option<Vec<f32>> {
        if self.visible_count(MIN_KEYPOINT_CONF) == 0 {
            return None;
        }

        // 归一化关键点到边界框坐标系 (0-1)
        let bbox_w = bbox.width().max(1.0);
        let bbox_h = bbox.height().max(1.0);
        let normalized = PoseKeypoints::new(
            self.points
                .iter()
                .map(|(x, y, c)| ((x - bbox.x1) / bbox_w, (y - bbox.y1) / bbox_h, *c))
                .collect(),
        );

        let mut features = Vec::with_capacity(64);

        // 1. 关键点位置特征 (17个关键点 × 2坐标 = 34维)
        for idx in 0..NUM_KEYPOINTS {
            let (x, y) = normalized.point(idx, MIN_KEYPOINT_CONF).unwrap_or((0.0, 0.0));
            features.push(x);
            features.push(y);
        }

        // 2. 骨骼长度特征 (8维)
        let c = MIN_KEYPOINT_CONF;
        for (a, b) in [
            (LEFT_SHOULDER, RIGHT_SHOULDER), // 肩宽
            (LEFT_HIP, RIGHT_HIP),           // 髋宽
            (LEFT_SHOULDER, LEFT_HIP),       // 左身体长
            (RIGHT_SHOULDER, RIGHT_HIP),     // 右身体长
            (LEFT_HIP, LEFT_KNEE),           // 左大腿
            (RIGHT_HIP, RIGHT_KNEE),         // 右大腿
            (LEFT_KNEE, LEFT_ANKLE),         // 左小腿
            (RIGHT_KNEE, RIGHT_ANKLE),       // 右小腿
        ] {
            features.push(normalized.bone_length(a, b, c).unwrap_or(0.0));
        }

        // 3. 姿态角度特征 (6维)
        for (a, b, d) in [
            (LEFT_HIP, LEFT_SHOULDER, LEFT_ELBOW),
            (RIGHT_HIP, RIGHT_SHOULDER, RIGHT_ELBOW),
            (LEFT_SHOULDER, LEFT_HIP, LEFT_KNEE),
            (RIGHT_SHOULDER, RIGHT_HIP, RIGHT_KNEE),
            (LEFT_HIP, LEFT_KNEE, LEFT_ANKLE),
            (RIGHT_HIP, RIGHT_KNEE, RIGHT_ANKLE),
        ] {
            features.push(normalized.angle_3points(a, b, d, c).unwrap_or(0.0));
        }

        // 4. 外观特征 (3维) - 基于边界框与关键点密度
        features.push(bbox_w / bbox_h);
        features.push(normalized.visible_count(c) as f32 / NUM_KEYPOINTS as f32);
        features.push(normalized.limb_torso_ratio(c).unwrap_or(0.0));

        // 补齐到64维
        features.resize(64, 0.0);

        // L2归一化
        let norm = features.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm <= 1e-6 {
            return None;
        }
        features.iter_mut().for_each(|x| *x /= norm);
        Some(features)
    }
}

/// 余弦相似度, 维度不一致或零向量时返回 None
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na < 1e-9 || nb < 1e-9 {
        return None;
    }
    Some((dot / (na * nb)).clamp(-1.0, 1.0))
}
