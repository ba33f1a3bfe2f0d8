//! 姿态指标定义与计算
//!
//! 所有角度以度为单位; 高度以躯干长度为单位。
//! 关节缺失或置信度不足时指标不可用 (返回 None), 不会报错。

use std::fmt;
use std::str::FromStr;

use phf::phf_map;
use serde::{Deserialize, Serialize};

use crate::detection::types::{
    PoseKeypoints, LEFT_ANKLE, LEFT_ELBOW, LEFT_HIP, LEFT_KNEE, LEFT_SHOULDER, LEFT_WRIST, NOSE,
    RIGHT_ANKLE, RIGHT_ELBOW, RIGHT_HIP, RIGHT_KNEE, RIGHT_SHOULDER, RIGHT_WRIST,
};

/// 指标类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    Angle,
    Height,
    Balance,
}

/// 身体部位
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyPart {
    Arm,
    Leg,
    Head,
    Shoulder,
    Hip,
    Torso,
}

/// 左右侧
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub fn name(&self) -> &'static str {
        match self {
            Side::Left => "left",
            Side::Right => "right",
        }
    }
}

/// 指标种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// 肩-肘-腕夹角
    ArmAngle,
    /// 髋-膝-踝夹角
    LegAngle,
    /// 手腕相对肩部的高度
    ArmHeight,
    /// 头部相对肩中点的偏斜
    HeadAngle,
    /// 肩线与水平线夹角
    ShoulderBalance,
    /// 髋线与水平线夹角
    HipBalance,
    /// 躯干与竖直线夹角
    TorsoLean,
}

/// 指标名称 → 种类
static METRIC_NAMES: phf::Map<&'static str, MetricKind> = phf_map! {
    "arm_angle" => MetricKind::ArmAngle,
    "leg_angle" => MetricKind::LegAngle,
    "arm_height" => MetricKind::ArmHeight,
    "head_angle" => MetricKind::HeadAngle,
    "shoulder_balance" => MetricKind::ShoulderBalance,
    "hip_balance" => MetricKind::HipBalance,
    "torso_lean" => MetricKind::TorsoLean,
};

impl MetricKind {
    pub const ALL: [MetricKind; 7] = [
        MetricKind::ArmAngle,
        MetricKind::LegAngle,
        MetricKind::ArmHeight,
        MetricKind::HeadAngle,
        MetricKind::ShoulderBalance,
        MetricKind::HipBalance,
        MetricKind::TorsoLean,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        METRIC_NAMES.get(name).copied()
    }

    pub fn name(&self) -> &'static str {
        match self {
            MetricKind::ArmAngle => "arm_angle",
            MetricKind::LegAngle => "leg_angle",
            MetricKind::ArmHeight => "arm_height",
            MetricKind::HeadAngle => "head_angle",
            MetricKind::ShoulderBalance => "shoulder_balance",
            MetricKind::HipBalance => "hip_balance",
            MetricKind::TorsoLean => "torso_lean",
        }
    }

    pub fn metric_type(&self) -> MetricType {
        match self {
            MetricKind::ArmAngle | MetricKind::LegAngle | MetricKind::HeadAngle => {
                MetricType::Angle
            }
            MetricKind::ArmHeight => MetricType::Height,
            MetricKind::ShoulderBalance | MetricKind::HipBalance | MetricKind::TorsoLean => {
                MetricType::Balance
            }
        }
    }

    pub fn body_part(&self) -> BodyPart {
        match self {
            MetricKind::ArmAngle | MetricKind::ArmHeight => BodyPart::Arm,
            MetricKind::LegAngle => BodyPart::Leg,
            MetricKind::HeadAngle => BodyPart::Head,
            MetricKind::ShoulderBalance => BodyPart::Shoulder,
            MetricKind::HipBalance => BodyPart::Hip,
            MetricKind::TorsoLean => BodyPart::Torso,
        }
    }

    /// 是否区分左右
    pub fn sided(&self) -> bool {
        matches!(
            self,
            MetricKind::ArmAngle | MetricKind::LegAngle | MetricKind::ArmHeight
        )
    }
}

/// 指标键: 种类 + 可选的左右侧, 文本形式 `arm_angle.left`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MetricKey {
    pub kind: MetricKind,
    pub side: Option<Side>,
}

impl MetricKey {
    pub fn new(kind: MetricKind, side: Option<Side>) -> Self {
        Self { kind, side }
    }

    /// 所有指标键 (区分左右的指标展开为两个)
    pub fn all() -> Vec<MetricKey> {
        let mut keys = Vec::new();
        for kind in MetricKind::ALL {
            if kind.sided() {
                keys.push(MetricKey::new(kind, Some(Side::Left)));
                keys.push(MetricKey::new(kind, Some(Side::Right)));
            } else {
                keys.push(MetricKey::new(kind, None));
            }
        }
        keys
    }

    /// 从关键点计算指标值
    pub fn compute(&self, kp: &PoseKeypoints, min_conf: f32) -> Option<f32> {
        let value = match (self.kind, self.side) {
            (MetricKind::ArmAngle, Some(side)) => {
                let (s, e, w) = match side {
                    Side::Left => (LEFT_SHOULDER, LEFT_ELBOW, LEFT_WRIST),
                    Side::Right => (RIGHT_SHOULDER, RIGHT_ELBOW, RIGHT_WRIST),
                };
                kp.angle_3points(s, e, w, min_conf)?.to_degrees()
            }
            (MetricKind::LegAngle, Some(side)) => {
                let (h, k, a) = match side {
                    Side::Left => (LEFT_HIP, LEFT_KNEE, LEFT_ANKLE),
                    Side::Right => (RIGHT_HIP, RIGHT_KNEE, RIGHT_ANKLE),
                };
                kp.angle_3points(h, k, a, min_conf)?.to_degrees()
            }
            (MetricKind::ArmHeight, Some(side)) => {
                let (s, w) = match side {
                    Side::Left => (LEFT_SHOULDER, LEFT_WRIST),
                    Side::Right => (RIGHT_SHOULDER, RIGHT_WRIST),
                };
                let (_, sy) = kp.point(s, min_conf)?;
                let (_, wy) = kp.point(w, min_conf)?;
                // 图像 y 轴向下, 手腕高于肩部为正
                (sy - wy) / kp.torso_length(min_conf)?
            }
            (MetricKind::HeadAngle, None) => {
                let (mx, my) = kp.midpoint(LEFT_SHOULDER, RIGHT_SHOULDER, min_conf)?;
                let (nx, ny) = kp.point(NOSE, min_conf)?;
                angle_from_vertical(nx - mx, ny - my)?
            }
            (MetricKind::ShoulderBalance, None) => {
                line_tilt(kp, LEFT_SHOULDER, RIGHT_SHOULDER, min_conf)?
            }
            (MetricKind::HipBalance, None) => line_tilt(kp, LEFT_HIP, RIGHT_HIP, min_conf)?,
            (MetricKind::TorsoLean, None) => {
                let (sx, sy) = kp.midpoint(LEFT_SHOULDER, RIGHT_SHOULDER, min_conf)?;
                let (hx, hy) = kp.midpoint(LEFT_HIP, RIGHT_HIP, min_conf)?;
                angle_from_vertical(sx - hx, sy - hy)?
            }
            // 种类与左右侧不匹配
            _ => return None,
        };
        value.is_finite().then_some(value)
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.side {
            Some(side) => write!(f, "{}.{}", self.kind.name(), side.name()),
            None => write!(f, "{}", self.kind.name()),
        }
    }
}

impl FromStr for MetricKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, side) = match s.split_once('.') {
            Some((name, "left")) => (name, Some(Side::Left)),
            Some((name, "right")) => (name, Some(Side::Right)),
            Some((_, other)) => return Err(format!("未知的左右侧: {}", other)),
            None => (s, None),
        };
        let kind = MetricKind::from_name(name).ok_or_else(|| format!("未知指标: {}", name))?;
        Ok(MetricKey::new(kind, side))
    }
}

/// 向量 (dx, dy) 与竖直向上方向的夹角 (度, 带符号)
fn angle_from_vertical(dx: f32, dy: f32) -> Option<f32> {
    if dx.abs() < 1e-6 && dy.abs() < 1e-6 {
        return None;
    }
    Some(dx.atan2(-dy).to_degrees())
}

/// 左右关节连线与水平线的夹角 (度), 与人物朝向无关
fn line_tilt(kp: &PoseKeypoints, left: usize, right: usize, min_conf: f32) -> Option<f32> {
    let (lx, ly) = kp.point(left, min_conf)?;
    let (rx, ry) = kp.point(right, min_conf)?;
    let dx = (rx - lx).abs();
    let dy = ry - ly;
    if dx < 1e-6 && dy.abs() < 1e-6 {
        return None;
    }
    Some(dy.atan2(dx).to_degrees())
}
