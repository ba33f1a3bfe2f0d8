//! 姿态特征向量 (用于时间对齐)
//!
//! 每帧 42 维: 8 个关节角 (÷π) + 8 个关节高度 + 13 个关节相对位置 (x, y)。
//! 高度与位置均以髋中点为原点、躯干长度为单位; 缺失关节贡献 0。

use ndarray::Array2;

use crate::detection::types::{
    PoseKeypoints, LEFT_ANKLE, LEFT_ELBOW, LEFT_HIP, LEFT_KNEE, LEFT_SHOULDER, LEFT_WRIST, NOSE,
    RIGHT_ANKLE, RIGHT_ELBOW, RIGHT_HIP, RIGHT_KNEE, RIGHT_SHOULDER, RIGHT_WRIST,
};

/// 特征维度
pub const FEATURE_DIM: usize = 8 + 8 + 13 * 2;

/// 关节角 (三点, 以中间点为顶点)
const ANGLE_JOINTS: [(usize, usize, usize); 8] = [
    (LEFT_SHOULDER, LEFT_ELBOW, LEFT_WRIST),   // 左肘
    (RIGHT_SHOULDER, RIGHT_ELBOW, RIGHT_WRIST), // 右肘
    (LEFT_HIP, LEFT_SHOULDER, LEFT_ELBOW),     // 左肩
    (RIGHT_HIP, RIGHT_SHOULDER, RIGHT_ELBOW),  // 右肩
    (LEFT_SHOULDER, LEFT_HIP, LEFT_KNEE),      // 左髋
    (RIGHT_SHOULDER, RIGHT_HIP, RIGHT_KNEE),   // 右髋
    (LEFT_HIP, LEFT_KNEE, LEFT_ANKLE),         // 左膝
    (RIGHT_HIP, RIGHT_KNEE, RIGHT_ANKLE),      // 右膝
];

/// 高度特征关节
const HEIGHT_JOINTS: [usize; 8] = [
    LEFT_ELBOW,
    RIGHT_ELBOW,
    LEFT_WRIST,
    RIGHT_WRIST,
    LEFT_KNEE,
    RIGHT_KNEE,
    LEFT_ANKLE,
    RIGHT_ANKLE,
];

/// 位置特征关节: 鼻子 + 躯干四肢 (5..=16)
const POSITION_JOINTS: [usize; 13] = [
    NOSE,
    LEFT_SHOULDER,
    RIGHT_SHOULDER,
    LEFT_ELBOW,
    RIGHT_ELBOW,
    LEFT_WRIST,
    RIGHT_WRIST,
    LEFT_HIP,
    RIGHT_HIP,
    LEFT_KNEE,
    RIGHT_KNEE,
    LEFT_ANKLE,
    RIGHT_ANKLE,
];

/// 单帧特征
pub fn pose_features(kp: &PoseKeypoints, min_conf: f32) -> [f32; FEATURE_DIM] {
    let mut f = [0.0_f32; FEATURE_DIM];

    for (i, &(a, b, c)) in ANGLE_JOINTS.iter().enumerate() {
        if let Some(angle) = kp.angle_3points(a, b, c, min_conf) {
            f[i] = angle / std::f32::consts::PI;
        }
    }

    let origin = kp.midpoint(LEFT_HIP, RIGHT_HIP, min_conf);
    let torso = kp.torso_length(min_conf);
    let (Some((hx, hy)), Some(torso)) = (origin, torso) else {
        return f;
    };

    for (i, &joint) in HEIGHT_JOINTS.iter().enumerate() {
        if let Some((_, y)) = kp.point(joint, min_conf) {
            f[8 + i] = (hy - y) / torso;
        }
    }

    for (i, &joint) in POSITION_JOINTS.iter().enumerate() {
        if let Some((x, y)) = kp.point(joint, min_conf) {
            f[16 + 2 * i] = (x - hx) / torso;
            f[16 + 2 * i + 1] = (y - hy) / torso;
        }
    }

    f
}

/// 序列特征矩阵 (帧数 × FEATURE_DIM)
pub fn sequence_features(frames: &[PoseKeypoints], min_conf: f32) -> Array2<f32> {
    let mut out = Array2::<f32>::zeros((frames.len(), FEATURE_DIM));
    for (i, kp) in frames.iter().enumerate() {
        let f = pose_features(kp, min_conf);
        for (j, v) in f.iter().enumerate() {
            out[[i, j]] = *v;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::types::tests::standing_pose;
    use crate::detection::types::MIN_KEYPOINT_CONF;

    #[test]
    fn test_features_translation_scale_invariant() {
        let a = pose_features(&standing_pose(100.0, 0.0, 100.0), MIN_KEYPOINT_CONF);
        let b = pose_features(&standing_pose(700.0, 300.0, 250.0), MIN_KEYPOINT_CONF);
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-4);
        }
    }

    #[test]
    fn test_missing_joints_are_zero() {
        let f = pose_features(&PoseKeypoints::default(), MIN_KEYPOINT_CONF);
        assert!(f.iter().all(|v| *v == 0.0));

        let mut kp = standing_pose(100.0, 0.0, 100.0);
        kp.points[LEFT_HIP].2 = 0.0;
        kp.points[RIGHT_HIP].2 = 0.0;
        let f = pose_features(&kp, MIN_KEYPOINT_CONF);
        // 没有髋中点时只剩肘部角度
        assert!(f[0] > 0.0);
        assert!(f[8..].iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_sequence_shape() {
        let frames = vec![standing_pose(100.0, 0.0, 100.0); 4];
        assert_eq!(sequence_features(&frames, 0.3).dim(), (4, FEATURE_DIM));
    }
}
