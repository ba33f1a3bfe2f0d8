//! 错误类型
//!
//! 调用方错误 (会话生命周期误用、参考动作加载失败) 通过 `Result` 返回;
//! 帧内的降级信号 (无检测、矩阵奇异、缺少参考、关键点格式错误) 不是错误,
//! 以 [`Degradation`] 的形式随帧结果一起上报, 永远不会中断处理。

use serde::Serialize;
use thiserror::Error;

/// 会话操作错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// 会话不存在
    #[error("会话不存在: {0}")]
    NotFound(String),

    /// 会话已存在, 重复启动
    #[error("会话已存在: {0}")]
    DuplicateSession(String),

    /// 帧序号没有严格递增
    #[error("会话 {session} 帧序号乱序: 上一帧 {last}, 本帧 {got}")]
    FrameOutOfOrder { session: String, last: u64, got: u64 },
}

/// 参考动作加载错误
#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("读取参考动作失败: {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("参考动作解析失败: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("参考动作 {0} 没有任何帧")]
    EmptySequence(String),

    #[error("参考动作ID重复: {0}")]
    DuplicateId(String),
}

/// 帧内降级信号 (非致命)
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Degradation {
    /// 本帧没有检测, 所有轨迹老化
    DetectionEmpty,
    /// 关联阶段协方差矩阵奇异, 已使用伪逆
    AssociationSingular,
    /// 该身份没有可用的参考动作, 使用默认阈值
    MissingReference { person: u32 },
    /// 关键点数量不符合格式, 跳过该身份的指标
    InvalidKeypointShape { person: u32, len: usize },
}
