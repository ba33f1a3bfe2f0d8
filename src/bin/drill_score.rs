//! 队列动作批量评分
//!
//! 读取外部姿态检测器导出的逐帧检测 (JSON Lines), 每个输入文件一个会话,
//! 多个会话并行评分, 最后输出分数与错误序列报告。
//!
//! 输入每行: `{"frame_index": 0, "timestamp": 0.0, "detections": [...]}`
//!
//! 直接运行: cargo run --release --bin drill-score -- --reference golden.json --input squad.jsonl
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use crossbeam_channel::unbounded;
use mimalloc::MiMalloc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use drill_score::{
    Detection, ErrorSequence, PipelineConfig, ReferenceLibrary, Session,
    SessionMode, SessionSummary,
};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// 评分模式
#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    Testing,
    Practising,
}

impl From<Mode> for SessionMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Testing => SessionMode::Testing,
            Mode::Practising => SessionMode::Practising,
        }
    }
}

/// 批量评分参数
#[derive(Parser, Debug)]
#[command(author, version, about = "队列动作评分 - 批量处理检测结果", long_about = None)]
struct Args {
    /// 流水线配置文件 (JSON), 缺省使用内置默认值
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 参考动作文件 (JSON, 单个或数组), 可多次指定
    #[arg(short, long, required = true)]
    reference: Vec<PathBuf>,

    /// 逐帧检测文件 (JSON Lines), 每个文件一个会话
    #[arg(short, long, required = true)]
    input: Vec<PathBuf>,

    /// 评分模式
    #[arg(short, long, value_enum, default_value = "testing")]
    mode: Mode,

    /// 覆盖配置中的淘汰分数线
    #[arg(long)]
    fail_threshold: Option<f32>,

    /// 报告输出路径, 缺省输出到标准输出
    #[arg(short, long)]
    output: Option<PathBuf>,
}

/// 输入文件中的一帧
#[derive(Debug, Deserialize)]
struct FrameRecord {
    frame_index: u64,
    #[serde(default)]
    timestamp: f64,
    #[serde(default)]
    detections: Vec<Detection>,
}

/// 单个会话的报告
#[derive(Debug, Serialize)]
struct SessionReport {
    session_id: String,
    summary: SessionSummary,
    errors: BTreeMap<u32, Vec<ErrorSequence>>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(fail) = args.fail_threshold {
        config.scoring.fail_threshold = fail;
        config.validate()?;
    }
    config.print_summary();

    let library = ReferenceLibrary::load_json(args.reference.as_slice(), config.evaluator.min_keypoint_confidence)
        .context("加载参考动作失败")?;
    if library.is_empty() {
        warn!("参考动作库为空, 所有人都将无法匹配");
    }
    info!(profiles = library.len(), sessions = args.input.len(), "开始评分");

    let config = Arc::new(config);
    let library = Arc::new(library);
    let mode = SessionMode::from(args.mode);

    // 每个输入一个工作线程, 结果经 channel 汇总
    let (tx, rx) = unbounded::<Result<SessionReport>>();
    std::thread::scope(|scope| {
        for (path, session_id) in args.input.iter().zip(session_ids(&args.input)) {
            let tx = tx.clone();
            let config = config.clone();
            let library = library.clone();
            scope.spawn(move || {
                let report = score_file(path, session_id, mode, config, library);
                // 接收端在所有线程结束后才读取, 发送不会失败
                let _ = tx.send(report);
            });
        }
    });
    drop(tx);

    let mut reports = Vec::new();
    for report in rx.iter() {
        reports.push(report?);
    }
    reports.sort_by(|a, b| a.session_id.cmp(&b.session_id));

    for report in &reports {
        for (person, summary) in &report.summary.persons {
            info!(
                session = %report.session_id,
                person,
                score = summary.score,
                stopped = summary.stopped,
                errors = summary.error_count,
                "评分结果"
            );
        }
    }

    let json = serde_json::to_string_pretty(&reports).context("序列化报告失败")?;
    match &args.output {
        Some(output) => {
            fs::write(output, json).with_context(|| format!("写入报告失败: {}", output.display()))?;
            info!(path = %output.display(), "报告已保存");
        }
        None => println!("{}", json),
    }
    Ok(())
}

/// 每个输入文件的会话 ID
///
/// 取文件名主干; 不同目录下同名的输入追加序号, 保证报告中的 ID 唯一
fn session_ids(paths: &[PathBuf]) -> Vec<String> {
    let stems: Vec<String> = paths
        .iter()
        .map(|path| {
            path.file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string())
        })
        .collect();

    let mut counts: HashMap<&str, usize> = HashMap::new();
    for stem in &stems {
        *counts.entry(stem.as_str()).or_default() += 1;
    }

    let mut taken: HashSet<String> = HashSet::new();
    stems
        .iter()
        .enumerate()
        .map(|(index, stem)| {
            let mut id = if counts[stem.as_str()] > 1 {
                format!("{}-{}", stem, index)
            } else {
                stem.clone()
            };
            // 追加序号后仍可能与其它输入的主干相同
            while !taken.insert(id.clone()) {
                id.push('_');
            }
            id
        })
        .collect()
}

/// 逐帧处理一个输入文件
fn score_file(
    path: &Path,
    session_id: String,
    mode: SessionMode,
    config: Arc<PipelineConfig>,
    library: Arc<ReferenceLibrary>,
) -> Result<SessionReport> {
    let file = File::open(path).with_context(|| format!("打开输入失败: {}", path.display()))?;

    let mut session = Session::new(session_id.clone(), mode, config, library, None);
    let mut degraded_frames = 0usize;

    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("读取失败: {}:{}", path.display(), line_no + 1))?;
        if line.trim().is_empty() {
            continue;
        }
        let record: FrameRecord = serde_json::from_str(&line)
            .with_context(|| format!("解析失败: {}:{}", path.display(), line_no + 1))?;

        let result = match session.process_frame(&record.detections, record.timestamp, record.frame_index) {
            Ok(result) => result,
            Err(e) => bail!("{}:{}: {}", path.display(), line_no + 1, e),
        };
        if !result.degraded.is_empty() {
            degraded_frames += 1;
        }
    }

    let errors = session.finalize();
    let summary = session.summary();
    info!(
        session = %session_id,
        frames = summary.frames_processed,
        degraded_frames,
        persons = summary.persons.len(),
        "会话处理完成"
    );

    Ok(SessionReport {
        session_id,
        summary,
        errors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_ids_are_unique() {
        let paths: Vec<PathBuf> = ["day1/squad.jsonl", "day2/squad.jsonl", "solo.jsonl", "squad-1.jsonl"]
            .iter()
            .map(PathBuf::from)
            .collect();
        let ids = session_ids(&paths);
        assert_eq!(ids, vec!["squad-0", "squad-1", "solo", "squad-1_"]);
    }

    #[test]
    fn test_session_ids_keep_plain_stems() {
        let paths = vec![PathBuf::from("a/first.jsonl"), PathBuf::from("b/second.jsonl")];
        assert_eq!(session_ids(&paths), vec!["first", "second"]);
    }
}
