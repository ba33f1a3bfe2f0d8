//! 二分图最优匹配 (匈牙利算法)
//! Optimal bipartite assignment for track/detection association

/// 超过门限的代价统一替换为此值, 避免最优解为了整体代价牺牲有效匹配
const GATED_COST: f64 = 1e6;

/// 匹配结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Assignment {
    /// (行索引, 列索引)
    pub matches: Vec<(usize, usize)>,
    pub unmatched_rows: Vec<usize>,
    pub unmatched_cols: Vec<usize>,
}

/// 匈牙利算法 (Kuhn-Munkres, 势函数 + 最短增广路, O(n³))
///
/// 非方阵时补齐为方阵, 返回 `min(rows, cols)` 对匹配
pub fn hungarian(cost: &[Vec<f64>]) -> Vec<(usize, usize)> {
    let n_rows = cost.len();
    if n_rows == 0 {
        return Vec::new();
    }
    let n_cols = cost[0].len();
    if n_cols == 0 {
        return Vec::new();
    }

    let n = n_rows.max(n_cols);
    let inf = f64::MAX / 4.0;

    // 补齐的行列代价为0 (虚拟节点)
    let mut c = vec![vec![0.0_f64; n]; n];
    for i in 0..n_rows {
        for j in 0..n_cols {
            let v = cost[i].get(j).copied().unwrap_or(GATED_COST);
            c[i][j] = if v.is_finite() { v } else { GATED_COST };
        }
    }

    // u/v: 行/列势, p[j]: 列j匹配的行(1起始, 0为未匹配), way: 增广路前驱
    let mut u = vec![0.0_f64; n + 1];
    let mut v = vec![0.0_f64; n + 1];
    let mut p = vec![0_usize; n + 1];
    let mut way = vec![0_usize; n + 1];

    for i in 1..=n {
        p[0] = i;
        let mut j0 = 0_usize;
        let mut min_val = vec![inf; n + 1];
        let mut used = vec![false; n + 1];

        loop {
            used[j0] = true;
            let i0 = p[j0];
            let mut delta = inf;
            let mut j1 = 0_usize;

            for j in 1..=n {
                if !used[j] {
                    let cur = c[i0 - 1][j - 1] - u[i0] - v[j];
                    if cur < min_val[j] {
                        min_val[j] = cur;
                        way[j] = j0;
                    }
                    if min_val[j] < delta {
                        delta = min_val[j];
                        j1 = j;
                    }
                }
            }

            for j in 0..=n {
                if used[j] {
                    u[p[j]] += delta;
                    v[j] -= delta;
                } else {
                    min_val[j] -= delta;
                }
            }

            j0 = j1;
            if p[j0] == 0 {
                break;
            }
        }

        // 沿增广路回溯
        loop {
            let j1 = way[j0];
            p[j0] = p[j1];
            j0 = j1;
            if j0 == 0 {
                break;
            }
        }
    }

    let mut result = Vec::with_capacity(n_rows.min(n_cols));
    for j in 1..=n {
        let i = p[j];
        if i >= 1 && i <= n_rows && j <= n_cols {
            result.push((i - 1, j - 1));
        }
    }
    result.sort_unstable();
    result
}

/// 带门限的线性分配: 代价 >= `max_cost` 的匹配被拒绝
pub fn linear_assignment(cost: &[Vec<f64>], n_cols: usize, max_cost: f64) -> Assignment {
    let n_rows = cost.len();
    if n_rows == 0 || n_cols == 0 {
        return Assignment {
            matches: Vec::new(),
            unmatched_rows: (0..n_rows).collect(),
            unmatched_cols: (0..n_cols).collect(),
        };
    }

    let gated: Vec<Vec<f64>> = cost
        .iter()
        .map(|row| {
            row.iter()
                .map(|&c| if c.is_finite() && c < max_cost { c } else { GATED_COST })
                .collect()
        })
        .collect();

    let mut row_used = vec![false; n_rows];
    let mut col_used = vec![false; n_cols];
    let mut matches = Vec::new();

    for (r, c) in hungarian(&gated) {
        if gated[r][c] < max_cost {
            row_used[r] = true;
            col_used[c] = true;
            matches.push((r, c));
        }
    }

    Assignment {
        matches,
        unmatched_rows: (0..n_rows).filter(|&r| !row_used[r]).collect(),
        unmatched_cols: (0..n_cols).filter(|&c| !col_used[c]).collect(),
    }
}
