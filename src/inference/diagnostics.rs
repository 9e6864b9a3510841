//! Convergence diagnostics and marginal summaries.
//!
//! R-hat and bulk ESS are computed on rank-normalized split chains: each chain
//! is cut in half, all draws are pooled and ranked, and ranks are mapped to
//! normal quantiles before the classic between/within variance comparison.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};

use crate::archive::DrawSet;

pub const RHAT_THRESHOLD: f64 = 1.01;
pub const MIN_ESS_PER_CHAIN: f64 = 100.0;
pub const HDI_PROB: f64 = 0.94;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableSummary {
    pub variable: String,
    /// Element label, e.g. `gamma[CH, attr_costs_taxpayer]`.
    pub label: String,
    pub mean: f64,
    pub sd: f64,
    pub hdi_low: f64,
    pub hdi_high: f64,
    pub r_hat: Option<f64>,
    pub ess_bulk: Option<f64>,
}

/// Non-fatal sampling caveats recorded alongside the draws.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceReport {
    pub max_r_hat: Option<f64>,
    pub min_ess_bulk: Option<f64>,
    pub divergences: usize,
    pub flagged: bool,
    pub caveats: Vec<String>,
}

impl ConvergenceReport {
    pub fn from_summaries(summaries: &[VariableSummary], divergences: usize, chains: usize) -> Self {
        let max_r_hat = summaries
            .iter()
            .filter_map(|s| s.r_hat)
            .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.max(v))));
        let min_ess_bulk = summaries
            .iter()
            .filter_map(|s| s.ess_bulk)
            .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.min(v))));

        let mut caveats = Vec::new();
        let high_rhat: Vec<&str> = summaries
            .iter()
            .filter(|s| s.r_hat.is_some_and(|r| r > RHAT_THRESHOLD))
            .map(|s| s.label.as_str())
            .collect();
        if !high_rhat.is_empty() {
            caveats.push(format!(
                "{} elements with r_hat > {RHAT_THRESHOLD}: {}",
                high_rhat.len(),
                preview(&high_rhat)
            ));
        }
        let ess_floor = MIN_ESS_PER_CHAIN * chains as f64;
        let low_ess: Vec<&str> = summaries
            .iter()
            .filter(|s| s.ess_bulk.is_some_and(|e| e < ess_floor))
            .map(|s| s.label.as_str())
            .collect();
        if !low_ess.is_empty() {
            caveats.push(format!(
                "{} elements with bulk ESS < {ess_floor}: {}",
                low_ess.len(),
                preview(&low_ess)
            ));
        }
        if divergences > 0 {
            caveats.push(format!("{divergences} divergent transitions after tuning"));
        }

        for caveat in &caveats {
            tracing::warn!(%caveat, "convergence caveat");
        }
        Self {
            max_r_hat,
            min_ess_bulk,
            divergences,
            flagged: !caveats.is_empty(),
            caveats,
        }
    }
}

fn preview(labels: &[&str]) -> String {
    let mut s = labels.iter().take(5).copied().collect::<Vec<_>>().join(", ");
    if labels.len() > 5 {
        s.push_str(", ...");
    }
    s
}

// ---------------------------------------------------------------------
//  Summaries
// ---------------------------------------------------------------------

/// Label of element `element` of a variable with `dims` and `shape`.
pub fn element_label(
    name: &str,
    dims: &[String],
    shape: &[usize],
    element: usize,
    coords: &BTreeMap<String, Vec<String>>,
) -> String {
    if shape.is_empty() {
        return name.to_string();
    }
    let mut index = vec![0; shape.len()];
    let mut rest = element;
    for axis in (0..shape.len()).rev() {
        index[axis] = rest % shape[axis].max(1);
        rest /= shape[axis].max(1);
    }
    let parts: Vec<String> = index
        .iter()
        .enumerate()
        .map(|(axis, &i)| {
            dims.get(axis)
                .and_then(|d| coords.get(d))
                .and_then(|labels| labels.get(i))
                .cloned()
                .unwrap_or_else(|| i.to_string())
        })
        .collect();
    format!("{name}[{}]", parts.join(", "))
}

/// Per-element summaries of the named variables; unknown names are skipped.
pub fn summarize(
    set: &DrawSet,
    variables: &[&str],
    coords: &BTreeMap<String, Vec<String>>,
) -> Vec<VariableSummary> {
    let mut out = Vec::new();
    for &name in variables {
        let Some(var) = set.get(name) else {
            continue;
        };
        for element in 0..var.element_count() {
            let Some(series) = set.chain_series(name, element) else {
                continue;
            };
            let pooled: Vec<f64> = series.iter().flatten().copied().collect();
            let (mean, sd) = mean_sd(&pooled);
            let (hdi_low, hdi_high) = hdi(&pooled, HDI_PROB);
            out.push(VariableSummary {
                variable: name.to_string(),
                label: element_label(name, &var.dims, &var.shape, element, coords),
                mean,
                sd,
                hdi_low,
                hdi_high,
                r_hat: split_rhat(&series),
                ess_bulk: ess_bulk(&series),
            });
        }
    }
    out
}

fn mean_sd(values: &[f64]) -> (f64, f64) {
    let n = values.len();
    if n == 0 {
        return (f64::NAN, f64::NAN);
    }
    let mean = values.iter().sum::<f64>() / n as f64;
    if n == 1 {
        return (mean, 0.0);
    }
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
    (mean, var.sqrt())
}

/// Narrowest interval holding `prob` of the draws.
pub fn hdi(values: &[f64], prob: f64) -> (f64, f64) {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return (f64::NAN, f64::NAN);
    }
    sorted.sort_by(f64::total_cmp);
    let n = sorted.len();
    let included = ((prob * n as f64).floor() as usize).min(n - 1);
    let mut best = (sorted[0], sorted[included]);
    for i in 0..n - included {
        let (lo, hi) = (sorted[i], sorted[i + included]);
        if hi - lo < best.1 - best.0 {
            best = (lo, hi);
        }
    }
    best
}

// ---------------------------------------------------------------------
//  R-hat and ESS
// ---------------------------------------------------------------------

fn split_chains(chains: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let mut out = Vec::with_capacity(chains.len() * 2);
    for c in chains {
        let half = c.len() / 2;
        out.push(c[..half].to_vec());
        out.push(c[c.len() - half..].to_vec());
    }
    out
}

/// Average ranks (1-based, ties share their mean rank) mapped to normal scores.
fn rank_normalize(chains: &[Vec<f64>]) -> Option<Vec<Vec<f64>>> {
    let normal = Normal::new(0.0, 1.0).ok()?;
    let mut pooled: Vec<(f64, usize)> = chains
        .iter()
        .flatten()
        .copied()
        .enumerate()
        .map(|(i, v)| (v, i))
        .collect();
    let size = pooled.len();
    pooled.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut ranks = vec![0.0; size];
    let mut i = 0;
    while i < size {
        let mut j = i;
        while j + 1 < size && pooled[j + 1].0 == pooled[i].0 {
            j += 1;
        }
        let avg = (i + j) as f64 / 2.0 + 1.0;
        for item in &pooled[i..=j] {
            ranks[item.1] = avg;
        }
        i = j + 1;
    }

    let mut z = ranks
        .into_iter()
        .map(|r| normal.inverse_cdf((r - 0.375) / (size as f64 + 0.25)));
    Some(
        chains
            .iter()
            .map(|c| (0..c.len()).filter_map(|_| z.next()).collect())
            .collect(),
    )
}

fn classic_rhat(chains: &[Vec<f64>]) -> Option<f64> {
    let m = chains.len();
    let n = chains.first()?.len();
    if m < 2 || n < 2 {
        return None;
    }
    let means: Vec<f64> = chains.iter().map(|c| c.iter().sum::<f64>() / n as f64).collect();
    let grand = means.iter().sum::<f64>() / m as f64;
    let b = n as f64 * means.iter().map(|x| (x - grand).powi(2)).sum::<f64>() / (m - 1) as f64;
    let w = chains
        .iter()
        .zip(&means)
        .map(|(c, mu)| c.iter().map(|x| (x - mu).powi(2)).sum::<f64>() / (n - 1) as f64)
        .sum::<f64>()
        / m as f64;
    if w <= 0.0 || !w.is_finite() {
        return None;
    }
    let var_hat = (n as f64 - 1.0) / n as f64 * w + b / n as f64;
    Some((var_hat / w).sqrt())
}

/// Rank-normalized split R-hat: the larger of the bulk and folded-tail values.
pub fn split_rhat(chains: &[Vec<f64>]) -> Option<f64> {
    let split = split_chains(chains);
    if split.first().map_or(true, |c| c.len() < 2) {
        return None;
    }
    let bulk = classic_rhat(&rank_normalize(&split)?)?;

    let mut pooled: Vec<f64> = split.iter().flatten().copied().collect();
    pooled.sort_by(f64::total_cmp);
    let mid = pooled.len() / 2;
    let median = if pooled.len() % 2 == 0 {
        (pooled[mid - 1] + pooled[mid]) / 2.0
    } else {
        pooled[mid]
    };
    let folded: Vec<Vec<f64>> = split
        .iter()
        .map(|c| c.iter().map(|x| (x - median).abs()).collect())
        .collect();
    let tail = classic_rhat(&rank_normalize(&folded)?)?;
    Some(bulk.max(tail))
}

/// Bulk effective sample size with Geyer's initial monotone sequence.
pub fn ess_bulk(chains: &[Vec<f64>]) -> Option<f64> {
    let split = rank_normalize(&split_chains(chains))?;
    ess(&split)
}

fn autocov(chain: &[f64], mean: f64, lag: usize) -> f64 {
    let n = chain.len();
    (0..n - lag)
        .map(|i| (chain[i] - mean) * (chain[i + lag] - mean))
        .sum::<f64>()
        / n as f64
}

fn ess(chains: &[Vec<f64>]) -> Option<f64> {
    let m = chains.len();
    let n = chains.first()?.len();
    if m == 0 || n < 4 {
        return None;
    }
    let means: Vec<f64> = chains.iter().map(|c| c.iter().sum::<f64>() / n as f64).collect();
    let mean_acov = |lag: usize| -> f64 {
        chains
            .iter()
            .zip(&means)
            .map(|(c, mu)| autocov(c, *mu, lag))
            .sum::<f64>()
            / m as f64
    };

    let mean_var = mean_acov(0) * n as f64 / (n as f64 - 1.0);
    let mut var_plus = mean_var * (n as f64 - 1.0) / n as f64;
    if m > 1 {
        let grand = means.iter().sum::<f64>() / m as f64;
        var_plus += means.iter().map(|x| (x - grand).powi(2)).sum::<f64>() / (m - 1) as f64;
    }
    if var_plus <= 0.0 || !var_plus.is_finite() {
        return None;
    }

    let mut rho = vec![0.0; n];
    rho[0] = 1.0;
    let mut even = 1.0;
    let mut odd = 1.0 - (mean_var - mean_acov(1)) / var_plus;
    rho[1] = odd;

    let mut t = 1usize;
    while t < n - 3 && even + odd > 0.0 {
        even = 1.0 - (mean_var - mean_acov(t + 1)) / var_plus;
        odd = 1.0 - (mean_var - mean_acov(t + 2)) / var_plus;
        if even + odd >= 0.0 {
            rho[t + 1] = even;
            rho[t + 2] = odd;
        }
        t += 2;
    }
    let max_t = t as isize - 2;
    if even > 0.0 {
        rho[(max_t + 1) as usize] = even;
    }

    let mut t = 1isize;
    while t <= max_t - 2 {
        let u = t as usize;
        if rho[u + 1] + rho[u + 2] > rho[u - 1] + rho[u] {
            rho[u + 1] = (rho[u - 1] + rho[u]) / 2.0;
            rho[u + 2] = rho[u + 1];
        }
        t += 2;
    }

    let total = (m * n) as f64;
    let head: f64 = rho[..(max_t + 1) as usize].iter().sum();
    let tau = (-1.0 + 2.0 * head + rho[(max_t + 1) as usize]).max(1.0 / total.log10());
    Some(total / tau)
}
