//! No-U-Turn sampler with multinomial trajectory sampling and warm-up adaptation.
//!
//! Trajectories grow by doubling in a random direction until the generalized
//! U-turn criterion fails across any merged subtree, a transition diverges
//! (energy error above [`MAX_DELTA_ENERGY`]) or the maximum depth is reached.
//! Warm-up tunes the step size by dual averaging and a diagonal inverse mass
//! matrix over doubling windows; warm-up draws are discarded.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use super::{chain_seed, InferenceConfig, LogDensity};

/// Energy error beyond which a transition counts as divergent.
pub const MAX_DELTA_ENERGY: f64 = 1000.0;

const INIT_BUFFER: usize = 75;
const TERM_BUFFER: usize = 50;
const BASE_WINDOW: usize = 25;

/// Per-draw sampler statistics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SampleStats {
    pub accept_stat: f64,
    pub step_size: f64,
    pub tree_depth: usize,
    pub n_leapfrog: usize,
    pub divergent: bool,
    pub energy: f64,
    pub lp: f64,
}

/// Retained draws of one chain.
#[derive(Debug, Clone)]
pub struct ChainDraws {
    pub chain: usize,
    pub draws: Vec<Vec<f64>>,
    pub stats: Vec<SampleStats>,
    pub step_size: f64,
    pub inverse_metric: Vec<f64>,
}

impl ChainDraws {
    pub fn divergences(&self) -> usize {
        self.stats.iter().filter(|s| s.divergent).count()
    }

    pub fn mean_accept_stat(&self) -> f64 {
        if self.stats.is_empty() {
            return 0.0;
        }
        self.stats.iter().map(|s| s.accept_stat).sum::<f64>() / self.stats.len() as f64
    }
}

// ---------------------------------------------------------------------
//  Hamiltonian system
// ---------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Point {
    q: Vec<f64>,
    p: Vec<f64>,
    grad: Vec<f64>,
    logp: f64,
}

struct Hamiltonian<'a, M> {
    model: &'a M,
    inv_metric: &'a [f64],
}

impl<M: LogDensity> Hamiltonian<'_, M> {
    fn point(&self, q: Vec<f64>) -> Point {
        let mut grad = vec![0.0; q.len()];
        let logp = self.model.log_density_and_gradient(&q, &mut grad);
        Point {
            p: vec![0.0; q.len()],
            q,
            grad,
            logp,
        }
    }

    fn kinetic(&self, p: &[f64]) -> f64 {
        0.5 * p
            .iter()
            .zip(self.inv_metric)
            .map(|(p, m)| p * p * m)
            .sum::<f64>()
    }

    fn energy(&self, z: &Point) -> f64 {
        let h = -z.logp + self.kinetic(&z.p);
        if h.is_nan() {
            f64::INFINITY
        } else {
            h
        }
    }

    /// `dH/dp`, the velocity used by the U-turn criterion.
    fn sharp(&self, p: &[f64]) -> Vec<f64> {
        p.iter().zip(self.inv_metric).map(|(p, m)| p * m).collect()
    }

    fn sample_momentum<R: Rng>(&self, z: &mut Point, rng: &mut R) {
        for (p, m) in z.p.iter_mut().zip(self.inv_metric) {
            let n: f64 = rng.sample(StandardNormal);
            *p = n / m.sqrt();
        }
    }

    fn leapfrog(&self, z: &mut Point, epsilon: f64) {
        for (p, g) in z.p.iter_mut().zip(&z.grad) {
            *p += 0.5 * epsilon * g;
        }
        for ((q, p), m) in z.q.iter_mut().zip(&z.p).zip(self.inv_metric) {
            *q += epsilon * m * p;
        }
        z.logp = self.model.log_density_and_gradient(&z.q, &mut z.grad);
        for (p, g) in z.p.iter_mut().zip(&z.grad) {
            *p += 0.5 * epsilon * g;
        }
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn add(a: &[f64], b: &[f64]) -> Vec<f64> {
    a.iter().zip(b).map(|(x, y)| x + y).collect()
}

fn log_sum_exp(a: f64, b: f64) -> f64 {
    if a == f64::NEG_INFINITY {
        return b;
    }
    if b == f64::NEG_INFINITY {
        return a;
    }
    let m = a.max(b);
    m + ((a - m).exp() + (b - m).exp()).ln()
}

fn no_u_turn(p_sharp_minus: &[f64], p_sharp_plus: &[f64], rho: &[f64]) -> bool {
    dot(p_sharp_plus, rho) > 0.0 && dot(p_sharp_minus, rho) > 0.0
}

// ---------------------------------------------------------------------
//  Trajectory
// ---------------------------------------------------------------------

/// A completed subtree: its two boundary momenta, summed momentum and proposal.
struct Subtree {
    p_beg: Vec<f64>,
    p_sharp_beg: Vec<f64>,
    p_end: Vec<f64>,
    p_sharp_end: Vec<f64>,
    rho: Vec<f64>,
    proposal: Point,
    log_sum_weight: f64,
}

struct Trajectory<'a, 'r, M, R> {
    system: &'a Hamiltonian<'a, M>,
    rng: &'r mut R,
    z: Point,
    epsilon: f64,
    h0: f64,
    n_leapfrog: usize,
    sum_metro_prob: f64,
    divergent: bool,
}

impl<M: LogDensity, R: Rng> Trajectory<'_, '_, M, R> {
    /// Grow `2^depth` leapfrog steps from the current point in `direction`.
    ///
    /// `None` means the subtree diverged or turned back on itself.
    fn build_tree(&mut self, depth: usize, direction: f64) -> Option<Subtree> {
        if depth == 0 {
            self.system.leapfrog(&mut self.z, direction * self.epsilon);
            self.n_leapfrog += 1;
            let h = self.system.energy(&self.z);
            let h = if h.is_nan() { f64::INFINITY } else { h };
            if h - self.h0 > MAX_DELTA_ENERGY {
                self.divergent = true;
            }
            let log_weight = self.h0 - h;
            self.sum_metro_prob += if log_weight > 0.0 { 1.0 } else { log_weight.exp() };
            if self.divergent {
                return None;
            }
            let p_sharp = self.system.sharp(&self.z.p);
            return Some(Subtree {
                p_beg: self.z.p.clone(),
                p_sharp_beg: p_sharp.clone(),
                p_end: self.z.p.clone(),
                p_sharp_end: p_sharp,
                rho: self.z.p.clone(),
                proposal: self.z.clone(),
                log_sum_weight: log_weight,
            });
        }

        let init = self.build_tree(depth - 1, direction)?;
        let last = self.build_tree(depth - 1, direction)?;

        let log_sum_weight = log_sum_exp(init.log_sum_weight, last.log_sum_weight);
        let accept = (last.log_sum_weight - log_sum_weight).exp();
        let take_last = self.rng.gen::<f64>() < accept;

        let rho = add(&init.rho, &last.rho);
        let persist = no_u_turn(&init.p_sharp_beg, &last.p_sharp_end, &rho)
            && no_u_turn(&init.p_sharp_beg, &last.p_sharp_beg, &add(&init.rho, &last.p_beg))
            && no_u_turn(&init.p_sharp_end, &last.p_sharp_end, &add(&last.rho, &init.p_end));
        if !persist {
            return None;
        }

        Some(Subtree {
            p_beg: init.p_beg,
            p_sharp_beg: init.p_sharp_beg,
            p_end: last.p_end,
            p_sharp_end: last.p_sharp_end,
            rho,
            proposal: if take_last { last.proposal } else { init.proposal },
            log_sum_weight,
        })
    }
}

struct Transition {
    point: Point,
    stats: SampleStats,
}

fn transition<M: LogDensity, R: Rng>(
    system: &Hamiltonian<'_, M>,
    start: &Point,
    epsilon: f64,
    max_depth: usize,
    rng: &mut R,
) -> Transition {
    let mut z = start.clone();
    system.sample_momentum(&mut z, rng);
    let h0 = system.energy(&z);

    let mut z_fwd = z.clone();
    let mut z_bck = z.clone();
    let mut sample = z.clone();

    let p_sharp = system.sharp(&z.p);
    let mut p_fwd_fwd = z.p.clone();
    let mut p_sharp_fwd_fwd = p_sharp.clone();
    let mut p_bck_bck = z.p.clone();
    let mut p_sharp_bck_bck = p_sharp;
    let mut rho = z.p.clone();
    let mut log_sum_weight = 0.0;

    let mut traj = Trajectory {
        system,
        rng,
        z,
        epsilon,
        h0,
        n_leapfrog: 0,
        sum_metro_prob: 0.0,
        divergent: false,
    };

    let mut depth = 0;
    while depth < max_depth {
        let forward = traj.rng.gen::<f64>() > 0.5;
        traj.z = if forward { z_fwd.clone() } else { z_bck.clone() };
        let subtree = traj.build_tree(depth, if forward { 1.0 } else { -1.0 });
        if forward {
            z_fwd = traj.z.clone();
        } else {
            z_bck = traj.z.clone();
        }
        let Some(sub) = subtree else {
            break;
        };
        depth += 1;

        if sub.log_sum_weight > log_sum_weight {
            sample = sub.proposal.clone();
        } else {
            let accept = (sub.log_sum_weight - log_sum_weight).exp();
            if traj.rng.gen::<f64>() < accept {
                sample = sub.proposal.clone();
            }
        }
        log_sum_weight = log_sum_exp(log_sum_weight, sub.log_sum_weight);

        // Orient the old trajectory and the new subtree backward-to-forward.
        let persist = if forward {
            let rho_bck = rho.clone();
            rho = add(&rho_bck, &sub.rho);
            let ok = no_u_turn(&p_sharp_bck_bck, &sub.p_sharp_end, &rho)
                && no_u_turn(&p_sharp_bck_bck, &sub.p_sharp_beg, &add(&rho_bck, &sub.p_beg))
                && no_u_turn(&p_sharp_fwd_fwd, &sub.p_sharp_end, &add(&sub.rho, &p_fwd_fwd));
            p_fwd_fwd = sub.p_end;
            p_sharp_fwd_fwd = sub.p_sharp_end;
            ok
        } else {
            let rho_fwd = rho.clone();
            rho = add(&sub.rho, &rho_fwd);
            let ok = no_u_turn(&sub.p_sharp_end, &p_sharp_fwd_fwd, &rho)
                && no_u_turn(&sub.p_sharp_end, &p_sharp_bck_bck, &add(&sub.rho, &p_bck_bck))
                && no_u_turn(&sub.p_sharp_beg, &p_sharp_fwd_fwd, &add(&rho_fwd, &sub.p_beg));
            p_bck_bck = sub.p_end;
            p_sharp_bck_bck = sub.p_sharp_end;
            ok
        };
        if !persist {
            break;
        }
    }

    let n_leapfrog = traj.n_leapfrog.max(1);
    let accept_stat = traj.sum_metro_prob / n_leapfrog as f64;
    let energy = system.energy(&sample);
    let lp = sample.logp;
    Transition {
        point: sample,
        stats: SampleStats {
            accept_stat,
            step_size: epsilon,
            tree_depth: depth,
            n_leapfrog: traj.n_leapfrog,
            divergent: traj.divergent,
            energy,
            lp,
        },
    }
}

// ---------------------------------------------------------------------
//  Adaptation
// ---------------------------------------------------------------------

/// Dual-averaging step size adaptation toward a target acceptance rate.
#[derive(Debug, Clone)]
struct StepSizeAdaptation {
    target: f64,
    gamma: f64,
    t0: f64,
    kappa: f64,
    mu: f64,
    counter: f64,
    s_bar: f64,
    x_bar: f64,
}

impl StepSizeAdaptation {
    fn new(target: f64) -> Self {
        Self {
            target,
            gamma: 0.05,
            t0: 10.0,
            kappa: 0.75,
            mu: 0.5f64.ln(),
            counter: 0.0,
            s_bar: 0.0,
            x_bar: 0.0,
        }
    }

    fn restart(&mut self, epsilon: f64) {
        self.mu = (10.0 * epsilon).ln();
        self.counter = 0.0;
        self.s_bar = 0.0;
        self.x_bar = 0.0;
    }

    fn learn(&mut self, accept_stat: f64) -> f64 {
        self.counter += 1.0;
        let accept_stat = accept_stat.min(1.0);
        let eta = 1.0 / (self.counter + self.t0);
        self.s_bar = (1.0 - eta) * self.s_bar + eta * (self.target - accept_stat);
        let x = self.mu - self.s_bar * self.counter.sqrt() / self.gamma;
        let x_eta = self.counter.powf(-self.kappa);
        self.x_bar = (1.0 - x_eta) * self.x_bar + x_eta * x;
        x.exp()
    }

    fn final_step_size(&self) -> f64 {
        self.x_bar.exp()
    }
}

/// Welford accumulator for the diagonal of the posterior covariance.
#[derive(Debug, Clone)]
struct VarianceEstimator {
    n: usize,
    mean: Vec<f64>,
    m2: Vec<f64>,
}

impl VarianceEstimator {
    fn new(dim: usize) -> Self {
        Self {
            n: 0,
            mean: vec![0.0; dim],
            m2: vec![0.0; dim],
        }
    }

    fn add(&mut self, q: &[f64]) {
        self.n += 1;
        for i in 0..q.len() {
            let delta = q[i] - self.mean[i];
            self.mean[i] += delta / self.n as f64;
            self.m2[i] += delta * (q[i] - self.mean[i]);
        }
    }

    /// Sample variance shrunk toward a small constant.
    fn regularized(&self) -> Vec<f64> {
        let n = self.n as f64;
        self.m2
            .iter()
            .map(|m2| {
                let var = if self.n > 1 { m2 / (n - 1.0) } else { 1.0 };
                (n / (n + 5.0)) * var + 1e-3 * (5.0 / (n + 5.0))
            })
            .collect()
    }

    fn restart(&mut self) {
        *self = Self::new(self.mean.len());
    }
}

/// Warm-up schedule: a fast initial buffer, doubling slow windows that
/// update the metric, and a final fast buffer.
#[derive(Debug, Clone)]
struct WindowSchedule {
    num_warmup: usize,
    init_buffer: usize,
    term_buffer: usize,
    window_size: usize,
    next_window: usize,
    counter: usize,
    enabled: bool,
}

impl WindowSchedule {
    fn new(num_warmup: usize) -> Self {
        let (mut init_buffer, mut term_buffer, mut base_window) = (INIT_BUFFER, TERM_BUFFER, BASE_WINDOW);
        let enabled = num_warmup >= 20;
        if enabled && init_buffer + term_buffer + base_window > num_warmup {
            init_buffer = (0.15 * num_warmup as f64) as usize;
            term_buffer = (0.1 * num_warmup as f64) as usize;
            base_window = num_warmup - (init_buffer + term_buffer);
        }
        Self {
            num_warmup,
            init_buffer,
            term_buffer,
            window_size: base_window,
            next_window: init_buffer + base_window - 1,
            counter: 0,
            enabled,
        }
    }

    fn in_window(&self) -> bool {
        self.enabled
            && self.counter >= self.init_buffer
            && self.counter < self.num_warmup - self.term_buffer
            && self.counter != self.num_warmup
    }

    fn window_ends(&self) -> bool {
        self.enabled && self.counter == self.next_window && self.counter != self.num_warmup
    }

    fn advance_window(&mut self) {
        let last = self.num_warmup - self.term_buffer - 1;
        if self.next_window == last {
            return;
        }
        self.window_size *= 2;
        self.next_window = self.counter + self.window_size;
        if self.next_window != last {
            let boundary = self.next_window + 2 * self.window_size;
            if boundary >= self.num_warmup - self.term_buffer {
                self.next_window = last;
            }
        }
    }
}

/// Double or halve `epsilon` until one leapfrog step crosses an acceptance of 0.8.
fn init_step_size<M: LogDensity, R: Rng>(
    system: &Hamiltonian<'_, M>,
    start: &Point,
    mut epsilon: f64,
    rng: &mut R,
) -> f64 {
    let threshold = 0.8f64.ln();
    let probe = |epsilon: f64, rng: &mut R| {
        let mut z = start.clone();
        system.sample_momentum(&mut z, rng);
        let h0 = system.energy(&z);
        system.leapfrog(&mut z, epsilon);
        h0 - system.energy(&z)
    };

    let direction = if probe(epsilon, &mut *rng) > threshold { 1 } else { -1 };
    for _ in 0..100 {
        let delta_h = probe(epsilon, &mut *rng);
        if direction == 1 && delta_h <= threshold {
            break;
        }
        if direction == -1 && delta_h >= threshold {
            break;
        }
        epsilon = if direction == 1 { 2.0 * epsilon } else { 0.5 * epsilon };
        if !(1e-10..=1e7).contains(&epsilon) {
            break;
        }
    }
    epsilon.clamp(1e-10, 1e7)
}

// ---------------------------------------------------------------------
//  Chain driver
// ---------------------------------------------------------------------

/// Run one chain: jittered start, `tune` adapting iterations, `draws` kept.
pub fn run_chain<M: LogDensity>(model: &M, config: &InferenceConfig, chain: usize) -> ChainDraws {
    let mut rng = StdRng::seed_from_u64(chain_seed(config.seed, chain));
    let dim = model.dim();
    let mut inv_metric = vec![1.0; dim];

    let start: Vec<f64> = (0..dim)
        .map(|_| {
            if config.init_jitter > 0.0 {
                rng.gen_range(-config.init_jitter..config.init_jitter)
            } else {
                0.0
            }
        })
        .collect();

    let mut current = Hamiltonian {
        model,
        inv_metric: &inv_metric,
    }
    .point(start);
    if !current.logp.is_finite() {
        tracing::warn!(chain, logp = current.logp, "non-finite log density at start point");
    }

    let mut epsilon = init_step_size(
        &Hamiltonian {
            model,
            inv_metric: &inv_metric,
        },
        &current,
        1.0,
        &mut rng,
    );
    let mut step = StepSizeAdaptation::new(config.target_accept);
    step.restart(epsilon);
    let mut schedule = WindowSchedule::new(config.tune);
    let mut estimator = VarianceEstimator::new(dim);
    let mut warmup_divergences = 0usize;

    for _ in 0..config.tune {
        let t = transition(
            &Hamiltonian {
                model,
                inv_metric: &inv_metric,
            },
            &current,
            epsilon,
            config.max_tree_depth,
            &mut rng,
        );
        current = t.point;
        warmup_divergences += usize::from(t.stats.divergent);
        epsilon = step.learn(t.stats.accept_stat);

        if schedule.in_window() {
            estimator.add(&current.q);
        }
        if schedule.window_ends() {
            schedule.advance_window();
            inv_metric = estimator.regularized();
            estimator.restart();
            let system = Hamiltonian {
                model,
                inv_metric: &inv_metric,
            };
            epsilon = init_step_size(&system, &current, epsilon, &mut rng);
            step.restart(epsilon);
            tracing::debug!(chain, step_size = epsilon, "updated diagonal metric");
        }
        schedule.counter += 1;
    }
    if config.tune > 0 {
        epsilon = step.final_step_size();
    }
    if warmup_divergences > 0 {
        tracing::debug!(chain, warmup_divergences, "divergences during warm-up");
    }

    let system = Hamiltonian {
        model,
        inv_metric: &inv_metric,
    };
    let mut draws = Vec::with_capacity(config.draws);
    let mut stats = Vec::with_capacity(config.draws);
    for _ in 0..config.draws {
        let t = transition(&system, &current, epsilon, config.max_tree_depth, &mut rng);
        current = t.point;
        draws.push(current.q.clone());
        stats.push(t.stats);
    }

    ChainDraws {
        chain,
        draws,
        stats,
        step_size: epsilon,
        inverse_metric: inv_metric.clone(),
    }
}
