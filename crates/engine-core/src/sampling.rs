//! Token sampling
//!
//! Turns one step of raw logits into a token id:
//! - Repetition penalty over a recent-token window
//! - Temperature scaling (`0` means greedy)
//! - Top-k filtering (`0` disables)
//! - Top-p nucleus filtering (`>= 1` disables)
//! - Seeded RNG so a fixed seed replays the same choices
//!
//! Runtimes keep one [`Sampler`] per native handle so the RNG stream carries
//! across token steps instead of restarting at every call.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;

/// Number of most recent tokens the repetition penalty looks at
pub const PENALTY_WINDOW: usize = 64;

/// Sampling parameters for a single token step
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub repeat_penalty: f32,
    pub seed: u64,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.95,
            top_k: 40,
            repeat_penalty: 1.1,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SamplingError {
    #[error("logits array is empty")]
    InvalidLogits,
    #[error("no valid tokens after filtering")]
    NoValidTokens,
}

/// Deterministic xorshift64 generator.
///
/// The seed goes through splitmix64 first so nearby seeds (0, 1, 2...) start
/// from unrelated states and seed 0 is usable.
#[derive(Debug, Clone)]
pub struct SeededRng {
    state: u64,
}

impl SeededRng {
    pub fn new(seed: u64) -> Self {
        let state = splitmix64(seed);
        Self {
            state: if state == 0 { 0x9E37_79B9_7F4A_7C15 } else { state },
        }
    }

    /// Next float in [0, 1)
    pub fn next_f32(&mut self) -> f32 {
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        (self.state >> 40) as f32 / (1u64 << 24) as f32
    }
}

fn splitmix64(seed: u64) -> u64 {
    let mut z = seed.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Stateful sampler. Owns the RNG stream for one session.
#[derive(Debug, Clone)]
pub struct Sampler {
    params: SamplingParams,
    rng: SeededRng,
}

impl Sampler {
    pub fn new(params: SamplingParams) -> Self {
        Self {
            rng: SeededRng::new(params.seed),
            params,
        }
    }

    pub fn params(&self) -> &SamplingParams {
        &self.params
    }

    /// Adopt new parameters. The RNG is re-seeded only when the seed changes,
    /// so a caller repeating the same request keeps one continuous stream.
    pub fn configure(&mut self, params: &SamplingParams) {
        if params.seed != self.params.seed {
            self.rng = SeededRng::new(params.seed);
        }
        self.params = *params;
    }

    /// Restart the RNG stream from the current seed
    pub fn reset(&mut self) {
        self.rng = SeededRng::new(self.params.seed);
    }

    /// Pick a token id from `logits`. `history` holds recently seen token ids,
    /// oldest first; only the last [`PENALTY_WINDOW`] entries are penalized.
    pub fn sample(&mut self, logits: &[f32], history: &[usize]) -> Result<usize, SamplingError> {
        if logits.is_empty() {
            return Err(SamplingError::InvalidLogits);
        }

        let mut work: Vec<f32> = logits
            .iter()
            .map(|&l| if l.is_nan() { f32::NEG_INFINITY } else { l })
            .collect();

        self.apply_repetition_penalty(&mut work, history);

        if self.params.temperature <= 0.0 {
            return Self::argmax(&work).ok_or(SamplingError::NoValidTokens);
        }

        if (self.params.temperature - 1.0).abs() > f32::EPSILON {
            for logit in &mut work {
                *logit /= self.params.temperature;
            }
        }

        if self.params.top_k > 0 {
            Self::apply_top_k(&mut work, self.params.top_k as usize);
        }

        let probs = Self::softmax(&work).ok_or(SamplingError::NoValidTokens)?;

        let probs = if self.params.top_p < 1.0 {
            Self::apply_top_p(&probs, self.params.top_p.max(0.0))
        } else {
            probs
        };

        self.sample_from_distribution(&probs)
    }

    fn apply_repetition_penalty(&self, logits: &mut [f32], history: &[usize]) {
        let penalty = self.params.repeat_penalty;
        if penalty <= 0.0 || (penalty - 1.0).abs() <= f32::EPSILON {
            return;
        }

        let start = history.len().saturating_sub(PENALTY_WINDOW);
        let recent: HashSet<usize> = history[start..].iter().copied().collect();

        // Divide positive logits and multiply negative ones so a repeated
        // token always becomes less likely.
        for token_id in recent {
            if let Some(logit) = logits.get_mut(token_id) {
                if *logit > 0.0 {
                    *logit /= penalty;
                } else {
                    *logit *= penalty;
                }
            }
        }
    }

    fn apply_top_k(logits: &mut [f32], k: usize) {
        if k >= logits.len() {
            return;
        }

        let mut sorted = logits.to_vec();
        sorted.sort_by(|a, b| b.partial_cmp(a).unwrap_or(Ordering::Equal));

        let threshold = sorted[k - 1];
        for logit in logits.iter_mut() {
            if *logit < threshold {
                *logit = f32::NEG_INFINITY;
            }
        }
    }

    fn apply_top_p(probs: &[f32], p: f32) -> Vec<f32> {
        let mut indexed: Vec<(usize, f32)> = probs.iter().copied().enumerate().collect();
        indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));

        let mut cumsum = 0.0;
        let mut cutoff_idx = 0;
        for (idx, (_, prob)) in indexed.iter().enumerate() {
            cumsum += prob;
            cutoff_idx = idx;
            if cumsum >= p {
                break;
            }
        }

        let cutoff_prob = indexed[cutoff_idx].1;
        let mut result: Vec<f32> = probs
            .iter()
            .map(|&pr| if pr >= cutoff_prob { pr } else { 0.0 })
            .collect();

        let sum: f32 = result.iter().sum();
        if sum > 0.0 {
            for pr in &mut result {
                *pr /= sum;
            }
        }

        result
    }

    /// `None` when every logit is negative infinity
    fn softmax(logits: &[f32]) -> Option<Vec<f32>> {
        let max_logit = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        if max_logit == f32::NEG_INFINITY {
            return None;
        }

        let exps: Vec<f32> = logits.iter().map(|&l| (l - max_logit).exp()).collect();
        let sum: f32 = exps.iter().sum();
        Some(exps.iter().map(|&e| e / sum).collect())
    }

    fn argmax(values: &[f32]) -> Option<usize> {
        values
            .iter()
            .enumerate()
            .filter(|(_, v)| **v > f32::NEG_INFINITY)
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(Ordering::Equal))
            .map(|(idx, _)| idx)
    }

    fn sample_from_distribution(&mut self, probs: &[f32]) -> Result<usize, SamplingError> {
        let r = self.rng.next_f32();
        let mut cumsum = 0.0;

        for (i, &prob) in probs.iter().enumerate() {
            cumsum += prob;
            if r < cumsum {
                return Ok(i);
            }
        }

        // Rounding left r above the final cumulative sum
        probs
            .iter()
            .rposition(|&prob| prob > 0.0)
            .ok_or(SamplingError::NoValidTokens)
    }
}
