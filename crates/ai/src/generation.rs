//! Decoding strategies for autoregressive text decoders.

use anyhow::bail;

#[derive(Debug, Clone)]
pub struct GenerationParams {
    /// `1` means greedy decoding.
    pub num_beams: usize,
    /// Maximum length of the decoder sequence, prompt tokens included.
    pub max_length: usize,
    pub length_penalty: f32,
    /// Stop beam search as soon as `num_beams` hypotheses are finished.
    pub early_stopping: bool,
    pub seed: u64,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            num_beams: 5,
            max_length: 64,
            length_penalty: 1.0,
            early_stopping: true,
            seed: 1337,
        }
    }
}

impl GenerationParams {
    pub fn validate(&self, prefix_len: usize) -> anyhow::Result<()> {
        if self.num_beams == 0 {
            bail!("num_beams must be at least 1");
        }
        if prefix_len == 0 {
            bail!("decoder prefix must not be empty");
        }
        if self.max_length <= prefix_len {
            bail!(
                "max_length {} leaves no room after {} prompt tokens",
                self.max_length,
                prefix_len
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Beam {
    tokens: Vec<u32>,
    sum_logprobs: f32,
}

#[derive(Debug)]
struct Hypothesis {
    tokens: Vec<u32>,
    score: f32,
}

/// Finished hypotheses, bounded to the `num_beams` best.
struct Hypotheses {
    num_beams: usize,
    length_penalty: f32,
    early_stopping: bool,
    items: Vec<Hypothesis>,
}

impl Hypotheses {
    fn new(params: &GenerationParams) -> Self {
        Self {
            num_beams: params.num_beams,
            length_penalty: params.length_penalty,
            early_stopping: params.early_stopping,
            items: Vec::with_capacity(params.num_beams + 1),
        }
    }

    fn normalize(&self, sum_logprobs: f32, len: usize) -> f32 {
        sum_logprobs / (len as f32).powf(self.length_penalty)
    }

    fn worst_score(&self) -> f32 {
        self.items
            .iter()
            .map(|h| h.score)
            .fold(f32::INFINITY, f32::min)
    }

    fn add(&mut self, tokens: Vec<u32>, sum_logprobs: f32) {
        let score = self.normalize(sum_logprobs, tokens.len());
        if self.items.len() < self.num_beams || score > self.worst_score() {
            self.items.push(Hypothesis { tokens, score });
            if self.items.len() > self.num_beams {
                if let Some((worst, _)) = self
                    .items
                    .iter()
                    .enumerate()
                    .min_by(|(_, a), (_, b)| a.score.total_cmp(&b.score))
                {
                    self.items.swap_remove(worst);
                }
            }
        }
    }

    fn is_done(&self, best_sum_logprobs: f32, cur_len: usize) -> bool {
        if self.items.len() < self.num_beams {
            return false;
        }
        if self.early_stopping {
            return true;
        }
        self.worst_score() >= self.normalize(best_sum_logprobs, cur_len)
    }

    fn best(self) -> Option<Hypothesis> {
        self.items
            .into_iter()
            .max_by(|a, b| a.score.total_cmp(&b.score))
    }
}

/// Indices of the `k` largest values, highest first.
fn top_k(values: &[f32], k: usize) -> Vec<(u32, f32)> {
    let mut indexed: Vec<(u32, f32)> = values
        .iter()
        .enumerate()
        .map(|(i, v)| (i as u32, *v))
        .collect();
    let by_value_desc = |a: &(u32, f32), b: &(u32, f32)| b.1.total_cmp(&a.1);
    if k < indexed.len() {
        indexed.select_nth_unstable_by(k, by_value_desc);
        indexed.truncate(k);
    }
    indexed.sort_by(by_value_desc);
    indexed
}

/// Beam search over a decoder.
///
/// `next_log_probs` receives a full token sequence and returns the
/// log-probabilities of every vocabulary entry for the next position.
/// The returned sequence starts with `prefix` and never contains the EOS token.
pub fn beam_search<F>(
    params: &GenerationParams,
    prefix: &[u32],
    eos_token_id: u32,
    mut next_log_probs: F,
) -> anyhow::Result<Vec<u32>>
where
    F: FnMut(&[u32]) -> anyhow::Result<Vec<f32>>,
{
    params.validate(prefix.len())?;

    let num_beams = params.num_beams;
    let mut finished = Hypotheses::new(params);
    let mut beams = vec![Beam {
        tokens: prefix.to_vec(),
        sum_logprobs: 0.0,
    }];
    let mut done = false;

    while beams[0].tokens.len() < params.max_length {
        let cur_len = beams[0].tokens.len();
        let mut candidates: Vec<(usize, u32, f32)> = vec![];
        for (beam_idx, beam) in beams.iter().enumerate() {
            let log_probs = next_log_probs(&beam.tokens)?;
            if log_probs.is_empty() {
                bail!("decoder returned empty distribution");
            }
            candidates.extend(
                top_k(&log_probs, 2 * num_beams)
                    .into_iter()
                    .map(|(token, lp)| (beam_idx, token, beam.sum_logprobs + lp)),
            );
        }
        candidates.sort_by(|a, b| b.2.total_cmp(&a.2));
        candidates.truncate(2 * num_beams);
        let best_candidate = candidates[0].2;

        let mut next_beams = Vec::with_capacity(num_beams);
        for (rank, (beam_idx, token, sum_logprobs)) in candidates.into_iter().enumerate() {
            if token == eos_token_id {
                // an EOS outside the top `num_beams` would not be kept by plain search either
                if rank < num_beams {
                    finished.add(beams[beam_idx].tokens.clone(), sum_logprobs);
                }
            } else {
                let mut tokens = beams[beam_idx].tokens.clone();
                tokens.push(token);
                next_beams.push(Beam {
                    tokens,
                    sum_logprobs,
                });
            }
            if next_beams.len() == num_beams {
                break;
            }
        }

        if next_beams.is_empty() {
            done = true;
            break;
        }
        beams = next_beams;

        // the best score this step could reach, finished candidates included
        if finished.is_done(best_candidate, cur_len) {
            done = true;
            break;
        }
    }

    if !done {
        for beam in beams {
            finished.add(beam.tokens, beam.sum_logprobs);
        }
    }

    match finished.best() {
        Some(hypothesis) => Ok(hypothesis.tokens),
        None => bail!("beam search produced no hypothesis"),
    }
}
