use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use layers::ml::{
    layers::{Layer, Statable, Updatable},
    seq2seq::Decoder,
    Batch, LayerValues, NodeValue, RngStrategy, RNG,
};

use crate::config::TrainDecoderConfig;

const DEFAULT_CORPUS: &str = "the quick brown fox jumps over the lazy dog. \
    a journey of a thousand miles begins with a single step. \
    all that glitters is not gold. the early bird catches the worm.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<char>", into = "Vec<char>")]
pub struct Vocab {
    chars: Vec<char>,
    index: HashMap<char, usize>,
}

impl From<Vec<char>> for Vocab {
    fn from(chars: Vec<char>) -> Self {
        Self::from_chars(chars)
    }
}

impl From<Vocab> for Vec<char> {
    fn from(vocab: Vocab) -> Self {
        vocab.chars
    }
}

impl Vocab {
    pub fn from_corpus(corpus: &str) -> Result<Self> {
        let chars: Vec<char> = corpus.chars().sorted().dedup().collect();
        if chars.is_empty() {
            Err(anyhow!("corpus contains no characters"))?;
        }
        Ok(Self::from_chars(chars))
    }

    fn from_chars(chars: Vec<char>) -> Self {
        let index = chars.iter().enumerate().map(|(i, &c)| (c, i)).collect();
        Self { chars, index }
    }

    pub fn len(&self) -> usize {
        self.chars.len()
    }

    pub fn encode(&self, text: &str) -> Result<Vec<usize>> {
        text.chars()
            .map(|c| {
                self.index
                    .get(&c)
                    .copied()
                    .with_context(|| format!("character {c:?} is not in the vocabulary"))
            })
            .collect()
    }

    pub fn decode(&self, tokens: &[usize]) -> String {
        tokens
            .iter()
            .map(|&token| self.chars.get(token).copied().unwrap_or('?'))
            .collect()
    }
}

/// Everything needed to resume training or run the decoder later.
#[derive(Debug, Serialize, Deserialize)]
pub struct ModelSnapshot {
    pub config: TrainDecoderConfig,
    pub vocab: Vocab,
    pub decoder: Decoder,
}

impl ModelSnapshot {
    pub fn load(path: &str) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read model from {path}"))?;
        let snapshot: ModelSnapshot = serde_json::from_str(&json)
            .with_context(|| format!("failed to parse model from {path}"))?;
        Ok(snapshot)
    }

    pub fn save(&self, path: &str) -> Result<()> {
        let json = serde_json::to_string(self)?;
        std::fs::write(path, json).with_context(|| format!("failed to write model to {path}"))?;
        Ok(())
    }
}

pub fn read_corpus(config: &TrainDecoderConfig) -> Result<String> {
    match &config.input_txt_path {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read corpus from {path}")),
        None => Ok(DEFAULT_CORPUS.to_string()),
    }
}

pub fn new_rng(config: &TrainDecoderConfig) -> RngStrategy {
    match config.seed {
        Some(seed) => RngStrategy::testable(seed),
        None => RngStrategy::default(),
    }
}

pub fn setup_model(config: &TrainDecoderConfig, corpus: &str) -> Result<ModelSnapshot> {
    if let Some(path) = &config.resume_path {
        let snapshot = ModelSnapshot::load(path)?;
        let decoder_config = snapshot.decoder.config();
        let config = TrainDecoderConfig {
            sequence_len: decoder_config.sequence_len,
            word_vector_size: decoder_config.word_vector_size,
            hidden_size: decoder_config.hidden_size,
            ..config.clone()
        };
        info!(path, "resumed model");
        return Ok(ModelSnapshot { config, ..snapshot });
    }

    let vocab = Vocab::from_corpus(corpus)?;
    let decoder = Decoder::new_builder(config.sequence_len, vocab.len(), config.word_vector_size)
        .with_hidden_size(config.hidden_size)
        .with_rng(new_rng(config))
        .build()?;

    info!(
        vocab_size = vocab.len(),
        weights = decoder.weights().len(),
        "created decoder"
    );
    Ok(ModelSnapshot {
        config: config.clone(),
        vocab,
        decoder,
    })
}

/// Picks `batch_size` windows; each target is its input shifted forward by one character.
pub fn sample_batch(
    tokens: &[usize],
    sequence_len: usize,
    batch_size: usize,
    rng: &RngStrategy,
) -> Result<(Batch<LayerValues>, Vec<Vec<usize>>)> {
    if tokens.len() <= sequence_len {
        Err(anyhow!(
            "corpus has {} tokens, need more than sequence_len={sequence_len}",
            tokens.len()
        ))?;
    }

    let starts = (0..batch_size)
        .map(|_| rng.rand_range(0, tokens.len() - sequence_len))
        .collect_vec();
    let inputs = starts
        .iter()
        .map(|&start| &tokens[start..start + sequence_len])
        .collect_vec();
    let targets = starts
        .iter()
        .map(|&start| tokens[start + 1..start + sequence_len + 1].to_vec())
        .collect_vec();

    Ok((Batch::from_tokens(&inputs), targets))
}

/// Mean per-position cross entropy of softmax(outputs) and its gradient with respect to outputs.
pub fn softmax_cross_entropy(
    outputs: &Batch<LayerValues>,
    targets: &[Vec<usize>],
    vocab_size: usize,
) -> Result<(NodeValue, Batch<LayerValues>)> {
    outputs.assert_size_equals(targets.len(), "loss targets")?;

    let mut loss = 0.0;
    let mut positions = 0;
    let mut deltas = vec![];
    for (logits, target) in outputs.iter().zip(targets) {
        logits.assert_length_equals(target.len() * vocab_size, "loss logits")?;

        let mut delta = LayerValues::zeros(logits.len());
        for ((row, delta_row), &token) in logits
            .chunks_exact(vocab_size)
            .zip(delta.chunks_exact_mut(vocab_size))
            .zip(target)
        {
            let max = row.iter().copied().fold(NodeValue::MIN, NodeValue::max);
            let exps = row.iter().map(|x| (x - max).exp()).collect_vec();
            let sum: NodeValue = exps.iter().sum();

            for (d, e) in delta_row.iter_mut().zip(&exps) {
                *d = e / sum;
            }
            loss -= delta_row[token].max(NodeValue::MIN_POSITIVE).ln();
            delta_row[token] -= 1.0;
            positions += 1;
        }
        deltas.push(delta);
    }

    Ok((loss / positions.max(1) as NodeValue, deltas.into()))
}

pub fn argmax_tokens(logits: &LayerValues, vocab_size: usize) -> Vec<usize> {
    logits
        .chunks_exact(vocab_size)
        .map(|row| row.iter().position_max_by(|a, b| a.total_cmp(b)).unwrap_or(0))
        .collect()
}

#[instrument(level = "info", skip_all, fields(rounds = model.config.training_rounds))]
pub fn train(model: &mut ModelSnapshot, corpus: &str) -> Result<NodeValue> {
    let config = &model.config;
    let decoder = &mut model.decoder;
    let tokens = model.vocab.encode(corpus)?;
    let rng = new_rng(config);
    let train_rate = config.train_rate;
    let vocab_size = model.vocab.len();

    let mut last_loss = NodeValue::NAN;
    for round in 0..config.training_rounds {
        decoder.set_state(None)?;
        let (inputs, targets) =
            sample_batch(&tokens, config.sequence_len, config.batch_size, &rng)?;

        let outputs = decoder.forward(&inputs, true)?;
        let (loss, deltas) = softmax_cross_entropy(&outputs, &targets, vocab_size)?;
        decoder.backward(&deltas)?;

        let gradients = decoder.gradients()?;
        decoder.update(&gradients, &|w, g| w - train_rate * g)?;

        if round % config.log_interval.max(1) == 0 {
            info!(round, loss, "training round");
        }
        last_loss = loss;
    }

    let (inputs, _) = sample_batch(&tokens, config.sequence_len, 1, &rng)?;
    decoder.set_state(None)?;
    let outputs = decoder.forward(&inputs, false)?;
    let input_tokens = inputs[0].iter().map(|&x| x as usize).collect_vec();
    info!(
        input = model.vocab.decode(&input_tokens),
        predicted = model.vocab.decode(&argmax_tokens(&outputs[0], vocab_size)),
        "sample prediction"
    );

    Ok(last_loss)
}
