use anyhow::Result;

use crate::ml::{init::Initializer, Batch, LayerError, LayerValues, NodeValue, RngStrategy};

use super::{apply_update, GradientBuffer, GradientCombinator, Layer, Updatable, UpdateRule};

/// Token lookup table. Each example is `sequence_len` token indices stored as scalars and maps
/// to `sequence_len * dimensions` values, one embedding row per position.
#[derive(Debug, Clone)]
pub struct Embedding {
    weights: LayerValues,
    sequence_len: usize,
    vocab_size: usize,
    dimensions: usize,
    tokens: Option<Batch<Vec<usize>>>,
    gradients: GradientBuffer,
}

impl Embedding {
    pub fn new(
        sequence_len: usize,
        vocab_size: usize,
        dimensions: usize,
        initializer: &Initializer,
        rng: &RngStrategy,
    ) -> Self {
        let mut weights = LayerValues::zeros(vocab_size * dimensions);
        initializer.apply(weights.iter_mut(), vocab_size, rng);

        Self {
            weights,
            sequence_len,
            vocab_size,
            dimensions,
            tokens: None,
            gradients: GradientBuffer::new(vocab_size * dimensions, 0),
        }
    }

    pub fn sequence_len(&self) -> usize {
        self.sequence_len
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embedding_row(&self, token: usize) -> &[NodeValue] {
        let start = token * self.dimensions;
        &self.weights[start..start + self.dimensions]
    }

    fn decode_tokens(&self, example: &LayerValues) -> Result<Vec<usize>> {
        example.assert_length_equals(self.sequence_len, "embedding forward inputs")?;

        example
            .iter()
            .enumerate()
            .map(|(position, &value)| -> Result<usize> {
                let is_index = value.is_finite() && value >= 0.0 && value.fract() == 0.0;
                match is_index && (value as usize) < self.vocab_size {
                    true => Ok(value as usize),
                    false => Err(LayerError::InvalidToken {
                        position,
                        value: value.to_string(),
                        vocab_size: self.vocab_size,
                    }
                    .into()),
                }
            })
            .collect()
    }
}

impl Layer for Embedding {
    fn forward(
        &mut self,
        inputs: &Batch<LayerValues>,
        _is_training: bool,
    ) -> Result<Batch<LayerValues>> {
        let tokens = inputs.try_map(|_, example| self.decode_tokens(example))?;
        let outputs = tokens.try_map(|_, tokens| {
            Ok(tokens
                .iter()
                .flat_map(|&token| self.embedding_row(token).iter().copied())
                .collect::<LayerValues>())
        })?;

        self.tokens = Some(tokens);
        Ok(outputs)
    }

    fn backward(&mut self, deltas: &Batch<LayerValues>) -> Result<Batch<LayerValues>> {
        let tokens = self.tokens.as_ref().ok_or(LayerError::MissingForward {
            context: "embedding backward",
        })?;
        deltas.assert_size_equals(tokens.len(), "embedding backward")?;
        deltas.assert_example_lengths(
            self.sequence_len * self.dimensions,
            "embedding backward deltas",
        )?;

        let (vocab_size, dimensions) = (self.vocab_size, self.dimensions);
        let gradients = deltas.try_map(|idx, delta| {
            let mut gradient = LayerValues::zeros(vocab_size * dimensions);
            let rows = delta.chunks_exact(dimensions.max(1));
            for (&token, row) in tokens[idx].iter().zip(rows) {
                let start = token * dimensions;
                gradient[start..start + dimensions]
                    .iter_mut()
                    .zip(row)
                    .for_each(|(g, d)| *g += d);
            }
            Ok(gradient)
        })?;

        self.gradients.store(gradients, "embedding gradients")?;
        Ok(Batch::zeros(deltas.len(), self.sequence_len))
    }
}

impl Updatable for Embedding {
    fn weights(&self) -> &[NodeValue] {
        &self.weights
    }

    fn weights_mut(&mut self) -> &mut [NodeValue] {
        &mut self.weights
    }

    fn gradient_len(&self) -> usize {
        self.gradients.len()
    }

    fn gradients(&self) -> Result<Batch<LayerValues>> {
        Ok(self.gradients.snapshot())
    }

    fn set_gradients(&mut self, combinator: GradientCombinator<'_>) {
        self.gradients.combine(combinator);
    }

    fn update(&mut self, gradients: &Batch<LayerValues>, rule: UpdateRule<'_>) -> Result<()> {
        apply_update(&mut self.weights, &mut [], gradients, rule, "embedding update")
    }
}
