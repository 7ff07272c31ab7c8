use anyhow::Result;

use super::{Batch, LayerValues, NodeValue};

pub mod embedding;
pub mod fully_connected;
pub mod lstm;

pub use embedding::Embedding;
pub use fully_connected::FullyConnected;
pub use lstm::Lstm;

/// Receives `(is_weight, gradient, index)` for every stored gradient slot and returns the value
/// to keep. `is_weight` is `true` for slots backing an entry of [`Updatable::weights`] and `false`
/// for auxiliary (bias) slots; `index` is the slot's position within its own vector.
pub type GradientCombinator<'a> = &'a dyn Fn(bool, NodeValue, usize) -> NodeValue;

/// Maps `(current_weight, gradient)` to the next weight.
pub type UpdateRule<'a> = &'a dyn Fn(NodeValue, NodeValue) -> NodeValue;

pub trait Layer {
    fn forward(
        &mut self,
        inputs: &Batch<LayerValues>,
        is_training: bool,
    ) -> Result<Batch<LayerValues>>;

    /// Consumes output gradients for the last forward batch and returns input gradients.
    fn backward(&mut self, deltas: &Batch<LayerValues>) -> Result<Batch<LayerValues>>;
}

pub trait Updatable: Layer {
    fn weights(&self) -> &[NodeValue];

    fn weights_mut(&mut self) -> &mut [NodeValue];

    /// Trained parameters kept outside [`Updatable::weights`], such as biases.
    fn aux(&self) -> &[NodeValue] {
        &[]
    }

    fn aux_mut(&mut self) -> &mut [NodeValue] {
        &mut []
    }

    /// Per-example gradient length. Exceeds `weights().len()` when the layer tracks auxiliary
    /// parameters that are not part of its weight vector.
    fn gradient_len(&self) -> usize;

    /// Per-example gradients accumulated by the last backward pass, laid out as the weight
    /// gradients followed by any auxiliary gradients. Empty before the first backward pass.
    fn gradients(&self) -> Result<Batch<LayerValues>>;

    fn set_gradients(&mut self, combinator: GradientCombinator<'_>);

    /// Averages `gradients` over the batch and applies `rule` once to every parameter.
    fn update(&mut self, gradients: &Batch<LayerValues>, rule: UpdateRule<'_>) -> Result<()>;
}

pub trait Statable {
    fn state(&self) -> Option<&Batch<LayerValues>>;

    fn set_state(&mut self, state: Option<Batch<LayerValues>>) -> Result<()>;
}

/// Per-example gradients held by a leaf layer between backward and update.
#[derive(Debug, Clone, Default)]
pub(crate) struct GradientBuffer {
    weights_len: usize,
    aux_len: usize,
    batch: Option<Batch<LayerValues>>,
}

impl GradientBuffer {
    pub fn new(weights_len: usize, aux_len: usize) -> Self {
        Self {
            weights_len,
            aux_len,
            batch: None,
        }
    }

    pub fn len(&self) -> usize {
        self.weights_len + self.aux_len
    }

    pub fn store(&mut self, gradients: Batch<LayerValues>, context: &'static str) -> Result<()> {
        gradients.assert_example_lengths(self.len(), context)?;
        self.batch = Some(gradients);
        Ok(())
    }

    pub fn snapshot(&self) -> Batch<LayerValues> {
        self.batch.clone().unwrap_or_default()
    }

    pub fn combine(&mut self, combinator: GradientCombinator<'_>) {
        let weights_len = self.weights_len;
        let Some(batch) = self.batch.as_mut() else {
            return;
        };

        let examples = std::mem::take(batch).into_inner();
        *batch = examples
            .into_iter()
            .map(|example| {
                example
                    .iter()
                    .enumerate()
                    .map(|(slot, &gradient)| match slot < weights_len {
                        true => combinator(true, gradient, slot),
                        false => combinator(false, gradient, slot - weights_len),
                    })
                    .collect::<LayerValues>()
            })
            .collect();
    }
}

/// Applies `rule` to weights then auxiliary parameters using the batch-mean gradient.
pub(crate) fn apply_update(
    weights: &mut [NodeValue],
    aux: &mut [NodeValue],
    gradients: &Batch<LayerValues>,
    rule: UpdateRule<'_>,
    context: &'static str,
) -> Result<()> {
    let mean = gradients.mean(weights.len() + aux.len(), context)?;
    let (weight_gradients, aux_gradients) = mean.split_at(weights.len());

    for (w, g) in weights.iter_mut().zip(weight_gradients) {
        *w = rule(*w, *g);
    }
    for (b, g) in aux.iter_mut().zip(aux_gradients) {
        *b = rule(*b, *g);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gradient_buffer_tags_weight_and_aux_slots() {
        let mut buffer = GradientBuffer::new(2, 1);
        let batch: Batch<LayerValues> = vec![LayerValues::new(vec![1.0, 2.0, 3.0])].into();
        buffer.store(batch, "test").unwrap();

        buffer.combine(&|is_weight, gradient, index| match is_weight {
            true => gradient * 10.0 + index as NodeValue,
            false => -gradient - index as NodeValue,
        });

        let combined = buffer.snapshot();
        assert_eq!(combined[0], LayerValues::new(vec![10.0, 21.0, -3.0]));
    }

    #[test]
    fn gradient_buffer_is_empty_before_backward() {
        let buffer = GradientBuffer::new(4, 2);

        assert_eq!(buffer.len(), 6);
        assert!(buffer.snapshot().is_empty());
    }

    #[test]
    fn apply_update_uses_batch_mean() {
        let mut weights = vec![1.0, 1.0];
        let mut bias = vec![0.0];
        let gradients: Batch<LayerValues> = vec![
            LayerValues::new(vec![1.0, 2.0, 4.0]),
            LayerValues::new(vec![3.0, 2.0, 0.0]),
        ]
        .into();

        apply_update(&mut weights, &mut bias, &gradients, &|w, g| w - g, "test").unwrap();

        assert_eq!(weights, vec![-1.0, -1.0]);
        assert_eq!(bias, vec![-2.0]);
    }
}
