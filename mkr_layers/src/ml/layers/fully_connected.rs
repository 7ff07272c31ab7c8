use anyhow::Result;

use crate::ml::{init::Initializer, Batch, LayerError, LayerValues, NodeValue, RngStrategy};

use super::{apply_update, GradientBuffer, GradientCombinator, Layer, Updatable, UpdateRule};

/// Affine map `y = xW + b`. `W` is stored input-major (`inputs_count` rows of `outputs_count`)
/// and makes up the weight vector; the bias is auxiliary and starts at zero.
#[derive(Debug, Clone)]
pub struct FullyConnected {
    weights: LayerValues,
    bias: LayerValues,
    inputs_count: usize,
    outputs_count: usize,
    inputs: Option<Batch<LayerValues>>,
    gradients: GradientBuffer,
}

impl FullyConnected {
    pub fn new(
        inputs_count: usize,
        outputs_count: usize,
        initializer: &Initializer,
        rng: &RngStrategy,
    ) -> Self {
        let mut weights = LayerValues::zeros(inputs_count * outputs_count);
        initializer.apply(weights.iter_mut(), inputs_count, rng);

        Self {
            weights,
            bias: LayerValues::zeros(outputs_count),
            inputs_count,
            outputs_count,
            inputs: None,
            gradients: GradientBuffer::new(inputs_count * outputs_count, outputs_count),
        }
    }

    pub fn inputs_count(&self) -> usize {
        self.inputs_count
    }

    pub fn outputs_count(&self) -> usize {
        self.outputs_count
    }

    pub fn bias(&self) -> &[NodeValue] {
        &self.bias
    }

    fn forward_row(&self, inputs: &LayerValues) -> Result<LayerValues> {
        inputs.assert_length_equals(self.inputs_count, "fully connected forward inputs")?;

        let mut outputs = self.bias.clone();
        for (x, row) in inputs.iter().zip(self.weights.chunks_exact(self.outputs_count.max(1))) {
            outputs.iter_mut().zip(row).for_each(|(y, w)| *y += x * w);
        }
        Ok(outputs)
    }

    fn backward_row(&self, inputs: &LayerValues, delta: &LayerValues) -> (LayerValues, LayerValues) {
        let outputs_count = self.outputs_count;
        let mut gradients = LayerValues::zeros(self.gradients.len());
        let (weight_gradients, bias_gradients) = gradients.split_at_mut(self.weights.len());

        let mut input_gradients = LayerValues::zeros(self.inputs_count);
        let rows = self.weights.chunks_exact(outputs_count.max(1));
        let gradient_rows = weight_gradients.chunks_exact_mut(outputs_count.max(1));

        for (((x, dx), row), gradient_row) in inputs
            .iter()
            .zip(input_gradients.iter_mut())
            .zip(rows)
            .zip(gradient_rows)
        {
            for ((w, g), d) in row.iter().zip(gradient_row.iter_mut()).zip(delta.iter()) {
                *g = x * d;
                *dx += w * d;
            }
        }
        bias_gradients.copy_from_slice(delta);

        (gradients, input_gradients)
    }
}

impl Layer for FullyConnected {
    fn forward(
        &mut self,
        inputs: &Batch<LayerValues>,
        _is_training: bool,
    ) -> Result<Batch<LayerValues>> {
        let outputs = inputs.try_map(|_, x| self.forward_row(x))?;
        self.inputs = Some(inputs.clone());
        Ok(outputs)
    }

    fn backward(&mut self, deltas: &Batch<LayerValues>) -> Result<Batch<LayerValues>> {
        let inputs = self.inputs.as_ref().ok_or(LayerError::MissingForward {
            context: "fully connected backward",
        })?;
        deltas.assert_size_equals(inputs.len(), "fully connected backward")?;
        deltas.assert_example_lengths(self.outputs_count, "fully connected backward deltas")?;

        let (gradients, input_gradients) = deltas
            .try_map(|idx, delta| Ok(self.backward_row(&inputs[idx], delta)))?
            .unzip();

        self.gradients.store(gradients, "fully connected gradients")?;
        Ok(input_gradients)
    }
}

impl Updatable for FullyConnected {
    fn weights(&self) -> &[NodeValue] {
        &self.weights
    }

    fn weights_mut(&mut self) -> &mut [NodeValue] {
        &mut self.weights
    }

    fn aux(&self) -> &[NodeValue] {
        &self.bias
    }

    fn aux_mut(&mut self) -> &mut [NodeValue] {
        &mut self.bias
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
        apply_update(
            &mut self.weights,
            &mut self.bias,
            gradients,
            rule,
            "fully connected update",
        )
    }
}
