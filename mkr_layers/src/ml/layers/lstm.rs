use anyhow::Result;
use itertools::Itertools;

use crate::ml::{init::Initializer, Batch, LayerError, LayerValues, NodeValue, RngStrategy};

use super::{
    apply_update, GradientBuffer, GradientCombinator, Layer, Statable, Updatable, UpdateRule,
};

const GATES: usize = 4;

/// Long short-term memory layer over a fixed-length sequence.
///
/// Each example holds `sequence_len` steps of `input_size` values. The weight vector is the
/// input kernel (`input_size x 4*hidden_size`) followed by the recurrent kernel
/// (`hidden_size x 4*hidden_size`), with gate columns ordered input, forget, candidate, output.
/// The `4*hidden_size` bias is auxiliary: it is trained but not part of [`Updatable::weights`].
#[derive(Debug, Clone)]
pub struct Lstm {
    weights: LayerValues,
    bias: LayerValues,
    input_size: usize,
    hidden_size: usize,
    sequence_len: usize,
    stateful: bool,
    return_sequences: bool,
    state: Option<Batch<LayerValues>>,
    traces: Option<Batch<Trace>>,
    gradients: GradientBuffer,
}

/// Activations recorded by one example's forward pass.
#[derive(Debug, Clone)]
struct Trace {
    inputs: LayerValues,
    /// `h_0..=h_T`
    hidden: Vec<LayerValues>,
    /// `c_0..=c_T`
    cells: Vec<LayerValues>,
    /// Activated `[i, f, g, o]` per step.
    gates: Vec<LayerValues>,
}

impl Lstm {
    pub fn new(
        input_size: usize,
        hidden_size: usize,
        sequence_len: usize,
        stateful: bool,
        initializer: &Initializer,
        rng: &RngStrategy,
    ) -> Self {
        let kernel_len = input_size * GATES * hidden_size;
        let recurrent_len = hidden_size * GATES * hidden_size;

        let mut weights = LayerValues::zeros(kernel_len + recurrent_len);
        let (kernel, recurrent) = weights.split_at_mut(kernel_len);
        initializer.apply(kernel.iter_mut(), input_size, rng);
        initializer.apply(recurrent.iter_mut(), hidden_size, rng);

        Self {
            weights,
            bias: LayerValues::zeros(GATES * hidden_size),
            input_size,
            hidden_size,
            sequence_len,
            stateful,
            return_sequences: false,
            state: None,
            traces: None,
            gradients: GradientBuffer::new(kernel_len + recurrent_len, GATES * hidden_size),
        }
    }

    /// Emit the hidden state of every step instead of only the last one.
    pub fn with_return_sequences(mut self, return_sequences: bool) -> Self {
        self.return_sequences = return_sequences;
        self
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    pub fn sequence_len(&self) -> usize {
        self.sequence_len
    }

    pub fn is_stateful(&self) -> bool {
        self.stateful
    }

    pub fn output_len(&self) -> usize {
        match self.return_sequences {
            true => self.sequence_len * self.hidden_size,
            false => self.hidden_size,
        }
    }

    pub fn bias(&self) -> &[NodeValue] {
        &self.bias
    }

    fn kernel(&self) -> &[NodeValue] {
        &self.weights[..self.input_size * GATES * self.hidden_size]
    }

    fn recurrent_kernel(&self) -> &[NodeValue] {
        &self.weights[self.input_size * GATES * self.hidden_size..]
    }

    fn forward_example(&self, inputs: &LayerValues, initial: Option<&LayerValues>) -> Result<Trace> {
        inputs.assert_length_equals(self.sequence_len * self.input_size, "lstm forward inputs")?;

        let h = self.hidden_size;
        let width = GATES * h;
        let (h_0, c_0) = match initial {
            Some(state) => {
                state.assert_length_equals(2 * h, "lstm state")?;
                (LayerValues::from(&state[..h]), LayerValues::from(&state[h..]))
            }
            None => (LayerValues::zeros(h), LayerValues::zeros(h)),
        };

        let mut trace = Trace {
            inputs: inputs.clone(),
            hidden: vec![h_0],
            cells: vec![c_0],
            gates: Vec::with_capacity(self.sequence_len),
        };

        for x_t in inputs.chunks_exact(self.input_size.max(1)).take(self.sequence_len) {
            let h_prev = &trace.hidden[trace.hidden.len() - 1];
            let c_prev = &trace.cells[trace.cells.len() - 1];

            let mut z = self.bias.clone();
            accumulate_rows(&mut z, x_t, self.kernel(), width);
            accumulate_rows(&mut z, h_prev, self.recurrent_kernel(), width);

            let (z_i, rest) = z.split_at_mut(h);
            let (z_f, rest) = rest.split_at_mut(h);
            let (z_g, z_o) = rest.split_at_mut(h);
            z_i.iter_mut().for_each(|x| *x = sigmoid(*x));
            z_f.iter_mut().for_each(|x| *x = sigmoid(*x));
            z_g.iter_mut().for_each(|x| *x = x.tanh());
            z_o.iter_mut().for_each(|x| *x = sigmoid(*x));

            let c_t: LayerValues = (0..h)
                .map(|j| z[h + j] * c_prev[j] + z[j] * z[2 * h + j])
                .collect();
            let h_t: LayerValues = (0..h).map(|j| z[3 * h + j] * c_t[j].tanh()).collect();

            trace.gates.push(z);
            trace.cells.push(c_t);
            trace.hidden.push(h_t);
        }

        Ok(trace)
    }

    fn backward_example(&self, trace: &Trace, delta: &LayerValues) -> (LayerValues, LayerValues) {
        let h = self.hidden_size;
        let n = self.input_size;
        let width = GATES * h;
        let kernel_len = n * width;

        let mut gradients = LayerValues::zeros(self.gradients.len());
        let mut input_gradients = LayerValues::zeros(self.sequence_len * n);

        let mut dh = match self.return_sequences {
            true => LayerValues::zeros(h),
            false => delta.clone(),
        };
        let mut dc = LayerValues::zeros(h);
        let mut dz = LayerValues::zeros(width);

        for t in (0..self.sequence_len).rev() {
            if self.return_sequences {
                let step_delta = &delta[t * h..(t + 1) * h];
                dh.iter_mut().zip(step_delta).for_each(|(d, s)| *d += s);
            }

            let gates = &trace.gates[t];
            let c_t = &trace.cells[t + 1];
            let c_prev = &trace.cells[t];
            let h_prev = &trace.hidden[t];

            for j in 0..h {
                let (i, f, g, o) = (gates[j], gates[h + j], gates[2 * h + j], gates[3 * h + j]);
                let tanh_c = c_t[j].tanh();

                dc[j] += dh[j] * o * (1.0 - tanh_c * tanh_c);
                dz[j] = dc[j] * g * i * (1.0 - i);
                dz[h + j] = dc[j] * c_prev[j] * f * (1.0 - f);
                dz[2 * h + j] = dc[j] * i * (1.0 - g * g);
                dz[3 * h + j] = dh[j] * tanh_c * o * (1.0 - o);
                dc[j] *= f;
            }

            let (kernel_gradients, rest) = gradients.split_at_mut(kernel_len);
            let (recurrent_gradients, bias_gradients) = rest.split_at_mut(h * width);

            let x_t = &trace.inputs[t * n..(t + 1) * n];
            outer_accumulate(kernel_gradients, x_t, &dz);
            outer_accumulate(recurrent_gradients, h_prev, &dz);
            bias_gradients.iter_mut().zip(dz.iter()).for_each(|(b, d)| *b += d);

            project_rows(&mut input_gradients[t * n..(t + 1) * n], self.kernel(), &dz);
            project_rows(&mut dh, self.recurrent_kernel(), &dz);
        }

        (gradients, input_gradients)
    }

    fn initial_states(&self, batch_size: usize) -> Result<Option<&Batch<LayerValues>>> {
        match (&self.state, self.stateful) {
            (Some(state), true) => {
                state.assert_size_equals(batch_size, "lstm state")?;
                Ok(Some(state))
            }
            _ => Ok(None),
        }
    }
}

impl Layer for Lstm {
    fn forward(
        &mut self,
        inputs: &Batch<LayerValues>,
        is_training: bool,
    ) -> Result<Batch<LayerValues>> {
        let initial = self.initial_states(inputs.len())?;
        let traces = inputs.try_map(|idx, x| {
            self.forward_example(x, initial.map(|state| &state[idx]))
        })?;

        let outputs: Batch<LayerValues> = traces
            .iter()
            .map(|trace| match self.return_sequences {
                true => trace.hidden[1..]
                    .iter()
                    .flat_map(|h| h.iter().copied())
                    .collect::<LayerValues>(),
                false => trace.hidden[trace.hidden.len() - 1].clone(),
            })
            .collect();

        if self.stateful && is_training {
            let final_states: Batch<LayerValues> = traces
                .iter()
                .map(|trace| {
                    let h_t = &trace.hidden[self.sequence_len];
                    let c_t = &trace.cells[self.sequence_len];
                    h_t.iter().chain(c_t.iter()).copied().collect()
                })
                .collect();
            self.state = Some(final_states);
        }

        self.traces = Some(traces);
        Ok(outputs)
    }

    fn backward(&mut self, deltas: &Batch<LayerValues>) -> Result<Batch<LayerValues>> {
        let traces = self.traces.as_ref().ok_or(LayerError::MissingForward {
            context: "lstm backward",
        })?;
        deltas.assert_size_equals(traces.len(), "lstm backward")?;
        deltas.assert_example_lengths(self.output_len(), "lstm backward deltas")?;

        let (gradients, input_gradients) = deltas
            .try_map(|idx, delta| Ok(self.backward_example(&traces[idx], delta)))?
            .unzip();

        self.gradients.store(gradients, "lstm gradients")?;
        Ok(input_gradients)
    }
}

impl Updatable for Lstm {
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
        apply_update(&mut self.weights, &mut self.bias, gradients, rule, "lstm update")
    }
}

impl Statable for Lstm {
    fn state(&self) -> Option<&Batch<LayerValues>> {
        self.state.as_ref()
    }

    fn set_state(&mut self, state: Option<Batch<LayerValues>>) -> Result<()> {
        if let Some(state) = &state {
            state.assert_example_lengths(2 * self.hidden_size, "lstm state")?;
        }
        self.state = state;
        Ok(())
    }
}

fn sigmoid(x: NodeValue) -> NodeValue {
    1.0 / (1.0 + (-x).exp())
}

/// `target += lhs * rows`, where `rows` is `lhs.len()` rows of `width` values.
fn accumulate_rows(target: &mut [NodeValue], lhs: &[NodeValue], rows: &[NodeValue], width: usize) {
    for (x, row) in lhs.iter().zip(rows.chunks_exact(width.max(1))) {
        target.iter_mut().zip(row).for_each(|(t, w)| *t += x * w);
    }
}

/// `target[r] += dot(rows[r], rhs)`, the transposed product of [`accumulate_rows`].
fn project_rows(target: &mut [NodeValue], rows: &[NodeValue], rhs: &[NodeValue]) {
    let projected = rows
        .chunks_exact(rhs.len().max(1))
        .map(|row| row.iter().zip_eq(rhs).map(|(w, d)| w * d).sum::<NodeValue>());

    for (t, p) in target.iter_mut().zip(projected) {
        *t = p;
    }
}

/// `target += lhs ⊗ rhs`, with `target` stored row-major as `lhs.len() x rhs.len()`.
fn outer_accumulate(target: &mut [NodeValue], lhs: &[NodeValue], rhs: &[NodeValue]) {
    for (x, row) in lhs.iter().zip(target.chunks_exact_mut(rhs.len().max(1))) {
        row.iter_mut().zip(rhs).for_each(|(t, d)| *t += x * d);
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use crate::ml::tests::helpers::{assert_input_gradients, assert_weight_gradients};

    use super::*;

    fn new_lstm(stateful: bool) -> Lstm {
        let rng = RngStrategy::testable(1234);
        Lstm::new(3, 4, 5, stateful, &Initializer::lecun_normal(), &rng)
    }

    fn sample_inputs(batch_size: usize, len: usize) -> Batch<LayerValues> {
        (0..batch_size)
            .map(|b| {
                (0..len)
                    .map(|i| ((i * 7 + b * 3) % 11) as NodeValue / 11.0 - 0.5)
                    .collect()
            })
            .collect()
    }

    #[test]
    fn lstm_parameter_lengths_include_auxiliary_bias() {
        let lstm = new_lstm(false);

        assert_eq!(lstm.weights().len(), 3 * 16 + 4 * 16);
        assert_eq!(lstm.gradient_len(), lstm.weights().len() + 16);
        assert_eq!(lstm.bias(), &[0.0; 16]);
    }

    #[test]
    fn lstm_outputs_final_hidden_state() {
        let mut lstm = new_lstm(false);
        let outputs = lstm.forward(&sample_inputs(2, 15), false).unwrap();

        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].len(), 4);
        assert!(outputs.iter().flat_map(|x| x.iter()).all(|x| x.abs() < 1.0));
        assert_ne!(outputs[0], outputs[1]);
    }

    #[test]
    fn lstm_with_zero_weights_outputs_zero() {
        let rng = RngStrategy::testable(1);
        let mut lstm = Lstm::new(2, 3, 4, false, &Initializer::Zero, &rng);

        let outputs = lstm.forward(&sample_inputs(1, 8), false).unwrap();

        assert_eq!(outputs[0], LayerValues::zeros(3));
    }

    #[test]
    fn lstm_return_sequences_emits_every_step() {
        let mut lstm = new_lstm(false).with_return_sequences(true);
        let inputs = sample_inputs(1, 15);

        let outputs = lstm.forward(&inputs, false).unwrap();
        let last = new_lstm(false).forward(&inputs, false).unwrap();

        assert_eq!(outputs[0].len(), 5 * 4);
        assert_eq!(&outputs[0][16..], last[0].as_slice());
    }

    #[test]
    fn stateful_lstm_commits_state_only_when_training() {
        let mut lstm = new_lstm(true);
        let inputs = sample_inputs(2, 15);

        let first = lstm.forward(&inputs, false).unwrap();
        assert!(lstm.state().is_none());
        assert_eq!(lstm.forward(&inputs, false).unwrap(), first);

        let trained = lstm.forward(&inputs, true).unwrap();
        assert_eq!(trained, first);

        let state = lstm.state().unwrap();
        assert_eq!(state.len(), 2);
        assert_eq!(state[0].len(), 8);
        assert_eq!(&state[0][..4], first[0].as_slice());

        let continued = lstm.forward(&inputs, false).unwrap();
        assert_ne!(continued, first);
    }

    #[test]
    fn stateless_lstm_ignores_held_state() {
        let mut lstm = new_lstm(false);
        let inputs = sample_inputs(1, 15);
        let before = lstm.forward(&inputs, true).unwrap();

        lstm.set_state(Some(vec![LayerValues::new(vec![0.5; 8])].into()))
            .unwrap();

        assert_eq!(lstm.forward(&inputs, false).unwrap(), before);
    }

    #[test]
    fn lstm_state_can_be_reset() {
        let mut lstm = new_lstm(true);
        let inputs = sample_inputs(1, 15);
        let initial = lstm.forward(&inputs, true).unwrap();

        lstm.set_state(None).unwrap();

        assert_eq!(lstm.forward(&inputs, false).unwrap(), initial);
    }

    #[test]
    fn lstm_rejects_malformed_state() {
        let mut lstm = new_lstm(true);

        let err = lstm
            .set_state(Some(vec![LayerValues::zeros(5)].into()))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LayerError>(),
            Some(LayerError::ShapeMismatch { expected: 8, actual: 5, .. })
        ));

        lstm.set_state(Some(Batch::zeros(3, 8))).unwrap();
        let err = lstm.forward(&sample_inputs(2, 15), false).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LayerError>(),
            Some(LayerError::BatchSizeMismatch { expected: 2, actual: 3, .. })
        ));
    }

    #[test]
    fn lstm_backward_requires_forward() {
        let mut lstm = new_lstm(false);

        let err = lstm.backward(&Batch::zeros(1, 4)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LayerError>(),
            Some(LayerError::MissingForward { .. })
        ));
    }

    #[test]
    fn lstm_input_gradients_match_finite_differences() {
        let mut lstm = new_lstm(false);
        assert_input_gradients(&mut lstm, &sample_inputs(2, 15));
    }

    #[test]
    fn lstm_weight_gradients_match_finite_differences() {
        let mut lstm = new_lstm(false);
        assert_weight_gradients(&mut lstm, &sample_inputs(2, 15));
    }

    #[test]
    fn lstm_sequence_gradients_match_finite_differences() {
        let mut lstm = new_lstm(false).with_return_sequences(true);
        assert_input_gradients(&mut lstm, &sample_inputs(1, 15));
    }

    #[test]
    fn lstm_update_trains_bias() {
        let mut lstm = new_lstm(false);
        lstm.forward(&sample_inputs(2, 15), true).unwrap();
        let deltas: Batch<LayerValues> = (0..2).map(|_| LayerValues::new(vec![1.0; 4])).collect();
        lstm.backward(&deltas).unwrap();

        let gradients = lstm.gradients().unwrap();
        let weights_len = lstm.weights().len();
        lstm.update(&gradients, &|w, g| w - g).unwrap();

        let mean_bias: Vec<NodeValue> = (0..16)
            .map(|j| -(gradients[0][weights_len + j] + gradients[1][weights_len + j]) / 2.0)
            .collect();
        assert_eq!(lstm.bias(), mean_bias.as_slice());
        assert!(lstm.bias().iter().any(|&b| b != 0.0));
    }
}
