pub mod helpers {
    use crate::ml::{
        layers::{Layer, Updatable},
        Batch, LayerValues, NodeValue,
    };

    const EPSILON: NodeValue = 1e-6;

    /// Fixed, uneven coefficients so every output contributes differently to the loss.
    pub fn loss_weights(len: usize) -> LayerValues {
        (0..len)
            .map(|i| ((i * 5 + 3) % 7) as NodeValue / 7.0 - 0.4)
            .collect()
    }

    /// `sum_i dot(c, y_i)`; its derivative with respect to each output is `c`.
    pub fn weighted_loss(outputs: &Batch<LayerValues>) -> NodeValue {
        outputs
            .iter()
            .map(|y| {
                let c = loss_weights(y.len());
                y.iter().zip(c.iter()).map(|(y, c)| y * c).sum::<NodeValue>()
            })
            .sum()
    }

    pub fn loss_deltas(outputs: &Batch<LayerValues>) -> Batch<LayerValues> {
        outputs.iter().map(|y| loss_weights(y.len())).collect()
    }

    fn central_difference(mut loss_at: impl FnMut(NodeValue) -> NodeValue, x: NodeValue) -> NodeValue {
        (loss_at(x + EPSILON) - loss_at(x - EPSILON)) / (2.0 * EPSILON)
    }

    pub fn assert_close(analytic: NodeValue, numeric: NodeValue, what: &str) {
        let tolerance = 1e-5 * (1.0 + numeric.abs());
        assert!(
            (analytic - numeric).abs() < tolerance,
            "{what}: analytic gradient {analytic} differs from numeric {numeric}"
        );
    }

    /// Checks `backward`'s input gradients against central differences of [`weighted_loss`].
    pub fn assert_input_gradients<L: Layer>(layer: &mut L, inputs: &Batch<LayerValues>) {
        let mut expected = vec![];
        for (example_idx, example) in inputs.iter().enumerate() {
            let mut numeric = LayerValues::zeros(example.len());
            for (i, &x) in example.iter().enumerate() {
                numeric[i] = central_difference(
                    |value| {
                        let perturbed: Batch<LayerValues> = inputs
                            .iter()
                            .enumerate()
                            .map(|(idx, example)| {
                                let mut example = example.clone();
                                if idx == example_idx {
                                    example[i] = value;
                                }
                                example
                            })
                            .collect();
                        weighted_loss(&layer.forward(&perturbed, false).unwrap())
                    },
                    x,
                );
            }
            expected.push(numeric);
        }

        let outputs = layer.forward(inputs, true).unwrap();
        let input_gradients = layer.backward(&loss_deltas(&outputs)).unwrap();

        assert_eq!(input_gradients.len(), inputs.len());
        for (actual, expected) in input_gradients.iter().zip(&expected) {
            assert_eq!(actual.len(), expected.len());
            for (i, (&a, &e)) in actual.iter().zip(expected.iter()).enumerate() {
                assert_close(a, e, &format!("input[{i}]"));
            }
        }
    }

    /// Checks the weight slots of the summed per-example gradients against central differences.
    pub fn assert_weight_gradients<L: Updatable>(layer: &mut L, inputs: &Batch<LayerValues>) {
        let weights_len = layer.weights().len();
        let mut expected = LayerValues::zeros(weights_len);
        for i in 0..weights_len {
            let original = layer.weights()[i];
            expected[i] = central_difference(
                |value| {
                    layer.weights_mut()[i] = value;
                    weighted_loss(&layer.forward(inputs, false).unwrap())
                },
                original,
            );
            layer.weights_mut()[i] = original;
        }

        let outputs = layer.forward(inputs, true).unwrap();
        layer.backward(&loss_deltas(&outputs)).unwrap();
        let gradients = layer.gradients().unwrap();

        assert_eq!(gradients.len(), inputs.len());
        for (i, &e) in expected.iter().enumerate() {
            let actual = gradients.iter().map(|g| g[i]).sum::<NodeValue>();
            assert_close(actual, e, &format!("weight[{i}]"));
        }
    }
}
