use serde::{Deserialize, Serialize};

use crate::ml::{NodeValue, RngStrategy, RNG};

/// Seeds a freshly allocated parameter vector.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Initializer {
    Zero,
    /// Normal samples with standard deviation `scale / sqrt(fan_in)`.
    LeCunNormal { scale: NodeValue },
    Kaiming,
    FullRandom,
}

impl Default for Initializer {
    fn default() -> Self {
        Self::lecun_normal()
    }
}

impl Initializer {
    pub fn lecun_normal() -> Self {
        Self::LeCunNormal { scale: 1.0 }
    }

    pub fn apply<'a>(
        &self,
        values: impl Iterator<Item = &'a mut NodeValue>,
        fan_in: usize,
        rng: &RngStrategy,
    ) {
        use Initializer::*;

        let fan_in = fan_in.max(1) as NodeValue;
        match self {
            Zero => {
                for value in values {
                    *value = 0.0;
                }
            }
            LeCunNormal { scale } => {
                let sigma = fan_in.powf(-0.5) * scale;
                for value in values {
                    *value = rng.rand_normal(0.0, sigma);
                }
            }
            Kaiming => {
                let scale_factor = fan_in.powf(-0.5) * 5.0 / 3.0;
                for value in values {
                    *value = rng.rand_normal(0.0, 1.0) * scale_factor;
                }
            }
            FullRandom => {
                for value in values {
                    *value = (rng.rand() * 2.0) - 1.0;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_initializer_clears_values() {
        let mut values = vec![1.0; 8];
        Initializer::Zero.apply(values.iter_mut(), 4, &RngStrategy::testable(1));

        assert!(values.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn lecun_normal_scales_with_fan_in() {
        let rng = RngStrategy::testable(1234);
        let mut narrow = vec![0.0; 4000];
        let mut wide = vec![0.0; 4000];

        Initializer::lecun_normal().apply(narrow.iter_mut(), 1, &rng);
        Initializer::lecun_normal().apply(wide.iter_mut(), 100, &rng);

        let spread = |values: &[NodeValue]| {
            (values.iter().map(|x| x * x).sum::<NodeValue>() / values.len() as NodeValue).sqrt()
        };
        let (narrow, wide) = (spread(&narrow), spread(&wide));

        assert!((narrow - 1.0).abs() < 0.1, "narrow spread = {narrow}");
        assert!((wide - 0.1).abs() < 0.01, "wide spread = {wide}");
    }

    #[test]
    fn kaiming_applies_tanh_gain() {
        let rng = RngStrategy::testable(99);
        let mut values = vec![0.0; 4000];

        Initializer::Kaiming.apply(values.iter_mut(), 25, &rng);

        let spread =
            (values.iter().map(|x| x * x).sum::<NodeValue>() / values.len() as NodeValue).sqrt();
        let expected = 5.0 / 3.0 / 5.0;
        assert!((spread - expected).abs() < 0.02, "spread = {spread}");
    }

    #[test]
    fn full_random_stays_in_unit_range() {
        let mut values = vec![0.0; 1000];
        Initializer::FullRandom.apply(values.iter_mut(), 4, &RngStrategy::testable(3));

        assert!(values.iter().all(|x| (-1.0..1.0).contains(x)));
    }
}
