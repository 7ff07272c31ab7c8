use std::ops::{Deref, DerefMut};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::LayerError;

#[cfg(not(feature = "short_floats"))]
pub type NodeValue = f64;

#[cfg(feature = "short_floats")]
pub type NodeValue = f32;

/// A single example's flat vector of scalars.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LayerValues(Vec<NodeValue>);

impl<T> From<T> for LayerValues
where
    T: AsRef<[NodeValue]>,
{
    fn from(value: T) -> Self {
        Self(value.as_ref().to_vec())
    }
}

impl FromIterator<NodeValue> for LayerValues {
    fn from_iter<T: IntoIterator<Item = NodeValue>>(iter: T) -> Self {
        LayerValues(iter.into_iter().collect())
    }
}

impl Deref for LayerValues {
    type Target = Vec<NodeValue>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for LayerValues {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl LayerValues {
    pub fn new(inner: Vec<NodeValue>) -> Self {
        Self(inner)
    }

    pub fn zeros(len: usize) -> Self {
        Self(vec![0.0; len])
    }

    pub fn assert_length_equals(&self, expected: usize, context: &'static str) -> Result<()> {
        if self.len() == expected {
            Ok(())
        } else {
            Err(LayerError::ShapeMismatch {
                context,
                expected,
                actual: self.len(),
            }
            .into())
        }
    }
}

/// Ordered, fixed-size collection of per-example values flowing through one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Batch<T>(Vec<T>);

impl<T> Default for Batch<T> {
    fn default() -> Self {
        Self(vec![])
    }
}

impl<T> From<Vec<T>> for Batch<T> {
    fn from(value: Vec<T>) -> Self {
        Self(value)
    }
}

impl<T> FromIterator<T> for Batch<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Batch(iter.into_iter().collect())
    }
}

impl<T> IntoIterator for Batch<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<T> Deref for Batch<T> {
    type Target = [T];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> Batch<T> {
    pub fn new(inner: Vec<T>) -> Self {
        Self(inner)
    }

    pub fn into_inner(self) -> Vec<T> {
        self.0
    }

    pub fn assert_size_equals(&self, expected: usize, context: &'static str) -> Result<()> {
        if self.len() == expected {
            Ok(())
        } else {
            Err(LayerError::BatchSizeMismatch {
                context,
                expected,
                actual: self.len(),
            }
            .into())
        }
    }

    /// Runs `func` over every example, in parallel when the `threadpool` feature is enabled.
    ///
    /// Examples are independent of each other, so `func` must only read shared layer state.
    pub fn try_map<U, F>(&self, func: F) -> Result<Batch<U>>
    where
        T: Sync,
        U: Send,
        F: Fn(usize, &T) -> Result<U> + Sync + Send,
    {
        #[cfg(feature = "threadpool")]
        {
            use rayon::prelude::*;
            let outputs: Result<Vec<U>> = self
                .0
                .par_iter()
                .enumerate()
                .map(|(idx, x)| func(idx, x))
                .collect();
            Ok(Batch(outputs?))
        }

        #[cfg(not(feature = "threadpool"))]
        {
            let outputs: Result<Vec<U>> =
                self.0.iter().enumerate().map(|(idx, x)| func(idx, x)).collect();
            Ok(Batch(outputs?))
        }
    }
}

impl<A, B> Batch<(A, B)> {
    pub fn unzip(self) -> (Batch<A>, Batch<B>) {
        let (a, b): (Vec<A>, Vec<B>) = self.0.into_iter().unzip();
        (Batch(a), Batch(b))
    }
}

impl Batch<LayerValues> {
    pub fn zeros(size: usize, len: usize) -> Self {
        (0..size).map(|_| LayerValues::zeros(len)).collect()
    }

    /// Batches token index sequences as scalar vectors, the input shape an embedding stage expects.
    pub fn from_tokens<T: AsRef<[usize]>>(sequences: &[T]) -> Self {
        sequences
            .iter()
            .map(|tokens| {
                tokens
                    .as_ref()
                    .iter()
                    .map(|&token| token as NodeValue)
                    .collect()
            })
            .collect()
    }

    pub fn assert_example_lengths(&self, expected: usize, context: &'static str) -> Result<()> {
        for example in self.iter() {
            example.assert_length_equals(expected, context)?;
        }
        Ok(())
    }

    /// Per-slot mean across all examples; every example must hold `len` values.
    pub fn mean(&self, len: usize, context: &'static str) -> Result<LayerValues> {
        if self.is_empty() {
            return Err(LayerError::EmptyBatch { context }.into());
        }
        self.assert_example_lengths(len, context)?;

        let mut sum = LayerValues::zeros(len);
        for example in self.iter() {
            sum.iter_mut().zip(example.iter()).for_each(|(s, x)| *s += x);
        }

        let count = self.len() as NodeValue;
        sum.iter_mut().for_each(|s| *s /= count);
        Ok(sum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_can_average_examples() {
        let batch: Batch<LayerValues> =
            vec![LayerValues::new(vec![1.0, 2.0]), LayerValues::new(vec![3.0, 6.0])].into();

        let mean = batch.mean(2, "test").unwrap();
        assert_eq!(mean, LayerValues::new(vec![2.0, 4.0]));
    }

    #[test]
    fn batch_mean_rejects_empty_batches() {
        let batch: Batch<LayerValues> = Batch::default();

        let err = batch.mean(2, "test").unwrap_err();
        assert_eq!(
            err.downcast_ref::<LayerError>(),
            Some(&LayerError::EmptyBatch { context: "test" })
        );
    }

    #[test]
    fn batch_mean_rejects_short_examples() {
        let batch: Batch<LayerValues> =
            vec![LayerValues::new(vec![1.0, 2.0]), LayerValues::new(vec![3.0])].into();

        let err = batch.mean(2, "test").unwrap_err();
        assert_eq!(
            err.downcast_ref::<LayerError>(),
            Some(&LayerError::ShapeMismatch {
                context: "test",
                expected: 2,
                actual: 1
            })
        );
    }

    #[test]
    fn batch_try_map_preserves_example_order() {
        let batch: Batch<usize> = (0..64).collect();
        let doubled = batch.try_map(|idx, x| Ok(idx + x)).unwrap();

        assert_eq!(doubled.len(), 64);
        for (idx, x) in doubled.iter().enumerate() {
            assert_eq!(*x, idx * 2);
        }
    }

    #[test]
    fn batch_can_be_built_from_tokens() {
        let batch = Batch::from_tokens(&[[0, 4, 2], [1, 1, 3]]);

        assert_eq!(batch.len(), 2);
        assert_eq!(batch[1], LayerValues::new(vec![1.0, 1.0, 3.0]));
    }
}
