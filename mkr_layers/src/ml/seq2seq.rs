pub use decoder::{builder::DecoderBuilder, layout, Decoder, DecoderConfig, Stage};

pub mod decoder {
    use anyhow::Result;
    use serde::{Deserialize, Serialize};
    use tracing::{debug, instrument};

    use crate::ml::{
        layers::{
            Embedding, FullyConnected, GradientCombinator, Layer, Lstm, Statable, Updatable,
            UpdateRule,
        },
        Batch, LayerError, LayerValues, NodeValue,
    };

    use self::{builder::DecoderBuilder, layout::ParameterLayout};

    /// Structural hyperparameters; enough to rebuild every sub-layer's shape.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct DecoderConfig {
        pub sequence_len: usize,
        pub vocab_size: usize,
        pub word_vector_size: usize,
        pub hidden_size: usize,
        pub stateful_recurrent: bool,
    }

    impl DecoderConfig {
        pub fn output_len(&self) -> usize {
            self.sequence_len * self.vocab_size
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum Stage {
        Embedding,
        Recurrent,
        FullyConnected,
    }

    impl Stage {
        /// Forward order, which is also the order of the flat weight and gradient vectors.
        pub const ORDER: [Stage; 3] = [Stage::Embedding, Stage::Recurrent, Stage::FullyConnected];
    }

    #[derive(Debug, Clone)]
    pub(crate) struct SubLayers {
        pub embedding: Embedding,
        pub recurrent: Lstm,
        pub fully_connected: FullyConnected,
    }

    impl SubLayers {
        pub fn get(&self, stage: Stage) -> &dyn Updatable {
            match stage {
                Stage::Embedding => &self.embedding,
                Stage::Recurrent => &self.recurrent,
                Stage::FullyConnected => &self.fully_connected,
            }
        }

        pub fn get_mut(&mut self, stage: Stage) -> &mut dyn Updatable {
            match stage {
                Stage::Embedding => &mut self.embedding,
                Stage::Recurrent => &mut self.recurrent,
                Stage::FullyConnected => &mut self.fully_connected,
            }
        }
    }

    /// Embedding, LSTM and fully connected stages presented as one updatable layer.
    ///
    /// The decoder owns a flat weight vector laid out as `[embedding, recurrent, fully_connected]`.
    /// That vector is authoritative: it is copied into the sub-layers at the start of every forward
    /// pass and refreshed from them after every update. Gradients follow the same stage order but
    /// use each sub-layer's own gradient length, which includes auxiliary bias terms.
    #[derive(Debug, Clone, Deserialize)]
    #[serde(try_from = "DecoderSnapshot")]
    pub struct Decoder {
        sub_layers: SubLayers,
        layout: ParameterLayout,
        weights: LayerValues,
        config: DecoderConfig,
        batch_size: Option<usize>,
    }

    impl Decoder {
        pub fn new_builder(
            sequence_len: usize,
            vocab_size: usize,
            word_vector_size: usize,
        ) -> DecoderBuilder {
            DecoderBuilder::new(sequence_len, vocab_size, word_vector_size)
        }

        pub(crate) fn from_sub_layers(sub_layers: SubLayers, config: DecoderConfig) -> Result<Self> {
            let layout = ParameterLayout::new(&sub_layers);
            debug!(
                weights_len = layout.weights_len(),
                gradients_len = layout.gradients_len(),
                "built decoder parameter layout"
            );

            let mut decoder = Self {
                weights: LayerValues::zeros(layout.weights_len()),
                sub_layers,
                layout,
                config,
                batch_size: None,
            };
            decoder.pack()?;
            Ok(decoder)
        }

        /// Copies every sub-layer's weights into the flat vector.
        pub fn pack(&mut self) -> Result<()> {
            self.weights
                .assert_length_equals(self.layout.weights_len(), "decoder pack")?;

            for segment in self.layout.segments() {
                let source = self.sub_layers.get(segment.stage).weights();
                if source.len() != segment.weights.len() {
                    return Err(LayerError::ShapeMismatch {
                        context: "decoder pack",
                        expected: segment.weights.len(),
                        actual: source.len(),
                    }
                    .into());
                }
                self.weights[segment.weights.clone()].copy_from_slice(source);
            }
            Ok(())
        }

        /// Copies slices of the flat vector back into the sub-layers.
        pub fn unpack(&mut self) -> Result<()> {
            self.weights
                .assert_length_equals(self.layout.weights_len(), "decoder unpack")?;

            for segment in self.layout.segments() {
                let target = self.sub_layers.get_mut(segment.stage).weights_mut();
                if target.len() != segment.weights.len() {
                    return Err(LayerError::ShapeMismatch {
                        context: "decoder unpack",
                        expected: segment.weights.len(),
                        actual: target.len(),
                    }
                    .into());
                }
                target.copy_from_slice(&self.weights[segment.weights.clone()]);
            }
            Ok(())
        }

        pub fn layout(&self) -> &ParameterLayout {
            &self.layout
        }

        pub fn sub_layer(&self, stage: Stage) -> &dyn Updatable {
            self.sub_layers.get(stage)
        }

        pub fn config(&self) -> &DecoderConfig {
            &self.config
        }

        fn split_gradients(
            &self,
            gradients: &Batch<LayerValues>,
        ) -> Result<Vec<(Stage, Batch<LayerValues>)>> {
            if gradients.is_empty() {
                return Err(LayerError::EmptyBatch {
                    context: "decoder update",
                }
                .into());
            }
            gradients.assert_example_lengths(self.layout.gradients_len(), "decoder update")?;

            let segments = self
                .layout
                .segments()
                .iter()
                .map(|segment| {
                    let batch: Batch<LayerValues> = gradients
                        .iter()
                        .map(|example| LayerValues::from(&example[segment.gradients.clone()]))
                        .collect();
                    (segment.stage, batch)
                })
                .collect::<Vec<_>>();
            Ok(segments)
        }
    }

    impl Layer for Decoder {
        #[instrument(
            level = "debug",
            skip_all,
            fields(batch_size = inputs.len(), is_training = is_training)
        )]
        fn forward(
            &mut self,
            inputs: &Batch<LayerValues>,
            is_training: bool,
        ) -> Result<Batch<LayerValues>> {
            self.batch_size = None;
            self.unpack()?;

            let embeddings = self.sub_layers.embedding.forward(inputs, is_training)?;
            let hidden = self.sub_layers.recurrent.forward(&embeddings, is_training)?;
            let outputs = self.sub_layers.fully_connected.forward(&hidden, is_training)?;

            self.batch_size = Some(inputs.len());
            Ok(outputs)
        }

        #[instrument(level = "debug", skip_all, fields(batch_size = deltas.len()))]
        fn backward(&mut self, deltas: &Batch<LayerValues>) -> Result<Batch<LayerValues>> {
            let batch_size = self.batch_size.ok_or(LayerError::MissingForward {
                context: "decoder backward",
            })?;
            deltas.assert_size_equals(batch_size, "decoder backward")?;
            deltas.assert_example_lengths(self.config.output_len(), "decoder backward deltas")?;

            let hidden_deltas = self.sub_layers.fully_connected.backward(deltas)?;
            let embedding_deltas = self.sub_layers.recurrent.backward(&hidden_deltas)?;
            self.sub_layers.embedding.backward(&embedding_deltas)
        }
    }

    impl Updatable for Decoder {
        fn weights(&self) -> &[NodeValue] {
            &self.weights
        }

        fn weights_mut(&mut self) -> &mut [NodeValue] {
            &mut self.weights
        }

        fn gradient_len(&self) -> usize {
            self.layout.gradients_len()
        }

        fn gradients(&self) -> Result<Batch<LayerValues>> {
            let mut per_stage = vec![];
            for segment in self.layout.segments() {
                let gradients = self.sub_layers.get(segment.stage).gradients()?;
                gradients.assert_example_lengths(segment.gradients.len(), "decoder gradients")?;
                per_stage.push(gradients);
            }

            let batch_size = per_stage.iter().map(|x| x.len()).max().unwrap_or_default();
            for gradients in &per_stage {
                gradients.assert_size_equals(batch_size, "decoder gradients")?;
            }

            let gradients: Batch<LayerValues> = (0..batch_size)
                .map(|idx| {
                    per_stage
                        .iter()
                        .flat_map(|gradients| gradients[idx].iter().copied())
                        .collect::<LayerValues>()
                })
                .collect();
            Ok(gradients)
        }

        fn set_gradients(&mut self, combinator: GradientCombinator<'_>) {
            for stage in Stage::ORDER {
                self.sub_layers.get_mut(stage).set_gradients(combinator);
            }
        }

        #[instrument(level = "debug", skip_all, fields(batch_size = gradients.len()))]
        fn update(&mut self, gradients: &Batch<LayerValues>, rule: UpdateRule<'_>) -> Result<()> {
            let segments = self.split_gradients(gradients)?;

            for (stage, segment_gradients) in segments {
                self.sub_layers.get_mut(stage).update(&segment_gradients, rule)?;
                debug!(?stage, "updated sub-layer");
            }

            self.pack()
        }
    }

    impl Statable for Decoder {
        fn state(&self) -> Option<&Batch<LayerValues>> {
            self.sub_layers.recurrent.state()
        }

        fn set_state(&mut self, state: Option<Batch<LayerValues>>) -> Result<()> {
            self.sub_layers.recurrent.set_state(state)
        }
    }

    #[derive(Serialize)]
    struct DecoderSnapshotRef<'a> {
        config: &'a DecoderConfig,
        weights: &'a LayerValues,
        biases: Vec<&'a [NodeValue]>,
    }

    /// Persisted form of a [`Decoder`]: its hyperparameters, flat weight vector and each stage's
    /// auxiliary parameters in stage order.
    #[derive(Debug, Clone, Deserialize)]
    pub struct DecoderSnapshot {
        pub config: DecoderConfig,
        pub weights: LayerValues,
        pub biases: Vec<LayerValues>,
    }

    impl Serialize for Decoder {
        fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            let biases = Stage::ORDER
                .into_iter()
                .map(|stage| self.sub_layers.get(stage).aux())
                .collect();

            DecoderSnapshotRef {
                config: &self.config,
                weights: &self.weights,
                biases,
            }
            .serialize(serializer)
        }
    }

    impl TryFrom<DecoderSnapshot> for Decoder {
        type Error = anyhow::Error;

        fn try_from(snapshot: DecoderSnapshot) -> Result<Self> {
            let mut decoder = DecoderBuilder::from_config(&snapshot.config)
                .with_zeroed_weights()
                .build()?;

            snapshot
                .weights
                .assert_length_equals(decoder.layout.weights_len(), "decoder snapshot")?;
            decoder.weights = snapshot.weights;
            decoder.unpack()?;

            if snapshot.biases.len() != Stage::ORDER.len() {
                return Err(LayerError::ShapeMismatch {
                    context: "decoder snapshot biases",
                    expected: Stage::ORDER.len(),
                    actual: snapshot.biases.len(),
                }
                .into());
            }
            for (stage, bias) in Stage::ORDER.into_iter().zip(&snapshot.biases) {
                let target = decoder.sub_layers.get_mut(stage).aux_mut();
                bias.assert_length_equals(target.len(), "decoder snapshot biases")?;
                target.copy_from_slice(bias);
            }
            Ok(decoder)
        }
    }

    pub mod layout {
        use std::ops::Range;

        use super::{Stage, SubLayers};

        /// Where one stage lives inside the flat weight and gradient vectors.
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct Segment {
            pub stage: Stage,
            pub weights: Range<usize>,
            pub gradients: Range<usize>,
        }

        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct ParameterLayout {
            segments: Vec<Segment>,
        }

        impl ParameterLayout {
            pub(crate) fn new(sub_layers: &SubLayers) -> Self {
                let mut weights_offset = 0;
                let mut gradients_offset = 0;
                let segments = Stage::ORDER
                    .into_iter()
                    .map(|stage| {
                        let layer = sub_layers.get(stage);
                        let weights = weights_offset..weights_offset + layer.weights().len();
                        let gradients = gradients_offset..gradients_offset + layer.gradient_len();
                        weights_offset = weights.end;
                        gradients_offset = gradients.end;
                        Segment {
                            stage,
                            weights,
                            gradients,
                        }
                    })
                    .collect();

                Self { segments }
            }

            pub fn segments(&self) -> &[Segment] {
                &self.segments
            }

            pub fn segment(&self, stage: Stage) -> Option<&Segment> {
                self.segments.iter().find(|x| x.stage == stage)
            }

            pub fn weights_len(&self) -> usize {
                self.segments.last().map_or(0, |x| x.weights.end)
            }

            pub fn gradients_len(&self) -> usize {
                self.segments.last().map_or(0, |x| x.gradients.end)
            }
        }
    }

    pub mod builder {
        use anyhow::{anyhow, Result};

        use crate::ml::{
            init::Initializer,
            layers::{Embedding, FullyConnected, Lstm},
            NodeValue, RngStrategy,
        };

        use super::{Decoder, DecoderConfig, SubLayers};

        const EMBEDDING_SCALE: NodeValue = 0.01;

        #[derive(Debug, Clone)]
        pub struct DecoderBuilder {
            sequence_len: usize,
            vocab_size: usize,
            word_vector_size: usize,
            hidden_size: usize,
            stateful_recurrent: bool,
            rng: RngStrategy,
            embedding_initializer: Initializer,
            recurrent_initializer: Initializer,
            output_initializer: Initializer,
        }

        impl DecoderBuilder {
            pub fn new(sequence_len: usize, vocab_size: usize, word_vector_size: usize) -> Self {
                Self {
                    sequence_len,
                    vocab_size,
                    word_vector_size,
                    hidden_size: 256,
                    stateful_recurrent: true,
                    rng: Default::default(),
                    embedding_initializer: Initializer::LeCunNormal {
                        scale: EMBEDDING_SCALE,
                    },
                    recurrent_initializer: Initializer::lecun_normal(),
                    output_initializer: Initializer::lecun_normal(),
                }
            }

            pub fn from_config(config: &DecoderConfig) -> Self {
                Self::new(
                    config.sequence_len,
                    config.vocab_size,
                    config.word_vector_size,
                )
                .with_hidden_size(config.hidden_size)
                .with_stateful_recurrent(config.stateful_recurrent)
            }

            pub fn build(self) -> Result<Decoder> {
                if self.sequence_len == 0 {
                    Err(anyhow!("sequence_len must be at least 1"))?;
                }
                if self.vocab_size == 0 {
                    Err(anyhow!("vocab_size must be at least 1"))?;
                }
                if self.word_vector_size == 0 || self.hidden_size == 0 {
                    Err(anyhow!(
                        "word_vector_size={} and hidden_size={} must both be non-zero",
                        self.word_vector_size,
                        self.hidden_size
                    ))?;
                }

                let config = DecoderConfig {
                    sequence_len: self.sequence_len,
                    vocab_size: self.vocab_size,
                    word_vector_size: self.word_vector_size,
                    hidden_size: self.hidden_size,
                    stateful_recurrent: self.stateful_recurrent,
                };

                let embedding = Embedding::new(
                    self.sequence_len,
                    self.vocab_size,
                    self.word_vector_size,
                    &self.embedding_initializer,
                    &self.rng,
                );
                let recurrent = Lstm::new(
                    self.word_vector_size,
                    self.hidden_size,
                    self.sequence_len,
                    self.stateful_recurrent,
                    &self.recurrent_initializer,
                    &self.rng,
                );
                let fully_connected = FullyConnected::new(
                    self.hidden_size,
                    config.output_len(),
                    &self.output_initializer,
                    &self.rng,
                );

                let sub_layers = SubLayers {
                    embedding,
                    recurrent,
                    fully_connected,
                };
                Decoder::from_sub_layers(sub_layers, config)
            }

            pub fn with_hidden_size(mut self, hidden_size: usize) -> Self {
                self.hidden_size = hidden_size;
                self
            }

            pub fn with_stateful_recurrent(mut self, stateful_recurrent: bool) -> Self {
                self.stateful_recurrent = stateful_recurrent;
                self
            }

            pub fn with_rng(mut self, rng: RngStrategy) -> Self {
                self.rng = rng;
                self
            }

            pub fn with_embedding_initializer(mut self, initializer: Initializer) -> Self {
                self.embedding_initializer = initializer;
                self
            }

            pub fn with_recurrent_initializer(mut self, initializer: Initializer) -> Self {
                self.recurrent_initializer = initializer;
                self
            }

            pub fn with_output_initializer(mut self, initializer: Initializer) -> Self {
                self.output_initializer = initializer;
                self
            }

            pub(crate) fn with_zeroed_weights(self) -> Self {
                self.with_embedding_initializer(Initializer::Zero)
                    .with_recurrent_initializer(Initializer::Zero)
                    .with_output_initializer(Initializer::Zero)
            }
        }
    }

}
