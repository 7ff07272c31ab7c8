use clap::Parser;
use serde::{Deserialize, Serialize};

use layers::ml::NodeValue;

#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
#[command(about = "Train a character-level sequence decoder on a text corpus")]
pub struct TrainDecoderConfig {
    #[arg(short = 'l', long, default_value_t = 8)]
    pub sequence_len: usize,

    #[arg(short = 'n', long, default_value_t = 16)]
    pub word_vector_size: usize,

    #[arg(short = 'H', long, default_value_t = 64)]
    pub hidden_size: usize,

    #[arg(short = 'c', long, default_value_t = 500)]
    pub training_rounds: usize,

    #[arg(short = 'b', long, default_value_t = 16)]
    pub batch_size: usize,

    #[arg(short = 'r', long, default_value_t = 0.1)]
    pub train_rate: NodeValue,

    #[arg(short = 'L', long, default_value_t = 50)]
    pub log_interval: usize,

    #[arg(short = 'S', long, default_value = None)]
    #[serde(default)]
    pub seed: Option<u32>,

    #[arg(short = 'i', long, default_value = None)]
    #[serde(default)]
    pub input_txt_path: Option<String>,

    #[arg(short = 'o', long, default_value = None)]
    #[serde(default)]
    pub output_path: Option<String>,

    /// Continue training a model previously written with `--output-path`.
    #[arg(short = 'R', long, default_value = None)]
    #[serde(default)]
    pub resume_path: Option<String>,
}
