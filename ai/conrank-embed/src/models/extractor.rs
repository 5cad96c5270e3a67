//! Content feature extraction building blocks
//!
//! Three pieces feed the content-mask model: length-aware averaging of token
//! embeddings (`avg_content`), a relation-conditioned gate over description
//! tokens (`mask_content`), and a stack of 1-D convolutions that collapses a
//! masked description into one fixed-size vector (`ContentExtractor`).
//! Dropout inside the extractor is controlled by an explicit per-call
//! [`Mode`], never by process-wide state.

use crate::EmbeddingError;
use anyhow::Result;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rand::rngs::StdRng;
use rand::{thread_rng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Forward-pass mode. `Train` applies inverted dropout with the configured
/// keep probability; `Eval` is a pure pass-through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
}

/// Mean of the first `len` embedding rows.
///
/// `len == 0` returns the fallback (PAD) vector instead of dividing by
/// zero. Rows past `len` never contribute. A non-finite result is a fatal
/// computation error.
pub fn avg_content(
    rows: ArrayView2<f32>,
    len: usize,
    fallback: ArrayView1<f32>,
    stage: &str,
) -> Result<Array1<f32>> {
    let len = len.min(rows.nrows());
    let out = if len == 0 {
        fallback.to_owned()
    } else {
        let mut sum = Array1::<f32>::zeros(rows.ncols());
        for i in 0..len {
            sum += &rows.row(i);
        }
        sum / len as f32
    };
    ensure_finite(out.view(), stage)?;
    Ok(out)
}

/// Relation-conditioned gate over description tokens.
///
/// Each token row is scaled by `sigmoid(e_i . r / sqrt(dim))`, so tokens
/// aligned with the relation pass through and unrelated tokens are damped.
/// The output keeps the input shape; pad rows stay near zero.
pub fn mask_content(
    rows: ArrayView2<f32>,
    relation: ArrayView1<f32>,
    stage: &str,
) -> Result<Array2<f32>> {
    let dim = rows.ncols() as f32;
    let scale = dim.sqrt().max(1.0);
    let mut out = rows.to_owned();
    for i in 0..out.nrows() {
        let gate = sigmoid(rows.row(i).dot(&relation) / scale);
        out.row_mut(i).mapv_inplace(|v| v * gate);
    }
    ensure_finite2(out.view(), stage)?;
    Ok(out)
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// One 1-D convolution with SAME padding, followed by ReLU.
///
/// The kernel is stored as one tap matrix per window offset; positions
/// outside the sequence contribute nothing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvFilter {
    taps: Vec<Array2<f32>>,
    bias: Array1<f32>,
}

impl ConvFilter {
    fn init(window: usize, in_dim: usize, out_dim: usize, rng: &mut StdRng) -> Self {
        let scale = (2.0 / (in_dim + out_dim) as f32).sqrt();
        let taps = (0..window)
            .map(|_| Array2::from_shape_fn((in_dim, out_dim), |_| rng.gen_range(-scale..scale)))
            .collect();
        Self {
            taps,
            bias: Array1::zeros(out_dim),
        }
    }

    fn apply(&self, input: &Array2<f32>) -> Array2<f32> {
        let n = input.nrows();
        let out_dim = self.bias.len();
        let half = self.taps.len() / 2;
        let mut out = Array2::zeros((n, out_dim));
        for p in 0..n {
            let mut acc = self.bias.clone();
            for (k, tap) in self.taps.iter().enumerate() {
                let q = p + k;
                if q >= half && q - half < n {
                    acc += &input.row(q - half).dot(tap);
                }
            }
            out.row_mut(p).assign(&acc.mapv(|v| v.max(0.0)));
        }
        out
    }
}

/// Stacked convolutional extractor over a masked description sequence.
///
/// Defaults follow the content model: 3 layers of 2 width-3 convolutions
/// each, output channels equal to the word-embedding dimension, inverted
/// dropout (keep 0.85) after every layer at train time, and a max-pool over
/// the valid sequence prefix as the final reduction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentExtractor {
    layers: Vec<Vec<ConvFilter>>,
    dim: usize,
    keep_prob: f32,
}

impl ContentExtractor {
    pub fn new(
        dim: usize,
        num_layers: usize,
        convs_per_layer: usize,
        window: usize,
        keep_prob: f32,
        seed: Option<u64>,
    ) -> Self {
        let mut rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        let layers = (0..num_layers)
            .map(|_| {
                (0..convs_per_layer)
                    .map(|_| ConvFilter::init(window, dim, dim, &mut rng))
                    .collect()
            })
            .collect();
        Self {
            layers,
            dim,
            keep_prob,
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn layers(&self) -> &[Vec<ConvFilter>] {
        &self.layers
    }

    pub fn set_layers(&mut self, layers: Vec<Vec<ConvFilter>>) {
        self.layers = layers;
    }

    /// Run the convolution stack and collapse the valid prefix to one
    /// vector by max-pooling. Empty sequences return the fallback vector.
    pub fn extract(
        &self,
        masked: &Array2<f32>,
        len: usize,
        fallback: ArrayView1<f32>,
        mode: Mode,
    ) -> Result<Array1<f32>> {
        let len = len.min(masked.nrows());
        if len == 0 {
            let out = fallback.to_owned();
            ensure_finite(out.view(), "content extractor")?;
            return Ok(out);
        }

        let mut x = masked.clone();
        for layer in &self.layers {
            for conv in layer {
                x = conv.apply(&x);
            }
            if mode == Mode::Train && self.keep_prob < 1.0 {
                let keep = self.keep_prob;
                let mut rng = thread_rng();
                x.mapv_inplace(|v| {
                    if rng.gen::<f32>() < keep {
                        v / keep
                    } else {
                        0.0
                    }
                });
            }
        }

        let mut out = Array1::from_elem(x.ncols(), f32::NEG_INFINITY);
        for i in 0..len {
            for (j, &v) in x.row(i).iter().enumerate() {
                if v > out[j] {
                    out[j] = v;
                }
            }
        }
        ensure_finite(out.view(), "content extractor")?;
        Ok(out)
    }
}

pub(crate) fn ensure_finite(values: ArrayView1<f32>, stage: &str) -> Result<()> {
    if values.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(EmbeddingError::NonFinite {
            stage: stage.to_string(),
        }
        .into())
    }
}

pub(crate) fn ensure_finite2(values: ArrayView2<f32>, stage: &str) -> Result<()> {
    if values.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(EmbeddingError::NonFinite {
            stage: stage.to_string(),
        }
        .into())
    }
}
