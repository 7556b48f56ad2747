//! TabNet building blocks: ghost batch norm, GLU blocks, feature and attentive transformers

use super::sparse::{entmax15, sparsemax};
use crate::model_config::MaskType;
use candle_core::{Result, Tensor};
use candle_nn::{BatchNorm, BatchNormConfig, Linear, Module, ModuleT, VarBuilder};

/// Batch norm applied independently to chunks of `virtual_batch_size` rows while training
#[derive(Debug, Clone)]
pub struct GhostBatchNorm {
    bn: BatchNorm,
    virtual_batch_size: usize,
}

impl GhostBatchNorm {
    pub fn new(
        dim: usize,
        virtual_batch_size: usize,
        momentum: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        let bn = candle_nn::batch_norm(dim, bn_config(momentum), vb)?;
        Ok(Self {
            bn,
            virtual_batch_size,
        })
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        if !train {
            return self.bn.forward_t(xs, false);
        }
        let n_chunks = xs.dim(0)?.div_ceil(self.virtual_batch_size);
        if n_chunks <= 1 {
            return self.bn.forward_t(xs, true);
        }
        let chunks = xs
            .chunk(n_chunks, 0)?
            .iter()
            .map(|chunk| self.bn.forward_t(chunk, true))
            .collect::<Result<Vec<_>>>()?;
        Tensor::cat(&chunks, 0)
    }
}

pub(crate) fn bn_config(momentum: f64) -> BatchNormConfig {
    BatchNormConfig {
        eps: 1e-5,
        remove_mean: true,
        affine: true,
        momentum,
    }
}

/// Linear → ghost batch norm → gated linear unit
#[derive(Debug, Clone)]
struct GluLayer {
    fc: Linear,
    bn: GhostBatchNorm,
    output_dim: usize,
}

impl GluLayer {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let xs = self.fc.forward(xs)?;
        let xs = self.bn.forward_t(&xs, train)?;
        let value = xs.narrow(1, 0, self.output_dim)?;
        let gate = candle_nn::ops::sigmoid(&xs.narrow(1, self.output_dim, self.output_dim)?)?;
        value * gate
    }
}

/// Stack of GLU layers joined by scaled residual connections
#[derive(Debug, Clone)]
struct GluBlock {
    layers: Vec<GluLayer>,
    first: bool,
}

impl GluBlock {
    /// `shared` supplies the fully connected layers when the block is shared across steps
    #[allow(clippy::too_many_arguments)]
    fn new(
        input_dim: usize,
        output_dim: usize,
        n_glu: usize,
        first: bool,
        shared: Option<&[Linear]>,
        virtual_batch_size: usize,
        momentum: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        let mut layers = Vec::with_capacity(n_glu);
        for i in 0..n_glu {
            let vb_layer = vb.pp(format!("glu_layers.{}", i));
            let fc = match shared {
                Some(fcs) => fcs[i].clone(),
                None => {
                    let in_dim = if i == 0 { input_dim } else { output_dim };
                    candle_nn::linear_no_bias(in_dim, 2 * output_dim, vb_layer.pp("fc"))?
                }
            };
            let bn = GhostBatchNorm::new(
                2 * output_dim,
                virtual_batch_size,
                momentum,
                vb_layer.pp("bn"),
            )?;
            layers.push(GluLayer { fc, bn, output_dim });
        }
        Ok(Self { layers, first })
    }

    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let scale = 0.5f64.sqrt();
        let mut layers = self.layers.iter();
        let mut xs = xs.clone();
        if self.first {
            if let Some(layer) = layers.next() {
                xs = layer.forward_t(&xs, train)?;
            }
        }
        for layer in layers {
            xs = ((&xs + layer.forward_t(&xs, train)?)? * scale)?;
        }
        Ok(xs)
    }
}

/// Shared GLU block followed by a step-specific GLU block
#[derive(Debug, Clone)]
pub struct FeatTransformer {
    shared: Option<GluBlock>,
    specifics: Option<GluBlock>,
}

impl FeatTransformer {
    pub fn new(
        input_dim: usize,
        output_dim: usize,
        shared_layers: &[Linear],
        n_independent: usize,
        virtual_batch_size: usize,
        momentum: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        let shared = if shared_layers.is_empty() {
            None
        } else {
            Some(GluBlock::new(
                input_dim,
                output_dim,
                shared_layers.len(),
                true,
                Some(shared_layers),
                virtual_batch_size,
                momentum,
                vb.pp("shared"),
            )?)
        };

        let specifics = if n_independent == 0 {
            None
        } else {
            let is_first = shared.is_none();
            let spec_input_dim = if is_first { input_dim } else { output_dim };
            Some(GluBlock::new(
                spec_input_dim,
                output_dim,
                n_independent,
                is_first,
                None,
                virtual_batch_size,
                momentum,
                vb.pp("specifics"),
            )?)
        };

        Ok(Self { shared, specifics })
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let xs = match &self.shared {
            Some(block) => block.forward_t(xs, train)?,
            None => xs.clone(),
        };
        match &self.specifics {
            Some(block) => block.forward_t(&xs, train),
            None => Ok(xs),
        }
    }
}

/// Turns the attention features of the previous step into the next feature mask
#[derive(Debug, Clone)]
pub struct AttentiveTransformer {
    fc: Linear,
    bn: GhostBatchNorm,
    mask_type: MaskType,
}

impl AttentiveTransformer {
    pub fn new(
        input_dim: usize,
        group_dim: usize,
        virtual_batch_size: usize,
        momentum: f64,
        mask_type: MaskType,
        vb: VarBuilder,
    ) -> Result<Self> {
        let fc = candle_nn::linear_no_bias(input_dim, group_dim, vb.pp("fc"))?;
        let bn = GhostBatchNorm::new(group_dim, virtual_batch_size, momentum, vb.pp("bn"))?;
        Ok(Self { fc, bn, mask_type })
    }

    pub fn forward_t(&self, priors: &Tensor, processed_feat: &Tensor, train: bool) -> Result<Tensor> {
        let xs = self.fc.forward(processed_feat)?;
        let xs = self.bn.forward_t(&xs, train)?;
        let xs = (xs * priors)?;
        match self.mask_type {
            MaskType::Sparsemax => sparsemax(&xs),
            MaskType::Entmax => entmax15(&xs),
        }
    }
}
