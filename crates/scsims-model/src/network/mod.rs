//! TabNet network
//!
//! Attentive feature selection over `n_steps` decision steps. Each step picks a
//! sparse mask over the (embedded) input, feeds the masked input through a
//! feature transformer and contributes a ReLU'd decision vector to the output.
//! All parameters, including batch norm running statistics, live in the
//! `VarMap` the network was built from.

pub mod embedding;
pub mod layers;
pub mod sparse;

pub use embedding::{EmbeddingGenerator, ReducingMatrix};
pub use layers::{AttentiveTransformer, FeatTransformer, GhostBatchNorm};

use crate::model_config::HyperParams;
use candle_core::{Result, Tensor};
use candle_nn::{BatchNorm, Linear, Module, ModuleT, VarBuilder};

/// Momentum of the batch norm applied to the raw input
const INITIAL_BN_MOMENTUM: f64 = 0.01;

#[derive(Debug, Clone)]
struct Encoder {
    initial_bn: BatchNorm,
    initial_splitter: FeatTransformer,
    feat_transformers: Vec<FeatTransformer>,
    att_transformers: Vec<AttentiveTransformer>,
    n_d: usize,
    n_a: usize,
    gamma: f64,
    epsilon: f64,
}

/// Output of one pass through the decision steps
struct StepTrace {
    decisions: Vec<Tensor>,
    masks: Vec<Tensor>,
    sparsity: Tensor,
}

impl Encoder {
    fn new(params: &HyperParams, vb: VarBuilder) -> Result<Self> {
        let input_dim = params.post_embed_dim();
        let hidden = params.n_d + params.n_a;

        let initial_bn = candle_nn::batch_norm(
            input_dim,
            layers::bn_config(INITIAL_BN_MOMENTUM),
            vb.pp("initial_bn"),
        )?;

        let mut shared = Vec::with_capacity(params.n_shared);
        for i in 0..params.n_shared {
            let in_dim = if i == 0 { input_dim } else { hidden };
            shared.push(candle_nn::linear_no_bias(
                in_dim,
                2 * hidden,
                vb.pp(format!("shared.{}", i)),
            )?);
        }

        let feat_transformer = |vb: VarBuilder| {
            FeatTransformer::new(
                input_dim,
                hidden,
                &shared,
                params.n_independent,
                params.virtual_batch_size,
                params.momentum,
                vb,
            )
        };

        let initial_splitter = feat_transformer(vb.pp("initial_splitter"))?;
        let mut feat_transformers = Vec::with_capacity(params.n_steps);
        let mut att_transformers = Vec::with_capacity(params.n_steps);
        for step in 0..params.n_steps {
            feat_transformers.push(feat_transformer(
                vb.pp(format!("feat_transformers.{}", step)),
            )?);
            att_transformers.push(AttentiveTransformer::new(
                params.n_a,
                input_dim,
                params.virtual_batch_size,
                params.momentum,
                params.mask_type,
                vb.pp(format!("att_transformers.{}", step)),
            )?);
        }

        Ok(Self {
            initial_bn,
            initial_splitter,
            feat_transformers,
            att_transformers,
            n_d: params.n_d,
            n_a: params.n_a,
            gamma: params.gamma,
            epsilon: params.epsilon,
        })
    }

    fn run(&self, xs: &Tensor, train: bool) -> Result<StepTrace> {
        let xs = self.initial_bn.forward_t(xs, train)?;
        let mut prior = xs.ones_like()?;
        let mut sparsity = Tensor::zeros((), xs.dtype(), xs.device())?;
        let mut att = self
            .initial_splitter
            .forward_t(&xs, train)?
            .narrow(1, self.n_d, self.n_a)?;

        let mut decisions = Vec::with_capacity(self.feat_transformers.len());
        let mut masks = Vec::with_capacity(self.feat_transformers.len());

        for (att_transformer, feat_transformer) in
            self.att_transformers.iter().zip(&self.feat_transformers)
        {
            let mask = att_transformer.forward_t(&prior, &att, train)?;
            let entropy = (&mask * (&mask + self.epsilon)?.log()?)?
                .sum(1)?
                .mean_all()?;
            sparsity = (sparsity + entropy)?;
            prior = (mask.affine(-1.0, self.gamma)? * &prior)?;

            let out = feat_transformer.forward_t(&(&mask * &xs)?, train)?;
            decisions.push(out.narrow(1, 0, self.n_d)?.relu()?);
            att = out.narrow(1, self.n_d, self.n_a)?;
            masks.push(mask);
        }

        let sparsity = (sparsity / self.att_transformers.len() as f64)?;
        Ok(StepTrace {
            decisions,
            masks,
            sparsity,
        })
    }
}

/// TabNet classifier network
#[derive(Debug, Clone)]
pub struct TabNet {
    embedder: EmbeddingGenerator,
    encoder: Encoder,
    final_mapping: Linear,
    training: bool,
}

impl TabNet {
    /// Build the network, registering every parameter under `vb`
    pub fn new(params: &HyperParams, vb: VarBuilder) -> Result<Self> {
        let embedder = EmbeddingGenerator::new(params, vb.pp("embedder"))?;
        let encoder = Encoder::new(params, vb.pp("encoder"))?;
        let final_mapping =
            candle_nn::linear_no_bias(params.n_d, params.output_dim, vb.pp("final_mapping"))?;
        Ok(Self {
            embedder,
            encoder,
            final_mapping,
            training: true,
        })
    }

    /// Class logits `(n, output_dim)` and the scalar sparsity term
    pub fn forward(&self, xs: &Tensor) -> Result<(Tensor, Tensor)> {
        let xs = self.embedder.forward(xs)?;
        let trace = self.encoder.run(&xs, self.training)?;
        let decision = Tensor::stack(&trace.decisions, 0)?.sum(0)?;
        let logits = self.final_mapping.forward(&decision)?;
        Ok((logits, trace.sparsity))
    }

    /// Aggregate attention `(n, post_embed_dim)` weighted by each step's decision
    /// magnitude, plus the raw per-step masks
    pub fn forward_masks(&self, xs: &Tensor) -> Result<(Tensor, Vec<Tensor>)> {
        let xs = self.embedder.forward(xs)?;
        let trace = self.encoder.run(&xs, self.training)?;

        let mut explain = xs.zeros_like()?;
        for (mask, decision) in trace.masks.iter().zip(&trace.decisions) {
            let step_importance = decision.sum_keepdim(1)?;
            explain = (explain + mask.broadcast_mul(&step_importance)?)?;
        }
        Ok((explain, trace.masks))
    }

    pub fn train(&mut self) {
        self.training = true;
    }

    pub fn eval(&mut self) {
        self.training = false;
    }

    pub fn is_training(&self) -> bool {
        self.training
    }
}
