//! Optimizer and learning-rate scheduler construction
//!
//! Optimizers are always built fresh from an [`OptimizerSpec`] (and optionally a
//! [`SchedulerSpec`]); nothing here mutates the stored specs, so building twice
//! yields two independent optimizers with identical settings.

use crate::model_config::{OptimizerKind, OptimizerSpec, SchedulerSpec};
use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, SGD};
use scsims_core::{Error, Result};
use std::sync::Arc;
use tracing::{debug, info};

/// Metric the scheduler watches
pub const MONITOR: &str = "train_loss";

/// Object-safe view of a candle optimizer
pub trait ParamOptimizer: Send {
    fn step(&mut self, grads: &GradStore) -> candle_core::Result<()>;
    fn learning_rate(&self) -> f64;
    fn set_learning_rate(&mut self, lr: f64);

    fn backward_step(&mut self, loss: &Tensor) -> candle_core::Result<()> {
        let grads = loss.backward()?;
        self.step(&grads)
    }
}

impl<T: Optimizer + Send> ParamOptimizer for T {
    fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        Optimizer::step(self, grads)
    }

    fn learning_rate(&self) -> f64 {
        Optimizer::learning_rate(self)
    }

    fn set_learning_rate(&mut self, lr: f64) {
        Optimizer::set_learning_rate(self, lr)
    }
}

/// Adjusts an optimizer's learning rate once per epoch
pub trait LrScheduler: Send {
    fn name(&self) -> &str;

    /// `metric` is the epoch value of the monitored quantity, if any
    fn step(&mut self, metric: Option<f64>, optimizer: &mut dyn ParamOptimizer);
}

/// Multiplies the learning rate by `factor` once the monitored value has not
/// improved for more than `patience` epochs. Lower is better.
#[derive(Debug, Clone)]
pub struct ReduceLrOnPlateau {
    factor: f64,
    patience: usize,
    threshold: f64,
    cooldown: usize,
    min_lr: f64,
    best: f64,
    num_bad_epochs: usize,
    cooldown_counter: usize,
}

impl ReduceLrOnPlateau {
    /// Smallest change in learning rate that is applied
    const EPS: f64 = 1e-8;

    pub fn new(factor: f64, patience: usize, threshold: f64, cooldown: usize, min_lr: f64) -> Self {
        Self {
            factor,
            patience,
            threshold,
            cooldown,
            min_lr,
            best: f64::INFINITY,
            num_bad_epochs: 0,
            cooldown_counter: 0,
        }
    }

    fn is_better(&self, value: f64) -> bool {
        value < self.best * (1.0 - self.threshold)
    }
}

impl LrScheduler for ReduceLrOnPlateau {
    fn name(&self) -> &str {
        "reduce_on_plateau"
    }

    fn step(&mut self, metric: Option<f64>, optimizer: &mut dyn ParamOptimizer) {
        let Some(value) = metric else {
            debug!("No monitored value this epoch, plateau scheduler skipped");
            return;
        };

        if self.is_better(value) {
            self.best = value;
            self.num_bad_epochs = 0;
        } else {
            self.num_bad_epochs += 1;
        }

        if self.cooldown_counter > 0 {
            self.cooldown_counter -= 1;
            self.num_bad_epochs = 0;
        }

        if self.num_bad_epochs > self.patience {
            let old_lr = optimizer.learning_rate();
            let new_lr = (old_lr * self.factor).max(self.min_lr);
            if old_lr - new_lr > Self::EPS {
                optimizer.set_learning_rate(new_lr);
                info!(old_lr, new_lr, "Reducing learning rate on plateau");
            }
            self.cooldown_counter = self.cooldown;
            self.num_bad_epochs = 0;
        }
    }
}

/// Multiplies the learning rate by `gamma` every `step_size` epochs
#[derive(Debug, Clone)]
pub struct StepDecay {
    step_size: usize,
    gamma: f64,
    epoch: usize,
}

impl StepDecay {
    pub fn new(step_size: usize, gamma: f64) -> Self {
        Self {
            step_size: step_size.max(1),
            gamma,
            epoch: 0,
        }
    }
}

impl LrScheduler for StepDecay {
    fn name(&self) -> &str {
        "step_decay"
    }

    fn step(&mut self, _metric: Option<f64>, optimizer: &mut dyn ParamOptimizer) {
        self.epoch += 1;
        if self.epoch % self.step_size == 0 {
            let lr = optimizer.learning_rate() * self.gamma;
            optimizer.set_learning_rate(lr);
            debug!(epoch = self.epoch, lr, "Step decay");
        }
    }
}

/// Builds a custom optimizer over the network variables
pub type OptimizerFactory =
    Arc<dyn Fn(Vec<Var>, &OptimizerSpec) -> Result<Box<dyn ParamOptimizer>> + Send + Sync>;

/// Builds a custom scheduler from the (optional) scheduler settings
pub type SchedulerFactory =
    Arc<dyn Fn(Option<&SchedulerSpec>) -> Result<Box<dyn LrScheduler>> + Send + Sync>;

/// Result of optimizer configuration
pub struct OptimizerConfig {
    pub optimizer: Box<dyn ParamOptimizer>,
    pub lr_scheduler: Option<Box<dyn LrScheduler>>,
    /// Set whenever a scheduler is present
    pub monitor: Option<String>,
}

impl std::fmt::Debug for OptimizerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptimizerConfig")
            .field("learning_rate", &self.optimizer.learning_rate())
            .field("lr_scheduler", &self.lr_scheduler.as_ref().map(|s| s.name()))
            .field("monitor", &self.monitor)
            .finish()
    }
}

/// Build one of the built-in optimizers
pub fn build_optimizer(vars: Vec<Var>, spec: &OptimizerSpec) -> Result<Box<dyn ParamOptimizer>> {
    match spec.optimizer {
        OptimizerKind::AdamW => {
            let params = ParamsAdamW {
                lr: spec.lr,
                beta1: spec.beta1,
                beta2: spec.beta2,
                eps: spec.eps,
                weight_decay: spec.weight_decay,
            };
            Ok(Box::new(AdamW::new(vars, params)?))
        }
        OptimizerKind::Sgd => {
            if spec.weight_decay != 0.0 {
                debug!(
                    weight_decay = spec.weight_decay,
                    "SGD ignores weight decay"
                );
            }
            Ok(Box::new(SGD::new(vars, spec.lr)?))
        }
    }
}

/// Build one of the built-in schedulers
pub fn build_scheduler(spec: &SchedulerSpec) -> Box<dyn LrScheduler> {
    match spec {
        SchedulerSpec::ReduceOnPlateau {
            factor,
            patience,
            threshold,
            cooldown,
            min_lr,
        } => Box::new(ReduceLrOnPlateau::new(
            *factor, *patience, *threshold, *cooldown, *min_lr,
        )),
        SchedulerSpec::StepDecay { step_size, gamma } => {
            Box::new(StepDecay::new(*step_size, *gamma))
        }
    }
}

/// Assemble optimizer, scheduler and monitor from specs and optional factories
pub fn build_optimizers(
    vars: Vec<Var>,
    optim: &OptimizerSpec,
    scheduler: Option<&SchedulerSpec>,
    optimizer_factory: Option<&OptimizerFactory>,
    scheduler_factory: Option<&SchedulerFactory>,
) -> Result<OptimizerConfig> {
    if vars.is_empty() {
        return Err(Error::model("Cannot build an optimizer without parameters"));
    }

    let optimizer = match optimizer_factory {
        Some(factory) => factory(vars, optim)?,
        None => build_optimizer(vars, optim)?,
    };

    let lr_scheduler = match (scheduler_factory, scheduler) {
        (Some(factory), spec) => Some(factory(spec)?),
        (None, Some(spec)) => Some(build_scheduler(spec)),
        (None, None) => None,
    };

    let monitor = lr_scheduler.as_ref().map(|_| MONITOR.to_string());
    debug!(
        lr = optimizer.learning_rate(),
        scheduler = lr_scheduler.as_ref().map(|s| s.name()),
        "Configured optimizer"
    );

    Ok(OptimizerConfig {
        optimizer,
        lr_scheduler,
        monitor,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn vars() -> Vec<Var> {
        vec![Var::zeros((2, 2), DType::F32, &Device::Cpu).unwrap()]
    }

    #[test]
    fn test_plateau_reduces_after_patience() {
        let mut optimizer = build_optimizer(vars(), &OptimizerSpec::default()).unwrap();
        let mut scheduler = ReduceLrOnPlateau::new(0.5, 2, 1e-4, 0, 0.0);

        scheduler.step(Some(1.0), optimizer.as_mut());
        for _ in 0..2 {
            scheduler.step(Some(1.0), optimizer.as_mut());
            assert!((optimizer.learning_rate() - 1e-3).abs() < 1e-12);
        }
        // third bad epoch exceeds patience
        scheduler.step(Some(1.0), optimizer.as_mut());
        assert!((optimizer.learning_rate() - 5e-4).abs() < 1e-12);
    }

    #[test]
    fn test_plateau_respects_min_lr_and_cooldown() {
        let spec = OptimizerSpec {
            lr: 0.1,
            ..OptimizerSpec::default()
        };
        let mut optimizer = build_optimizer(vars(), &spec).unwrap();
        let mut scheduler = ReduceLrOnPlateau::new(0.1, 0, 0.0, 1, 0.05);

        scheduler.step(Some(1.0), optimizer.as_mut());
        scheduler.step(Some(1.0), optimizer.as_mut());
        assert!((optimizer.learning_rate() - 0.05).abs() < 1e-12);

        // cooldown swallows the next bad epoch
        let mut optimizer = build_optimizer(vars(), &spec).unwrap();
        let mut scheduler = ReduceLrOnPlateau::new(0.5, 0, 0.0, 1, 0.0);
        scheduler.step(Some(1.0), optimizer.as_mut());
        scheduler.step(Some(1.0), optimizer.as_mut());
        assert!((optimizer.learning_rate() - 0.05).abs() < 1e-12);
        scheduler.step(Some(1.0), optimizer.as_mut());
        assert!((optimizer.learning_rate() - 0.05).abs() < 1e-12);
        scheduler.step(Some(1.0), optimizer.as_mut());
        assert!((optimizer.learning_rate() - 0.025).abs() < 1e-12);
    }

    #[test]
    fn test_step_decay() {
        let mut optimizer = build_optimizer(vars(), &OptimizerSpec::default()).unwrap();
        let mut scheduler = StepDecay::new(2, 0.1);
        scheduler.step(None, optimizer.as_mut());
        assert!((optimizer.learning_rate() - 1e-3).abs() < 1e-12);
        scheduler.step(None, optimizer.as_mut());
        assert!((optimizer.learning_rate() - 1e-4).abs() < 1e-12);
    }

    #[test]
    fn test_build_optimizers_monitor() {
        let with_scheduler = build_optimizers(
            vars(),
            &OptimizerSpec::default(),
            Some(&SchedulerSpec::default()),
            None,
            None,
        )
        .unwrap();
        assert_eq!(with_scheduler.monitor.as_deref(), Some(MONITOR));

        let alone = build_optimizers(vars(), &OptimizerSpec::default(), None, None, None).unwrap();
        assert!(alone.lr_scheduler.is_none());
        assert!(alone.monitor.is_none());
    }

    #[test]
    fn test_optimizer_factory_receives_spec() {
        let factory: OptimizerFactory = Arc::new(|vars: Vec<Var>, spec: &OptimizerSpec| {
            Ok(Box::new(SGD::new(vars, spec.lr * 10.0)?) as Box<dyn ParamOptimizer>)
        });
        let config =
            build_optimizers(vars(), &OptimizerSpec::default(), None, Some(&factory), None)
                .unwrap();
        assert!((config.optimizer.learning_rate() - 1e-2).abs() < 1e-12);
    }

    #[test]
    fn test_empty_vars_rejected() {
        let err = build_optimizers(Vec::new(), &OptimizerSpec::default(), None, None, None)
            .unwrap_err();
        assert!(err.to_string().contains("without parameters"));
    }
}
