//! Actor and critic contracts, the model container, and model factories.
//!
//! The learner only depends on the two traits below. Network bodies are
//! supplied by a [`ModelFactory`]; the built-in [`MlpFactory`] flattens every
//! observation field into one feature vector and runs fully connected layers.
//!
//! Critics return one value per reward component:
//!
//! ```text
//! critic(obs, action) -> [batch, VALUE_COMPONENTS]
//!                          column 0: value of environment reward
//!                          column 1: value of entropy reward
//! ```

use burn::module::Module;
use burn::nn::{Linear, LinearConfig};
use burn::tensor::activation::relu;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};

use super::distribution::{clamp_log_std, SquashedGaussian};
use super::normalizer::OutputRescale;
use crate::config::ConfigError;
use crate::core::observation::{ObservationBatch, ObservationSchema, SchemaError};

/// Number of value components a critic predicts (reward, entropy).
pub const VALUE_COMPONENTS: usize = 2;

/// Policy network: observation batch to action distribution.
pub trait SACActor<B: Backend>: Module<B> {
    fn forward(&self, obs: &ObservationBatch<B>) -> SquashedGaussian<B>;
}

/// Value network: `(observation, action)` to `[batch, VALUE_COMPONENTS]`.
pub trait SACCritic<B: Backend>: Module<B> {
    fn forward(&self, obs: &ObservationBatch<B>, action: Tensor<B, 2>) -> Tensor<B, 2>;

    /// Rescale the final layer after a return-statistics shift.
    fn rescale_output(self, rescale: &OutputRescale) -> Self;
}

/// One actor and its critic ensemble.
#[derive(Debug, Clone)]
pub struct SACModel<A, C> {
    pub actor: A,
    pub critics: Vec<C>,
}

/// Why a model could not be built.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelError {
    Schema(SchemaError),
    Config(ConfigError),
}

impl std::fmt::Display for ModelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelError::Schema(e) => write!(f, "invalid observation schema: {}", e),
            ModelError::Config(e) => write!(f, "invalid model config: {}", e),
        }
    }
}

impl std::error::Error for ModelError {}

impl From<SchemaError> for ModelError {
    fn from(e: SchemaError) -> Self {
        ModelError::Schema(e)
    }
}

impl From<ConfigError> for ModelError {
    fn from(e: ConfigError) -> Self {
        ModelError::Config(e)
    }
}

/// Builds actor and critics for a given observation schema and action size.
///
/// The schema is validated here, once, rather than on every forward pass.
pub trait ModelFactory<B: Backend> {
    type Actor: SACActor<B>;
    type Critic: SACCritic<B>;

    /// Fresh actor.
    fn actor(
        &self,
        schema: &ObservationSchema,
        action_dim: usize,
        device: &B::Device,
    ) -> Result<Self::Actor, ModelError>;

    /// Fresh critic.
    fn critic(
        &self,
        schema: &ObservationSchema,
        action_dim: usize,
        device: &B::Device,
    ) -> Result<Self::Critic, ModelError>;

    /// Actor plus `num_critics` independently initialized critics.
    fn build(
        &self,
        schema: &ObservationSchema,
        action_dim: usize,
        num_critics: usize,
        device: &B::Device,
    ) -> Result<SACModel<Self::Actor, Self::Critic>, ModelError> {
        let actor = self.actor(schema, action_dim, device)?;
        let critics = (0..num_critics)
            .map(|_| self.critic(schema, action_dim, device))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(SACModel { actor, critics })
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Named network family, resolved to a factory once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelKind {
    /// Fully connected actor and critics over the flattened observation.
    Mlp { hidden_sizes: Vec<usize> },
}

impl Default for ModelKind {
    fn default() -> Self {
        ModelKind::Mlp {
            hidden_sizes: vec![256, 256],
        }
    }
}

impl ModelKind {
    /// Check the family's own parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            ModelKind::Mlp { hidden_sizes } => {
                if hidden_sizes.is_empty() {
                    return Err(ConfigError::InvalidCount {
                        field: "model.hidden_sizes",
                        value: 0,
                    });
                }
                for &size in hidden_sizes {
                    crate::config::positive("model.hidden_sizes", size)?;
                }
                Ok(())
            }
        }
    }

    /// The factory for this family.
    pub fn resolve(&self) -> MlpFactory {
        match self {
            ModelKind::Mlp { hidden_sizes } => MlpFactory::new(hidden_sizes.clone()),
        }
    }
}

// ============================================================================
// MLP
// ============================================================================

fn trunk<B: Backend>(input: usize, hidden: &[usize], device: &B::Device) -> (Vec<Linear<B>>, usize) {
    let mut layers = Vec::with_capacity(hidden.len());
    let mut width = input;
    for &size in hidden {
        layers.push(LinearConfig::new(width, size).init(device));
        width = size;
    }
    (layers, width)
}

fn run_trunk<B: Backend>(layers: &[Linear<B>], mut x: Tensor<B, 2>) -> Tensor<B, 2> {
    for layer in layers {
        x = relu(layer.forward(x));
    }
    x
}

/// Fully connected squashed-Gaussian policy.
#[derive(Module, Debug)]
pub struct MlpActor<B: Backend> {
    trunk: Vec<Linear<B>>,
    mean: Linear<B>,
    log_std: Linear<B>,
}

impl<B: Backend> SACActor<B> for MlpActor<B> {
    fn forward(&self, obs: &ObservationBatch<B>) -> SquashedGaussian<B> {
        let features = run_trunk(&self.trunk, obs.flatten());
        let mean = self.mean.forward(features.clone());
        let log_std = clamp_log_std(self.log_std.forward(features));
        SquashedGaussian::new(mean, log_std)
    }
}

/// Fully connected two-component critic.
#[derive(Module, Debug)]
pub struct MlpCritic<B: Backend> {
    trunk: Vec<Linear<B>>,
    output: Linear<B>,
}

impl<B: Backend> SACCritic<B> for MlpCritic<B> {
    fn forward(&self, obs: &ObservationBatch<B>, action: Tensor<B, 2>) -> Tensor<B, 2> {
        let input = Tensor::cat(vec![obs.flatten(), action], 1);
        self.output.forward(run_trunk(&self.trunk, input))
    }

    fn rescale_output(mut self, rescale: &OutputRescale) -> Self {
        self.output = rescale.apply(self.output);
        self
    }
}

/// Factory for [`MlpActor`] / [`MlpCritic`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MlpFactory {
    hidden_sizes: Vec<usize>,
}

impl MlpFactory {
    pub fn new(hidden_sizes: Vec<usize>) -> Self {
        Self { hidden_sizes }
    }

    fn check(&self, schema: &ObservationSchema, action_dim: usize) -> Result<(), ModelError> {
        schema.validate_self()?;
        crate::config::positive("action_dim", action_dim)?;
        ModelKind::Mlp {
            hidden_sizes: self.hidden_sizes.clone(),
        }
        .validate()?;
        Ok(())
    }
}

impl<B: Backend> ModelFactory<B> for MlpFactory {
    type Actor = MlpActor<B>;
    type Critic = MlpCritic<B>;

    fn actor(
        &self,
        schema: &ObservationSchema,
        action_dim: usize,
        device: &B::Device,
    ) -> Result<MlpActor<B>, ModelError> {
        self.check(schema, action_dim)?;
        let (trunk, width) = trunk(schema.flat_size(), &self.hidden_sizes, device);
        Ok(MlpActor {
            trunk,
            mean: LinearConfig::new(width, action_dim).init(device),
            log_std: LinearConfig::new(width, action_dim).init(device),
        })
    }

    fn critic(
        &self,
        schema: &ObservationSchema,
        action_dim: usize,
        device: &B::Device,
    ) -> Result<MlpCritic<B>, ModelError> {
        self.check(schema, action_dim)?;
        let (trunk, width) = trunk(schema.flat_size() + action_dim, &self.hidden_sizes, device);
        Ok(MlpCritic {
            trunk,
            output: LinearConfig::new(width, VALUE_COMPONENTS).init(device),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::observation::{FieldSpec, ObsField, Observation};
    use burn::backend::NdArray;

    type B = NdArray<f32>;

    fn image_schema() -> ObservationSchema {
        ObservationSchema::new(
            1,
            vec![
                FieldSpec::Vector { dim: 2 },
                FieldSpec::ImageStack {
                    frames: 2,
                    height: 3,
                    width: 3,
                },
            ],
        )
    }

    fn image_obs() -> Observation {
        Observation::new(vec![
            ObsField::Vector(vec![0.5, -0.5]),
            ObsField::ImageStack {
                frames: 2,
                height: 3,
                width: 3,
                data: vec![0.1; 18],
            },
        ])
    }

    #[test]
    fn test_mlp_shapes() {
        let device = Default::default();
        let factory = ModelKind::Mlp {
            hidden_sizes: vec![16, 8],
        }
        .resolve();
        let model: SACModel<MlpActor<B>, MlpCritic<B>> =
            <MlpFactory as ModelFactory<B>>::build(&factory, &image_schema(), 3, 2, &device).unwrap();
        assert_eq!(model.critics.len(), 2);

        let obs = image_obs();
        let batch =
            ObservationBatch::<B>::from_observations(&image_schema(), &[&obs, &obs, &obs], &device)
                .unwrap();
        let policy = model.actor.forward(&batch);
        assert_eq!(policy.mean.dims(), [3, 3]);

        let (action, _) = policy.sample();
        let values = model.critics[0].forward(&batch, action);
        assert_eq!(values.dims(), [3, VALUE_COMPONENTS]);
    }

    #[test]
    fn test_build_validates_schema_once() {
        let device = Default::default();
        let factory = MlpFactory::new(vec![8]);
        let empty = ObservationSchema::new(1, vec![]);
        let result = <MlpFactory as ModelFactory<B>>::build(&factory, &empty, 1, 2, &device);
        assert!(matches!(result, Err(ModelError::Schema(SchemaError::EmptySchema))));

        let result =
            <MlpFactory as ModelFactory<B>>::build(&factory, &ObservationSchema::vector(3), 0, 2, &device);
        assert!(matches!(result, Err(ModelError::Config(_))));
    }

    #[test]
    fn test_model_kind_json() {
        let kind: ModelKind = serde_json::from_str(r#"{"kind": "mlp", "hidden_sizes": [64]}"#).unwrap();
        assert_eq!(
            kind,
            ModelKind::Mlp {
                hidden_sizes: vec![64]
            }
        );
        assert!(ModelKind::Mlp { hidden_sizes: vec![] }.validate().is_err());
    }
}
