//! Observation representation shared by workers and the trainer.
//!
//! An observation is an ordered list of fields, each either a flat feature
//! vector or a stack of image frames. The layout is fixed per deployment by an
//! [`ObservationSchema`], which carries a version number so that processes
//! built against different layouts can be told apart.
//!
//! ```text
//! Observation { fields: [Vector(speed, gear, rpm), ImageStack(4 x 64 x 64), Vector(prev actions)] }
//!                          │                          │                          │
//!                          ▼                          ▼                          ▼
//! ObservationBatch   [batch, 3]              [batch, 4, 64, 64]           [batch, 6]
//! ```
//!
//! The schema is checked once when a model is built ([`ObservationSchema::validate_self`])
//! and at the worker boundary for every observation the environment returns
//! ([`ObservationSchema::check`]).

use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};

// ============================================================================
// Schema
// ============================================================================

/// Shape of a single observation field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldSpec {
    /// Flat feature vector of `dim` values.
    Vector { dim: usize },
    /// Stack of `frames` grayscale images of `height x width`.
    ImageStack {
        frames: usize,
        height: usize,
        width: usize,
    },
}

impl FieldSpec {
    /// Number of scalar values in this field.
    pub fn numel(&self) -> usize {
        match *self {
            FieldSpec::Vector { dim } => dim,
            FieldSpec::ImageStack {
                frames,
                height,
                width,
            } => frames * height * width,
        }
    }
}

/// Fixed, versioned layout of observations for one deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservationSchema {
    /// Layout version. Bump whenever `fields` changes.
    pub version: u32,
    /// Ordered field layout.
    pub fields: Vec<FieldSpec>,
}

impl ObservationSchema {
    /// Create a schema from explicit fields.
    pub fn new(version: u32, fields: Vec<FieldSpec>) -> Self {
        Self { version, fields }
    }

    /// Schema with a single flat vector field.
    pub fn vector(dim: usize) -> Self {
        Self::new(1, vec![FieldSpec::Vector { dim }])
    }

    /// Total number of scalars once every field is flattened.
    pub fn flat_size(&self) -> usize {
        self.fields.iter().map(FieldSpec::numel).sum()
    }

    /// Check the schema itself is usable (non-empty, no zero-sized fields).
    pub fn validate_self(&self) -> Result<(), SchemaError> {
        if self.fields.is_empty() {
            return Err(SchemaError::EmptySchema);
        }
        for (index, field) in self.fields.iter().enumerate() {
            if field.numel() == 0 {
                return Err(SchemaError::ZeroSizedField { index });
            }
        }
        Ok(())
    }

    /// Check an observation matches this schema field by field.
    pub fn check(&self, obs: &Observation) -> Result<(), SchemaError> {
        if obs.fields.len() != self.fields.len() {
            return Err(SchemaError::FieldCount {
                expected: self.fields.len(),
                found: obs.fields.len(),
            });
        }

        for (index, (spec, field)) in self.fields.iter().zip(&obs.fields).enumerate() {
            match (*spec, field) {
                (FieldSpec::Vector { dim }, ObsField::Vector(values)) => {
                    if values.len() != dim {
                        return Err(SchemaError::VectorDim {
                            index,
                            expected: dim,
                            found: values.len(),
                        });
                    }
                }
                (
                    FieldSpec::ImageStack {
                        frames,
                        height,
                        width,
                    },
                    ObsField::ImageStack {
                        frames: f,
                        height: h,
                        width: w,
                        data,
                    },
                ) => {
                    if (frames, height, width) != (*f, *h, *w) {
                        return Err(SchemaError::ImageShape {
                            index,
                            expected: [frames, height, width],
                            found: [*f, *h, *w],
                        });
                    }
                    if data.len() != spec.numel() {
                        return Err(SchemaError::ImageData {
                            index,
                            expected: spec.numel(),
                            found: data.len(),
                        });
                    }
                }
                _ => return Err(SchemaError::FieldKind { index }),
            }
        }
        Ok(())
    }
}

/// Observation/schema disagreement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    /// Schema has no fields.
    EmptySchema,
    /// Schema field has zero elements.
    ZeroSizedField { index: usize },
    /// Wrong number of fields.
    FieldCount { expected: usize, found: usize },
    /// Field is a vector where an image stack is expected, or vice versa.
    FieldKind { index: usize },
    /// Vector field has the wrong length.
    VectorDim {
        index: usize,
        expected: usize,
        found: usize,
    },
    /// Image stack declares the wrong shape.
    ImageShape {
        index: usize,
        expected: [usize; 3],
        found: [usize; 3],
    },
    /// Image stack data length disagrees with its shape.
    ImageData {
        index: usize,
        expected: usize,
        found: usize,
    },
}

impl std::fmt::Display for SchemaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchemaError::EmptySchema => write!(f, "observation schema has no fields"),
            SchemaError::ZeroSizedField { index } => {
                write!(f, "observation schema field {} has no elements", index)
            }
            SchemaError::FieldCount { expected, found } => {
                write!(f, "expected {} observation fields, got {}", expected, found)
            }
            SchemaError::FieldKind { index } => {
                write!(f, "observation field {} has the wrong kind", index)
            }
            SchemaError::VectorDim {
                index,
                expected,
                found,
            } => write!(
                f,
                "observation field {}: expected vector of {}, got {}",
                index, expected, found
            ),
            SchemaError::ImageShape {
                index,
                expected,
                found,
            } => write!(
                f,
                "observation field {}: expected image stack {:?}, got {:?}",
                index, expected, found
            ),
            SchemaError::ImageData {
                index,
                expected,
                found,
            } => write!(
                f,
                "observation field {}: expected {} pixels, got {}",
                index, expected, found
            ),
        }
    }
}

impl std::error::Error for SchemaError {}

// ============================================================================
// Observation
// ============================================================================

/// One observation field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ObsField {
    /// Flat feature vector.
    Vector(Vec<f32>),
    /// Frame stack stored row-major as `[frames, height, width]`.
    ImageStack {
        frames: usize,
        height: usize,
        width: usize,
        data: Vec<f32>,
    },
}

impl ObsField {
    fn values(&self) -> &[f32] {
        match self {
            ObsField::Vector(values) => values,
            ObsField::ImageStack { data, .. } => data,
        }
    }
}

/// A single observation, laid out according to an [`ObservationSchema`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub fields: Vec<ObsField>,
}

impl Observation {
    /// Create an observation from fields.
    pub fn new(fields: Vec<ObsField>) -> Self {
        Self { fields }
    }

    /// Observation made of one vector field.
    pub fn vector(values: Vec<f32>) -> Self {
        Self::new(vec![ObsField::Vector(values)])
    }

    /// All fields concatenated into one flat vector.
    pub fn flat(&self) -> Vec<f32> {
        let mut out = Vec::new();
        for field in &self.fields {
            out.extend_from_slice(field.values());
        }
        out
    }
}

// ============================================================================
// Batched tensors
// ============================================================================

/// One observation field stacked over a batch.
#[derive(Debug, Clone)]
pub enum FieldTensor<B: Backend> {
    /// `[batch, dim]`
    Vector(Tensor<B, 2>),
    /// `[batch, frames, height, width]`
    ImageStack(Tensor<B, 4>),
}

/// A batch of observations as tensors, one tensor per schema field.
#[derive(Debug, Clone)]
pub struct ObservationBatch<B: Backend> {
    pub fields: Vec<FieldTensor<B>>,
    batch_size: usize,
}

impl<B: Backend> ObservationBatch<B> {
    /// Stack observations into per-field tensors.
    ///
    /// Every observation is checked against `schema` first; a mismatch leaves
    /// nothing allocated on the device.
    pub fn from_observations(
        schema: &ObservationSchema,
        observations: &[&Observation],
        device: &B::Device,
    ) -> Result<Self, SchemaError> {
        for obs in observations {
            schema.check(obs)?;
        }

        let batch_size = observations.len();
        let fields = schema
            .fields
            .iter()
            .enumerate()
            .map(|(index, spec)| {
                let mut data = Vec::with_capacity(batch_size * spec.numel());
                for obs in observations {
                    data.extend_from_slice(obs.fields[index].values());
                }
                let flat = Tensor::<B, 1>::from_floats(data.as_slice(), device);
                match *spec {
                    FieldSpec::Vector { dim } => FieldTensor::Vector(flat.reshape([batch_size, dim])),
                    FieldSpec::ImageStack {
                        frames,
                        height,
                        width,
                    } => FieldTensor::ImageStack(flat.reshape([batch_size, frames, height, width])),
                }
            })
            .collect();

        Ok(Self { fields, batch_size })
    }

    /// Number of observations in the batch.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// All fields flattened and concatenated: `[batch, flat_size]`.
    pub fn flatten(&self) -> Tensor<B, 2> {
        let parts: Vec<Tensor<B, 2>> = self
            .fields
            .iter()
            .map(|field| match field {
                FieldTensor::Vector(t) => t.clone(),
                FieldTensor::ImageStack(t) => t.clone().flatten::<2>(1, 3),
            })
            .collect();
        Tensor::cat(parts, 1)
    }
}

impl<B: AutodiffBackend> ObservationBatch<B> {
    /// The same batch on the inner (non-autodiff) backend.
    pub fn inner(&self) -> ObservationBatch<B::InnerBackend> {
        let fields = self
            .fields
            .iter()
            .map(|field| match field {
                FieldTensor::Vector(t) => FieldTensor::Vector(t.clone().inner()),
                FieldTensor::ImageStack(t) => FieldTensor::ImageStack(t.clone().inner()),
            })
            .collect();
        ObservationBatch {
            fields,
            batch_size: self.batch_size,
        }
    }
}
