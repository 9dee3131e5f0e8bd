//! # Hourglass
//!
//! Stacked hourglass backbone for dense prediction (keypoint heatmaps,
//! junction/line maps) built on candle.
//!
//! The network reduces the input to a quarter of its resolution in a stem,
//! then runs `num_stacks` hourglass modules in sequence. Each hourglass pools
//! down `depth` times and upsamples back, adding a full-resolution skip at
//! every level. Every stack emits a heatmap, and all but the last project
//! their features and heatmap back into the running feature map consumed by
//! the next stack.
//!
//! Parameters come from a [`candle_nn::VarBuilder`]: a `VarMap` for training
//! from scratch or any checkpoint backend for inference. Normalization
//! behaviour is selected per call with [`ExecutionMode`].
//!
//! ```no_run
//! use candle_core::{DType, Device, Tensor};
//! use candle_nn::{VarBuilder, VarMap};
//! use hourglass::{ExecutionMode, HourglassConfig, StackedHourglass};
//!
//! # fn main() -> hourglass::Result<()> {
//! let device = Device::Cpu;
//! let varmap = VarMap::new();
//! let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
//! let net = StackedHourglass::load(vb, &HourglassConfig::standard())?;
//!
//! let image = Tensor::zeros((1, 3, 256, 256), DType::F32, &device)?;
//! let heatmaps = net.forward(&image, ExecutionMode::Evaluation)?;
//! assert_eq!(heatmaps.len(), 2);
//! # Ok(())
//! # }
//! ```

pub mod blocks;
pub mod config;
pub mod error;
pub mod head;
pub mod hourglass;
pub mod mode;
pub mod network;

pub use blocks::{BottleneckBlock, FeatureProjection, ResidualStage, ShortcutProjection, Transform};
pub use config::{BlockKind, HeadKind, HourglassConfig};
pub use error::{HourglassError, Result};
pub use head::{ConvHead, HeadFactory, MultitaskHead};
pub use hourglass::{HourglassModule, Level};
pub use mode::ExecutionMode;
pub use network::{StackedHourglass, StackedOutput, hg};
