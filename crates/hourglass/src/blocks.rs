// Residual building blocks shared by the stem, the hourglass branches and
// the per-stack post-processing.

use {
    crate::{
        error::{HourglassError, Result},
        mode::ExecutionMode,
    },
    candle_core::{DType, Device, ModuleT, Tensor},
    candle_nn::{
        BatchNorm, Conv2d, Conv2dConfig, VarBuilder, batch_norm, conv2d, conv2d_no_bias,
    },
    std::fmt,
};

const BN_EPS: f64 = 1e-5;

/// Shape-to-shape capability used for pluggable collaborators
/// (shortcut projections and scoring heads).
pub trait Transform: fmt::Debug + Send + Sync {
    fn transform(&self, xs: &Tensor, mode: ExecutionMode) -> Result<Tensor>;
}

/// Splits a `[batch, channels, height, width]` tensor's shape, rejecting
/// any other rank as invalid input.
pub(crate) fn dims4(xs: &Tensor) -> Result<(usize, usize, usize, usize)> {
    match xs.dims() {
        &[b, c, h, w] => Ok((b, c, h, w)),
        dims => Err(HourglassError::InvalidInput(format!(
            "expected a [batch, channels, height, width] tensor, got shape {dims:?}"
        ))),
    }
}

/// Runs `transform` once on zeros of shape `input` and checks that it
/// produces `expected`.
pub(crate) fn probe_transform(
    transform: &dyn Transform,
    what: &str,
    input: (usize, usize, usize, usize),
    expected: &[usize],
    dtype: DType,
    device: &Device,
) -> Result<()> {
    let probe = Tensor::zeros(input, dtype, device)?;
    let output = transform
        .transform(&probe, ExecutionMode::Evaluation)
        .map_err(|e| HourglassError::InvalidConfig(format!("{what} rejected probe input: {e}")))?;
    if output.dims() != expected {
        return Err(HourglassError::InvalidConfig(format!(
            "{what} maps {:?} to {:?}, expected {:?}",
            probe.dims(),
            output.dims(),
            expected
        )));
    }
    Ok(())
}

/// 2x2 max pooling with stride 2.
pub(crate) fn max_pool2x(xs: &Tensor) -> Result<Tensor> {
    Ok(xs.max_pool2d(2)?)
}

/// Nearest-neighbour upsampling by an integer factor.
pub(crate) fn upsample_nearest(xs: &Tensor, scale_factor: usize) -> Result<Tensor> {
    let (_b, _c, h, w) = dims4(xs)?;
    Ok(xs.upsample_nearest2d(h * scale_factor, w * scale_factor)?)
}

/// Default shortcut projection: strided 1x1 convolution.
#[derive(Debug)]
pub struct ShortcutProjection {
    conv: Conv2d,
}

impl ShortcutProjection {
    pub fn load(
        vb: VarBuilder,
        in_channels: usize,
        out_channels: usize,
        stride: usize,
    ) -> Result<Self> {
        let conv = conv2d(
            in_channels,
            out_channels,
            1,
            Conv2dConfig {
                stride,
                ..Default::default()
            },
            vb,
        )?;
        Ok(Self { conv })
    }
}

impl Transform for ShortcutProjection {
    fn transform(&self, xs: &Tensor, _mode: ExecutionMode) -> Result<Tensor> {
        Ok(xs.apply(&self.conv)?)
    }
}

/// Pre-activation bottleneck: three `bn -> relu -> conv` stages
/// (1x1 narrow, 3x3 strided, 1x1 expand) plus a residual shortcut.
#[derive(Debug)]
pub struct BottleneckBlock {
    bn1: BatchNorm,
    conv1: Conv2d,
    bn2: BatchNorm,
    conv2: Conv2d,
    bn3: BatchNorm,
    conv3: Conv2d,
    downsample: Option<Box<dyn Transform>>,
    in_channels: usize,
    planes: usize,
    stride: usize,
}

impl BottleneckBlock {
    pub const EXPANSION: usize = 2;

    /// `downsample` is required whenever the identity cannot serve as the
    /// shortcut (`stride != 1` or `in_channels != 2 * planes`).
    pub fn load(
        vb: VarBuilder,
        in_channels: usize,
        planes: usize,
        stride: usize,
        downsample: Option<Box<dyn Transform>>,
    ) -> Result<Self> {
        if in_channels == 0 || planes == 0 || stride == 0 {
            return Err(HourglassError::InvalidConfig(format!(
                "bottleneck needs positive sizes, got in_channels={in_channels} planes={planes} stride={stride}"
            )));
        }

        let out_channels = planes * Self::EXPANSION;
        match &downsample {
            None if stride != 1 || in_channels != out_channels => {
                return Err(HourglassError::InvalidConfig(format!(
                    "bottleneck {in_channels} -> {out_channels} with stride {stride} needs a downsample projection"
                )));
            }
            Some(projection) => {
                let side = 8;
                let out_side = (side - 1) / stride + 1;
                probe_transform(
                    projection.as_ref(),
                    "downsample",
                    (1, in_channels, side, side),
                    &[1, out_channels, out_side, out_side],
                    vb.dtype(),
                    vb.device(),
                )?;
            }
            None => {}
        }

        let bn1 = batch_norm(in_channels, BN_EPS, vb.pp("bn1"))?;
        let conv1 = conv2d_no_bias(
            in_channels,
            planes,
            1,
            Conv2dConfig::default(),
            vb.pp("conv1"),
        )?;
        let bn2 = batch_norm(planes, BN_EPS, vb.pp("bn2"))?;
        let conv2 = conv2d_no_bias(
            planes,
            planes,
            3,
            Conv2dConfig {
                stride,
                padding: 1,
                ..Default::default()
            },
            vb.pp("conv2"),
        )?;
        let bn3 = batch_norm(planes, BN_EPS, vb.pp("bn3"))?;
        let conv3 = conv2d_no_bias(
            planes,
            out_channels,
            1,
            Conv2dConfig::default(),
            vb.pp("conv3"),
        )?;

        Ok(Self {
            bn1,
            conv1,
            bn2,
            conv2,
            bn3,
            conv3,
            downsample,
            in_channels,
            planes,
            stride,
        })
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.planes * Self::EXPANSION
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn forward(&self, xs: &Tensor, mode: ExecutionMode) -> Result<Tensor> {
        let (_b, c, _h, _w) = dims4(xs)?;
        if c != self.in_channels {
            return Err(HourglassError::ChannelMismatch {
                expected: self.in_channels,
                actual: c,
            });
        }

        let train = mode.is_training();
        let out = xs.apply_t(&self.bn1, train)?.relu()?.apply(&self.conv1)?;
        let out = out.apply_t(&self.bn2, train)?.relu()?.apply(&self.conv2)?;
        let out = out.apply_t(&self.bn3, train)?.relu()?.apply(&self.conv3)?;

        let residual = match &self.downsample {
            Some(projection) => projection.transform(xs, mode)?,
            None => xs.clone(),
        };
        Ok((out + residual)?)
    }
}

impl ModuleT for BottleneckBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        Ok(self.forward(xs, train.into())?)
    }
}

/// A run of bottleneck blocks at one width. Only the first block may
/// project its shortcut; the rest keep `2 * planes` channels.
#[derive(Debug)]
pub struct ResidualStage {
    blocks: Vec<BottleneckBlock>,
}

impl ResidualStage {
    pub fn load(
        vb: VarBuilder,
        in_channels: usize,
        planes: usize,
        num_blocks: usize,
        stride: usize,
    ) -> Result<Self> {
        if num_blocks == 0 {
            return Err(HourglassError::InvalidConfig(
                "residual stage needs at least one block".to_string(),
            ));
        }

        let out_channels = planes * BottleneckBlock::EXPANSION;
        let downsample: Option<Box<dyn Transform>> = if stride != 1 || in_channels != out_channels
        {
            Some(Box::new(ShortcutProjection::load(
                vb.pp("0.downsample"),
                in_channels,
                out_channels,
                stride,
            )?))
        } else {
            None
        };

        let mut blocks = Vec::with_capacity(num_blocks);
        blocks.push(BottleneckBlock::load(
            vb.pp("0"),
            in_channels,
            planes,
            stride,
            downsample,
        )?);
        for i in 1..num_blocks {
            blocks.push(BottleneckBlock::load(
                vb.pp(format!("{i}")),
                out_channels,
                planes,
                1,
                None,
            )?);
        }

        Ok(Self { blocks })
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn out_channels(&self) -> usize {
        self.blocks.last().map_or(0, BottleneckBlock::out_channels)
    }

    pub fn forward(&self, xs: &Tensor, mode: ExecutionMode) -> Result<Tensor> {
        let mut xs = xs.clone();
        for block in &self.blocks {
            xs = block.forward(&xs, mode)?;
        }
        Ok(xs)
    }
}

/// Channel-preserving 1x1 conv + BatchNorm + ReLU applied after each
/// stack's residual post-processing.
#[derive(Debug)]
pub struct FeatureProjection {
    conv: Conv2d,
    bn: BatchNorm,
}

impl FeatureProjection {
    pub fn load(vb: VarBuilder, channels: usize) -> Result<Self> {
        let conv = conv2d(channels, channels, 1, Conv2dConfig::default(), vb.pp("conv"))?;
        let bn = batch_norm(channels, BN_EPS, vb.pp("bn"))?;
        Ok(Self { conv, bn })
    }

    pub fn forward(&self, xs: &Tensor, mode: ExecutionMode) -> Result<Tensor> {
        Ok(xs
            .apply(&self.conv)?
            .apply_t(&self.bn, mode.is_training())?
            .relu()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor};
    use candle_nn::{VarBuilder, VarMap};

    #[derive(Debug)]
    struct Passthrough;

    impl Transform for Passthrough {
        fn transform(&self, xs: &Tensor, _mode: ExecutionMode) -> Result<Tensor> {
            Ok(xs.clone())
        }
    }

    #[test]
    fn test_bottleneck_identity_shortcut_shape() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let block = BottleneckBlock::load(vb.pp("block"), 64, 32, 1, None).unwrap();
        let input = Tensor::randn(0f32, 1f32, (2, 64, 16, 16), &device).unwrap();
        let output = block.forward(&input, ExecutionMode::Evaluation).unwrap();
        assert_eq!(output.dims(), &[2, 64, 16, 16]);
    }

    #[test]
    fn test_bottleneck_expands_channels() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let projection = ShortcutProjection::load(vb.pp("block.downsample"), 3, 16, 1).unwrap();
        let block =
            BottleneckBlock::load(vb.pp("block"), 3, 8, 1, Some(Box::new(projection))).unwrap();
        let input = Tensor::randn(0f32, 1f32, (1, 3, 16, 16), &device).unwrap();
        let output = block.forward(&input, ExecutionMode::Evaluation).unwrap();
        assert_eq!(block.out_channels(), 16);
        assert_eq!(output.dims(), &[1, 16, 16, 16]);
    }

    #[test]
    fn test_bottleneck_stride_halves_spatial() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let projection = ShortcutProjection::load(vb.pp("block.downsample"), 32, 32, 2).unwrap();
        let block =
            BottleneckBlock::load(vb.pp("block"), 32, 16, 2, Some(Box::new(projection))).unwrap();
        let input = Tensor::zeros((1, 32, 16, 16), DType::F32, &device).unwrap();
        let output = block.forward(&input, ExecutionMode::Evaluation).unwrap();
        assert_eq!(output.dims(), &[1, 32, 8, 8]);
    }

    #[test]
    fn test_bottleneck_requires_downsample_when_shapes_differ() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let result = BottleneckBlock::load(vb.pp("block"), 32, 32, 1, None);
        assert!(matches!(result, Err(HourglassError::InvalidConfig(_))));
    }

    #[test]
    fn test_bottleneck_rejects_misshapen_downsample() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        // passthrough keeps 32 channels, the block needs 64
        let result = BottleneckBlock::load(vb.pp("block"), 32, 32, 1, Some(Box::new(Passthrough)));
        assert!(matches!(result, Err(HourglassError::InvalidConfig(_))));
    }

    #[test]
    fn test_bottleneck_rejects_wrong_input_channels() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let block = BottleneckBlock::load(vb.pp("block"), 64, 32, 1, None).unwrap();
        let input = Tensor::zeros((1, 32, 8, 8), DType::F32, &device).unwrap();
        let result = block.forward(&input, ExecutionMode::Evaluation);
        assert!(matches!(
            result,
            Err(HourglassError::ChannelMismatch {
                expected: 64,
                actual: 32
            })
        ));
    }

    #[test]
    fn test_bottleneck_as_module_t() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let block = BottleneckBlock::load(vb.pp("block"), 16, 8, 1, None).unwrap();
        let input = Tensor::randn(0f32, 1f32, (2, 16, 8, 8), &device).unwrap();
        let output = input.apply_t(&block, true).unwrap();
        assert_eq!(output.dims(), &[2, 16, 8, 8]);
    }

    #[test]
    fn test_residual_stage_projects_first_block_only() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let stage = ResidualStage::load(vb.pp("stage"), 8, 16, 3, 1).unwrap();
        assert_eq!(stage.len(), 3);
        assert!(stage.blocks[0].downsample.is_some());
        assert!(stage.blocks[1..].iter().all(|b| b.downsample.is_none()));

        let input = Tensor::randn(0f32, 1f32, (1, 8, 8, 8), &device).unwrap();
        let output = stage.forward(&input, ExecutionMode::Evaluation).unwrap();
        assert_eq!(output.dims(), &[1, 32, 8, 8]);
    }

    #[test]
    fn test_residual_stage_rejects_zero_blocks() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        assert!(ResidualStage::load(vb.pp("stage"), 16, 8, 0, 1).is_err());
    }

    #[test]
    fn test_feature_projection_preserves_shape() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let fc = FeatureProjection::load(vb.pp("fc"), 16).unwrap();
        let input = Tensor::randn(0f32, 1f32, (1, 16, 8, 8), &device).unwrap();
        let output = fc.forward(&input, ExecutionMode::Evaluation).unwrap();
        assert_eq!(output.dims(), &[1, 16, 8, 8]);
        // relu output
        let min = output.flatten_all().unwrap().min(0).unwrap();
        assert!(min.to_scalar::<f32>().unwrap() >= 0.0);
    }

    #[test]
    fn test_feature_projection_conv_has_bias() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        FeatureProjection::load(vb.pp("fc"), 16).unwrap();
        let data = varmap.data().lock().unwrap();
        assert_eq!(data["fc.conv.bias"].as_tensor().dims(), &[16]);
        assert!(data.contains_key("fc.bn.running_mean"));
    }

    #[test]
    fn test_upsample_doubles_spatial() {
        let device = Device::Cpu;
        let input = Tensor::zeros((1, 4, 5, 7), DType::F32, &device).unwrap();
        let output = upsample_nearest(&input, 2).unwrap();
        assert_eq!(output.dims(), &[1, 4, 10, 14]);
    }

    #[test]
    fn test_dims4_rejects_other_ranks() {
        let device = Device::Cpu;
        let input = Tensor::zeros((4, 8, 8), DType::F32, &device).unwrap();
        assert!(matches!(
            dims4(&input),
            Err(HourglassError::InvalidInput(_))
        ));
    }
}
