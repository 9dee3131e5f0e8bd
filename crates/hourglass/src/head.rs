// Scoring heads: `[N, channels, H, W] -> [N, num_classes, H, W]`.

use {
    crate::{
        blocks::{Transform, probe_transform},
        config::HeadKind,
        error::{HourglassError, Result},
        mode::ExecutionMode,
    },
    candle_core::Tensor,
    candle_nn::{Conv2d, Conv2dConfig, VarBuilder, conv2d},
};

/// Builds one scoring head per stack.
pub trait HeadFactory {
    fn build(
        &self,
        vb: VarBuilder,
        channels: usize,
        num_classes: usize,
    ) -> Result<Box<dyn Transform>>;
}

/// Builds a head through `factory` and checks its shape contract on a
/// small probe before handing it out.
pub(crate) fn build_checked(
    factory: &dyn HeadFactory,
    vb: VarBuilder,
    channels: usize,
    num_classes: usize,
) -> Result<Box<dyn Transform>> {
    let dtype = vb.dtype();
    let device = vb.device().clone();
    let head = factory.build(vb, channels, num_classes)?;
    probe_transform(
        head.as_ref(),
        "scoring head",
        (1, channels, 4, 4),
        &[1, num_classes, 4, 4],
        dtype,
        &device,
    )?;
    Ok(head)
}

/// Single 1x1 convolution.
#[derive(Debug)]
pub struct ConvHead {
    conv: Conv2d,
}

impl ConvHead {
    pub fn load(vb: VarBuilder, channels: usize, num_classes: usize) -> Result<Self> {
        let conv = conv2d(channels, num_classes, 1, Conv2dConfig::default(), vb)?;
        Ok(Self { conv })
    }
}

impl Transform for ConvHead {
    fn transform(&self, xs: &Tensor, _mode: ExecutionMode) -> Result<Tensor> {
        Ok(xs.apply(&self.conv)?)
    }
}

/// One `conv3x3 -> relu -> conv1x1` branch per output group, each on a
/// quarter of the input width; branch outputs are concatenated in order.
#[derive(Debug)]
pub struct MultitaskHead {
    branches: Vec<(Conv2d, Conv2d)>,
}

impl MultitaskHead {
    pub fn load(vb: VarBuilder, channels: usize, groups: &[usize]) -> Result<Self> {
        let hidden = channels / 4;
        if hidden == 0 {
            return Err(HourglassError::InvalidConfig(format!(
                "multitask head needs at least 4 input channels, got {channels}"
            )));
        }
        if groups.is_empty() || groups.contains(&0) {
            return Err(HourglassError::InvalidConfig(
                "multitask head groups must be non-empty and positive".to_string(),
            ));
        }

        let mut branches = Vec::with_capacity(groups.len());
        for (i, &outputs) in groups.iter().enumerate() {
            let vb = vb.pp(format!("heads.{i}"));
            let reduce = conv2d(
                channels,
                hidden,
                3,
                Conv2dConfig {
                    padding: 1,
                    ..Default::default()
                },
                vb.pp("0"),
            )?;
            let score = conv2d(hidden, outputs, 1, Conv2dConfig::default(), vb.pp("2"))?;
            branches.push((reduce, score));
        }
        Ok(Self { branches })
    }
}

impl Transform for MultitaskHead {
    fn transform(&self, xs: &Tensor, _mode: ExecutionMode) -> Result<Tensor> {
        let mut outputs = Vec::with_capacity(self.branches.len());
        for (reduce, score) in &self.branches {
            outputs.push(xs.apply(reduce)?.relu()?.apply(score)?);
        }
        Ok(Tensor::cat(&outputs, 1)?)
    }
}

impl HeadFactory for HeadKind {
    fn build(
        &self,
        vb: VarBuilder,
        channels: usize,
        num_classes: usize,
    ) -> Result<Box<dyn Transform>> {
        match self {
            HeadKind::Conv => Ok(Box::new(ConvHead::load(vb, channels, num_classes)?)),
            HeadKind::Multitask { groups } => {
                let total: usize = groups.iter().sum();
                if total != num_classes {
                    return Err(HourglassError::InvalidConfig(format!(
                        "multitask head groups sum to {total}, expected {num_classes}"
                    )));
                }
                Ok(Box::new(MultitaskHead::load(vb, channels, groups)?))
            }
        }
    }
}
