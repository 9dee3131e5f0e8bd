// Stacked hourglass network: stem, S hourglass stacks, and the feedback
// merge that feeds every stack's features and scores into the next one.

use {
    crate::{
        blocks::{BottleneckBlock, FeatureProjection, ResidualStage, Transform, dims4, max_pool2x},
        config::HourglassConfig,
        error::{HourglassError, Result},
        head::{HeadFactory, build_checked},
        hourglass::HourglassModule,
        mode::ExecutionMode,
    },
    candle_core::Tensor,
    candle_nn::{BatchNorm, Conv2d, Conv2dConfig, VarBuilder, batch_norm, conv2d},
};

/// Heatmaps of every stack plus the last stack's refined features.
#[derive(Debug, Clone)]
pub struct StackedOutput {
    /// One `[N, num_classes, H/4, W/4]` map per stack, first stack first.
    pub heatmaps: Vec<Tensor>,
    /// `[N, channels, H/4, W/4]` features the last head was applied to.
    pub features: Tensor,
}

impl StackedOutput {
    /// The most refined prediction.
    pub fn final_heatmap(&self) -> Option<&Tensor> {
        self.heatmaps.last()
    }
}

/// 7x7/2 conv, bn, relu, two residual stages widening `stem_width` to
/// `4 * stem_width`, 2x2 pool and a residual stage to `num_feats * 2`
/// channels. Output is at 1/4 of the input resolution.
#[derive(Debug)]
struct Stem {
    conv: Conv2d,
    bn: BatchNorm,
    layer1: ResidualStage,
    layer2: ResidualStage,
    layer3: ResidualStage,
}

impl Stem {
    fn load(vb: VarBuilder, config: &HourglassConfig) -> Result<Self> {
        let conv = conv2d(
            config.input_channels,
            config.stem_width,
            7,
            Conv2dConfig {
                stride: 2,
                padding: 3,
                ..Default::default()
            },
            vb.pp("conv"),
        )?;
        let bn = batch_norm(config.stem_width, 1e-5, vb.pp("bn"))?;

        // each stage's planes is the width the previous one produced:
        // stem_width -> 2x -> 4x, then down to num_feats * 2
        let width1 = config.stem_width * BottleneckBlock::EXPANSION;
        let width2 = width1 * BottleneckBlock::EXPANSION;
        let layer1 =
            ResidualStage::load(vb.pp("layer1"), config.stem_width, config.stem_width, 1, 1)?;
        let layer2 = ResidualStage::load(vb.pp("layer2"), width1, width1, 1, 1)?;
        let layer3 = ResidualStage::load(vb.pp("layer3"), width2, config.num_feats, 1, 1)?;

        Ok(Self {
            conv,
            bn,
            layer1,
            layer2,
            layer3,
        })
    }

    fn forward(&self, xs: &Tensor, mode: ExecutionMode) -> Result<Tensor> {
        let xs = xs
            .apply(&self.conv)?
            .apply_t(&self.bn, mode.is_training())?
            .relu()?;
        let xs = self.layer1.forward(&xs, mode)?;
        let xs = self.layer2.forward(&xs, mode)?;
        let xs = max_pool2x(&xs)?;
        self.layer3.forward(&xs, mode)
    }
}

/// Projections carrying a stack's features and scores back to `channels`.
#[derive(Debug)]
struct Merge {
    feature: Conv2d,
    score: Conv2d,
}

#[derive(Debug)]
struct Stack {
    hourglass: HourglassModule,
    residual: ResidualStage,
    projection: FeatureProjection,
    head: Box<dyn Transform>,
    /// Absent on the last stack.
    merge: Option<Merge>,
}

impl Stack {
    /// Returns `(features, heatmap)`.
    fn forward(&self, xs: &Tensor, mode: ExecutionMode) -> Result<(Tensor, Tensor)> {
        let ys = self.hourglass.forward(xs, mode)?;
        let ys = self.residual.forward(&ys, mode)?;
        let ys = self.projection.forward(&ys, mode)?;
        let heatmap = self.head.transform(&ys, mode)?;
        Ok((ys, heatmap))
    }
}

/// Stacked hourglass backbone.
#[derive(Debug)]
pub struct StackedHourglass {
    config: HourglassConfig,
    stem: Stem,
    stacks: Vec<Stack>,
}

impl StackedHourglass {
    /// Builds the network with the head selected in `config.head`.
    pub fn load(vb: VarBuilder, config: &HourglassConfig) -> Result<Self> {
        let head = config.head.clone();
        Self::load_with_head(vb, config, &head)
    }

    /// Builds the network with an external head factory. Each produced head
    /// is probed once and must map `channels` to `num_classes` channels at
    /// unchanged resolution.
    pub fn load_with_head(
        vb: VarBuilder,
        config: &HourglassConfig,
        head: &dyn HeadFactory,
    ) -> Result<Self> {
        config.validate()?;

        let channels = config.channels();
        let stem = Stem::load(vb.pp("stem"), config)?;

        let mut stacks = Vec::with_capacity(config.num_stacks);
        for i in 0..config.num_stacks {
            let hourglass = HourglassModule::load(
                vb.pp(format!("hg.{i}")),
                config.block,
                config.num_blocks,
                config.num_feats,
                config.depth,
            )?;
            let residual = ResidualStage::load(
                vb.pp(format!("res.{i}")),
                channels,
                config.num_feats,
                config.num_blocks,
                1,
            )?;
            let projection = FeatureProjection::load(vb.pp(format!("fc.{i}")), channels)?;
            let scoring = build_checked(
                head,
                vb.pp(format!("score.{i}")),
                channels,
                config.num_classes,
            )?;

            let merge = if i + 1 < config.num_stacks {
                Some(Merge {
                    feature: conv2d(
                        channels,
                        channels,
                        1,
                        Conv2dConfig::default(),
                        vb.pp(format!("fc_.{i}")),
                    )?,
                    score: conv2d(
                        config.num_classes,
                        channels,
                        1,
                        Conv2dConfig::default(),
                        vb.pp(format!("score_.{i}")),
                    )?,
                })
            } else {
                None
            };

            log::debug!("stack {i}: merge back into next stack: {}", merge.is_some());
            stacks.push(Stack {
                hourglass,
                residual,
                projection,
                head: scoring,
                merge,
            });
        }

        log::info!(
            "Stacked hourglass: {} stacks, depth {}, {} channels, {} classes",
            config.num_stacks,
            config.depth,
            channels,
            config.num_classes
        );

        Ok(Self {
            config: config.clone(),
            stem,
            stacks,
        })
    }

    pub fn config(&self) -> &HourglassConfig {
        &self.config
    }

    pub fn num_stacks(&self) -> usize {
        self.stacks.len()
    }

    pub fn channels(&self) -> usize {
        self.config.channels()
    }

    pub fn resolution_factor(&self) -> usize {
        self.config.resolution_factor()
    }

    /// Heatmap size for an input of `height x width`.
    pub fn output_size(&self, height: usize, width: usize) -> (usize, usize) {
        self.config.stem_output_size(height, width)
    }

    /// Checks rank, channel count and divisibility of an input batch.
    pub fn validate_input(&self, xs: &Tensor) -> Result<()> {
        let (b, c, h, w) = dims4(xs)?;
        if b == 0 || h == 0 || w == 0 {
            return Err(HourglassError::InvalidInput(format!(
                "empty input of shape {:?}",
                xs.dims()
            )));
        }
        if c != self.config.input_channels {
            return Err(HourglassError::ChannelMismatch {
                expected: self.config.input_channels,
                actual: c,
            });
        }
        let factor = self.resolution_factor();
        if h % factor != 0 || w % factor != 0 {
            return Err(HourglassError::IndivisibleInput {
                height: h,
                width: w,
                factor,
            });
        }
        Ok(())
    }

    /// Runs all stacks and returns their heatmaps in stack order.
    pub fn forward(&self, xs: &Tensor, mode: ExecutionMode) -> Result<Vec<Tensor>> {
        Ok(self.forward_with_features(xs, mode)?.heatmaps)
    }

    pub fn forward_with_features(&self, xs: &Tensor, mode: ExecutionMode) -> Result<StackedOutput> {
        self.validate_input(xs)?;

        let mut xs = self.stem.forward(xs, mode)?;
        let mut heatmaps = Vec::with_capacity(self.stacks.len());
        let mut features = None;
        for stack in &self.stacks {
            let (ys, heatmap) = stack.forward(&xs, mode)?;
            if let Some(merge) = &stack.merge {
                let merged = (xs + ys.apply(&merge.feature)?)?;
                xs = (merged + heatmap.apply(&merge.score)?)?;
            }
            heatmaps.push(heatmap);
            features = Some(ys);
        }

        let features = features.ok_or_else(|| {
            HourglassError::InvalidConfig("network has no stacks".to_string())
        })?;
        Ok(StackedOutput { heatmaps, features })
    }
}

/// Network with the classic stem (3 input channels, width 64, 128
/// features) and a 1x1 convolution head.
pub fn hg(
    vb: VarBuilder,
    depth: usize,
    num_stacks: usize,
    num_blocks: usize,
    num_classes: usize,
) -> Result<StackedHourglass> {
    let config = HourglassConfig {
        depth,
        num_stacks,
        num_blocks,
        num_classes,
        ..HourglassConfig::standard()
    };
    StackedHourglass::load(vb, &config)
}
