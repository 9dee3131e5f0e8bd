// Recursive encoder-decoder over a fixed array of levels.

use {
    crate::{
        blocks::{ResidualStage, dims4, max_pool2x, upsample_nearest},
        config::BlockKind,
        error::{HourglassError, Result},
        mode::ExecutionMode,
    },
    candle_core::{ModuleT, Tensor},
    candle_nn::VarBuilder,
};

/// One recursion depth of an hourglass.
#[derive(Debug)]
pub struct Level {
    skip: ResidualStage,
    down: ResidualStage,
    up: ResidualStage,
    /// Only the innermost level processes the bottom of the hourglass.
    base: Option<ResidualStage>,
}

impl Level {
    fn load(
        vb: VarBuilder,
        channels: usize,
        planes: usize,
        num_blocks: usize,
        innermost: bool,
    ) -> Result<Self> {
        let branch = |name: &str| ResidualStage::load(vb.pp(name), channels, planes, num_blocks, 1);
        let skip = branch("skip")?;
        let down = branch("down")?;
        let up = branch("up")?;
        let base = if innermost {
            Some(branch("base")?)
        } else {
            None
        };
        Ok(Self {
            skip,
            down,
            up,
            base,
        })
    }

    pub fn has_base(&self) -> bool {
        self.base.is_some()
    }
}

/// Depth-`D` hourglass. `levels[0]` is level 1 (innermost),
/// `levels[D - 1]` is level `D` (outermost, entered first).
#[derive(Debug)]
pub struct HourglassModule {
    levels: Vec<Level>,
    planes: usize,
    expansion: usize,
}

impl HourglassModule {
    pub fn load(
        vb: VarBuilder,
        block: BlockKind,
        num_blocks: usize,
        planes: usize,
        depth: usize,
    ) -> Result<Self> {
        if depth == 0 {
            return Err(HourglassError::InvalidConfig(
                "hourglass depth must be at least 1".to_string(),
            ));
        }
        if depth >= usize::BITS as usize {
            return Err(HourglassError::InvalidConfig(format!(
                "hourglass depth {depth} overflows the resolution factor 2^depth"
            )));
        }
        if block.expansion() != 2 {
            return Err(HourglassError::InvalidConfig(format!(
                "hourglass blocks must expand by 2, got {}",
                block.expansion()
            )));
        }

        let channels = planes * block.expansion();
        let mut levels = Vec::with_capacity(depth);
        for i in 0..depth {
            levels.push(Level::load(
                vb.pp(format!("levels.{i}")),
                channels,
                planes,
                num_blocks,
                i == 0,
            )?);
        }
        log::debug!(
            "hourglass: depth {depth}, {channels} channels, {num_blocks} blocks per branch"
        );

        Ok(Self {
            levels,
            planes,
            expansion: block.expansion(),
        })
    }

    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    pub fn planes(&self) -> usize {
        self.planes
    }

    pub fn channels(&self) -> usize {
        self.planes * self.expansion
    }

    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    /// Output has the input's shape. Height and width must be multiples of
    /// `2^depth` so every pooled map upsamples back to its skip's size.
    pub fn forward(&self, xs: &Tensor, mode: ExecutionMode) -> Result<Tensor> {
        let (_b, c, h, w) = dims4(xs)?;
        if c != self.channels() {
            return Err(HourglassError::ChannelMismatch {
                expected: self.channels(),
                actual: c,
            });
        }
        let factor = 1 << self.depth();
        if h == 0 || w == 0 || h % factor != 0 || w % factor != 0 {
            return Err(HourglassError::IndivisibleInput {
                height: h,
                width: w,
                factor,
            });
        }

        self.forward_level(self.depth(), xs, mode)
    }

    fn forward_level(&self, level: usize, xs: &Tensor, mode: ExecutionMode) -> Result<Tensor> {
        let branches = &self.levels[level - 1];

        let skip = branches.skip.forward(xs, mode)?;
        let down = branches.down.forward(&max_pool2x(xs)?, mode)?;
        let deep = if level > 1 {
            self.forward_level(level - 1, &down, mode)?
        } else {
            match &branches.base {
                Some(base) => base.forward(&down, mode)?,
                None => {
                    return Err(HourglassError::InvalidConfig(
                        "innermost hourglass level has no base branch".to_string(),
                    ));
                }
            }
        };
        let up = branches.up.forward(&deep, mode)?;
        let upsampled = upsample_nearest(&up, 2)?;

        Ok((skip + upsampled)?)
    }
}

impl ModuleT for HourglassModule {
    fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        Ok(self.forward(xs, train.into())?)
    }
}
