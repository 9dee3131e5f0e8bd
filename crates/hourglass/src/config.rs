use {
    crate::error::{HourglassError, Result},
    serde::{Deserialize, Serialize},
    std::path::Path,
};

/// Residual unit used throughout the network.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    /// Pre-activation bottleneck (`BottleneckBlock`)
    #[default]
    Bottleneck,
}

impl BlockKind {
    /// Ratio between a block's internal width and its output channels.
    pub fn expansion(self) -> usize {
        match self {
            BlockKind::Bottleneck => crate::blocks::BottleneckBlock::EXPANSION,
        }
    }
}

/// Built-in scoring heads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HeadKind {
    /// Single 1x1 convolution `ch -> num_classes`
    #[default]
    Conv,
    /// One `conv3x3 -> relu -> conv1x1` branch per output group, concatenated.
    /// `groups` must sum to `num_classes`.
    Multitask { groups: Vec<usize> },
}

/// Stacked hourglass construction parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HourglassConfig {
    pub input_channels: usize,
    #[serde(alias = "inplanes")]
    pub stem_width: usize,
    pub num_feats: usize,
    pub block: BlockKind,
    pub head: HeadKind,
    pub depth: usize,
    pub num_stacks: usize,
    pub num_blocks: usize,
    pub num_classes: usize,
}

impl Default for HourglassConfig {
    fn default() -> Self {
        Self::standard()
    }
}

impl HourglassConfig {
    /// Two stacks of depth 4 over 128 features, 16 output maps.
    pub fn standard() -> Self {
        Self {
            input_channels: 3,
            stem_width: 64,
            num_feats: 128,
            block: BlockKind::Bottleneck,
            head: HeadKind::Conv,
            depth: 4,
            num_stacks: 2,
            num_blocks: 1,
            num_classes: 16,
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Channel width shared by the stem output and every stack.
    pub fn channels(&self) -> usize {
        self.num_feats * self.block.expansion()
    }

    /// Input height and width must both be multiples of this: the stem
    /// divides resolution by 4 and every hourglass level pools by 2.
    pub fn resolution_factor(&self) -> usize {
        4 << self.depth
    }

    /// Spatial size of the stem output (and of every heatmap).
    pub fn stem_output_size(&self, height: usize, width: usize) -> (usize, usize) {
        (height / 4, width / 4)
    }

    pub fn validate(&self) -> Result<()> {
        let counts = [
            ("input_channels", self.input_channels),
            ("stem_width", self.stem_width),
            ("num_feats", self.num_feats),
            ("depth", self.depth),
            ("num_stacks", self.num_stacks),
            ("num_blocks", self.num_blocks),
            ("num_classes", self.num_classes),
        ];
        for (name, value) in counts {
            if value == 0 {
                return Err(HourglassError::InvalidConfig(format!(
                    "{name} must be at least 1"
                )));
            }
        }

        // 4 << depth must stay representable
        if self.depth > usize::BITS as usize - 4 {
            return Err(HourglassError::InvalidConfig(format!(
                "depth {} is too large",
                self.depth
            )));
        }

        if self.block.expansion() != 2 {
            return Err(HourglassError::InvalidConfig(format!(
                "block expansion must be 2, got {}",
                self.block.expansion()
            )));
        }

        if let HeadKind::Multitask { groups } = &self.head {
            if groups.is_empty() || groups.contains(&0) {
                return Err(HourglassError::InvalidConfig(
                    "multitask head groups must be non-empty and positive".to_string(),
                ));
            }
            let total: usize = groups.iter().sum();
            if total != self.num_classes {
                return Err(HourglassError::InvalidConfig(format!(
                    "multitask head groups sum to {total}, expected num_classes = {}",
                    self.num_classes
                )));
            }
            if self.channels() < 4 {
                return Err(HourglassError::InvalidConfig(format!(
                    "multitask head needs at least 4 channels, got {}",
                    self.channels()
                )));
            }
        }

        Ok(())
    }
}
