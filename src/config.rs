use std::{fs, path::Path, time::Duration};

use serde::Deserialize;

use crate::error::ConfigError;

/// Upper bound on processors the coordinator can address.
pub const MAX_PROCESSORS: usize = 16;

const WORD_BYTES: usize = 4;

fn default_block_size() -> usize {
    32
}

fn default_lines() -> usize {
    1
}

fn default_processors() -> usize {
    1
}

fn default_queue_depth() -> usize {
    1
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    #[serde(default = "default_lines")]
    pub lines: usize,
    #[serde(default = "default_processors")]
    pub processors: usize,
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    /// Absent means a controller waits on the coordinator forever.
    #[serde(default)]
    pub response_timeout_ms: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            block_size: default_block_size(),
            lines: default_lines(),
            processors: default_processors(),
            queue_depth: default_queue_depth(),
            response_timeout_ms: None,
        }
    }
}

/// Validated line layout shared by every controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub block_bits: u32,
    pub line_bits: u32,
    pub words_per_line: usize,
}

impl Geometry {
    pub fn block_size(&self) -> usize {
        1 << self.block_bits
    }

    pub fn lines(&self) -> usize {
        1 << self.line_bits
    }
}

impl Default for Geometry {
    fn default() -> Self {
        Geometry {
            block_bits: 5,
            line_bits: 0,
            words_per_line: 8,
        }
    }
}

impl Config {
    pub fn from_json(json: &str) -> Result<Config, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        Config::from_json(&fs::read_to_string(path)?)
    }

    pub fn geometry(&self) -> Result<Geometry, ConfigError> {
        if !self.block_size.is_power_of_two() {
            return Err(ConfigError::NotPowerOfTwo {
                field: "block_size",
                value: self.block_size,
            });
        }
        if self.block_size < WORD_BYTES {
            return Err(ConfigError::BlockTooSmall(self.block_size));
        }
        if !self.lines.is_power_of_two() {
            return Err(ConfigError::NotPowerOfTwo {
                field: "lines",
                value: self.lines,
            });
        }
        let address_bits = self.block_size.ilog2() + self.lines.ilog2();
        if address_bits > u32::BITS {
            return Err(ConfigError::AddressWidth(address_bits));
        }
        if self.processors == 0 || self.processors > MAX_PROCESSORS {
            return Err(ConfigError::ProcessorCount(self.processors));
        }
        if self.queue_depth == 0 {
            return Err(ConfigError::QueueDepth);
        }
        Ok(Geometry {
            block_bits: self.block_size.ilog2(),
            line_bits: self.lines.ilog2(),
            words_per_line: self.block_size / WORD_BYTES,
        })
    }

    pub fn response_timeout(&self) -> Option<Duration> {
        self.response_timeout_ms.map(Duration::from_millis)
    }
}
