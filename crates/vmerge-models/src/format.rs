//! Output quality and aspect ratio definitions.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Output vertical resolution class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
pub enum Quality {
    #[serde(rename = "720")]
    Hd720,
    #[default]
    #[serde(rename = "1080")]
    Hd1080,
}

impl Quality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::Hd720 => "720",
            Quality::Hd1080 => "1080",
        }
    }

    /// Length in pixels of the shorter output edge.
    pub fn short_edge(&self) -> u32 {
        match self {
            Quality::Hd720 => 720,
            Quality::Hd1080 => 1080,
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Quality {
    type Err = FormatParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().trim_end_matches('p') {
            "720" => Ok(Quality::Hd720),
            "1080" => Ok(Quality::Hd1080),
            _ => Err(FormatParseError::UnknownQuality(s.to_string())),
        }
    }
}

/// Output aspect ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
pub enum AspectRatio {
    #[default]
    #[serde(rename = "16:9")]
    Landscape,
    #[serde(rename = "9:16")]
    Portrait,
    #[serde(rename = "1:1")]
    Square,
}

impl AspectRatio {
    pub fn as_str(&self) -> &'static str {
        match self {
            AspectRatio::Landscape => "16:9",
            AspectRatio::Portrait => "9:16",
            AspectRatio::Square => "1:1",
        }
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for AspectRatio {
    type Err = FormatParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "16:9" => Ok(AspectRatio::Landscape),
            "9:16" => Ok(AspectRatio::Portrait),
            "1:1" => Ok(AspectRatio::Square),
            _ => Err(FormatParseError::UnknownAspectRatio(s.to_string())),
        }
    }
}

/// Pixel dimensions of a video frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

impl FrameSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Look up the output frame size for a quality and aspect ratio.
    pub fn target(quality: Quality, aspect: AspectRatio) -> Self {
        match (quality, aspect) {
            (Quality::Hd720, AspectRatio::Landscape) => Self::new(1280, 720),
            (Quality::Hd720, AspectRatio::Portrait) => Self::new(720, 1280),
            (Quality::Hd720, AspectRatio::Square) => Self::new(720, 720),
            (Quality::Hd1080, AspectRatio::Landscape) => Self::new(1920, 1080),
            (Quality::Hd1080, AspectRatio::Portrait) => Self::new(1080, 1920),
            (Quality::Hd1080, AspectRatio::Square) => Self::new(1080, 1080),
        }
    }
}

impl fmt::Display for FrameSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[derive(Debug, Error)]
pub enum FormatParseError {
    #[error("Invalid quality '{0}', expected \"720\" or \"1080\"")]
    UnknownQuality(String),
    #[error("Invalid aspect_ratio '{0}', expected \"16:9\", \"9:16\" or \"1:1\"")]
    UnknownAspectRatio(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_table() {
        assert_eq!(
            FrameSize::target(Quality::Hd1080, AspectRatio::Landscape),
            FrameSize::new(1920, 1080)
        );
        assert_eq!(
            FrameSize::target(Quality::Hd720, AspectRatio::Portrait),
            FrameSize::new(720, 1280)
        );
        assert_eq!(
            FrameSize::target(Quality::Hd1080, AspectRatio::Square),
            FrameSize::new(1080, 1080)
        );
    }

    #[test]
    fn test_short_edge_matches_table() {
        for quality in [Quality::Hd720, Quality::Hd1080] {
            for aspect in [AspectRatio::Landscape, AspectRatio::Portrait, AspectRatio::Square] {
                let size = FrameSize::target(quality, aspect);
                assert_eq!(size.width.min(size.height), quality.short_edge());
            }
        }
    }

    #[test]
    fn test_parse() {
        assert_eq!("720".parse::<Quality>().unwrap(), Quality::Hd720);
        assert_eq!("1080p".parse::<Quality>().unwrap(), Quality::Hd1080);
        assert!("480".parse::<Quality>().is_err());
        assert_eq!("9:16".parse::<AspectRatio>().unwrap(), AspectRatio::Portrait);
        assert!("4:3".parse::<AspectRatio>().is_err());
    }

    #[test]
    fn test_serde_names() {
        assert_eq!(serde_json::to_string(&Quality::Hd720).unwrap(), "\"720\"");
        assert_eq!(
            serde_json::from_str::<AspectRatio>("\"1:1\"").unwrap(),
            AspectRatio::Square
        );
    }
}
