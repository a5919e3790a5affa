//! Named optimizer presets.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{OptimizeError, Result};
use crate::handler::{
    CompressionOptimizer, ImageQualityOptimizer, OptimizationHandler, ReplacePolicy, Selection,
};
use crate::processor::{Processor, ProcessorChain};
use crate::raster::Encoding;
use crate::scaling::AverageAlgorithm;

/// Built-in optimizer profiles, from gentlest to most aggressive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Profile {
    /// Only lossless stream compression and metadata removal
    LosslessCompression,
    /// Re-encode images with high JPEG quality where it saves space
    LowCompression,
    /// Re-encode images as medium quality JPEG where it saves space
    HighCompression,
    /// Halve image resolution, low quality JPEG, strip metadata
    MaximumCompression,
}

impl Profile {
    pub const ALL: [Profile; 4] = [
        Profile::LosslessCompression,
        Profile::LowCompression,
        Profile::HighCompression,
        Profile::MaximumCompression,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Profile::LosslessCompression => "lossless-compression",
            Profile::LowCompression => "low-compression",
            Profile::HighCompression => "high-compression",
            Profile::MaximumCompression => "maximum-compression",
        }
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Profile {
    type Err = OptimizeError;

    /// Accepts `high-compression`, `high_compression` and `HIGH_COMPRESSION`
    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        Profile::ALL
            .into_iter()
            .find(|p| p.name() == normalized)
            .ok_or_else(|| OptimizeError::UnknownProfile(s.to_string()))
    }
}

/// Immutable map from profile to its ordered handler list
#[derive(Debug)]
pub struct ProfileRegistry {
    profiles: HashMap<Profile, Vec<OptimizationHandler>>,
}

static REGISTRY: Lazy<Result<ProfileRegistry>> = Lazy::new(ProfileRegistry::builtin);

impl ProfileRegistry {
    /// The process-wide registry of built-in profiles
    pub fn global() -> Result<&'static ProfileRegistry> {
        (*REGISTRY).as_ref().map_err(Clone::clone)
    }

    fn builtin() -> Result<Self> {
        let compression = OptimizationHandler::StreamCompression(CompressionOptimizer::default());
        let identity = ProcessorChain::identity;

        let lossless = vec![compression.clone(), OptimizationHandler::MetadataRemoval];

        let low = vec![
            OptimizationHandler::ImageQuality(
                ImageQualityOptimizer::new()
                    .with_lossy(identity(), Encoding::Jpeg { quality: 85 })
                    .with_lossless(identity(), Encoding::Flate),
            ),
            compression.clone(),
        ];

        let high = vec![
            OptimizationHandler::ImageQuality(
                ImageQualityOptimizer::new()
                    .with_lossy(identity(), Encoding::Jpeg { quality: 50 })
                    .with_lossless(identity(), Encoding::Jpeg { quality: 50 }),
            ),
            compression.clone(),
        ];

        // Direct-color images are handled first; the indexed pass afterwards
        // never sees them because its chain only accepts indexed input.
        let half = || Processor::scale(0.5, AverageAlgorithm::Mean);
        let selection = Selection {
            min_size_bytes: 1024,
        };
        let maximum = vec![
            OptimizationHandler::ImageQuality(
                ImageQualityOptimizer::new()
                    .with_lossy(ProcessorChain::new(vec![half()?])?, Encoding::Jpeg { quality: 30 })
                    .with_lossless(ProcessorChain::new(vec![half()?])?, Encoding::Jpeg { quality: 30 })
                    .with_selection(selection),
            ),
            indexed_downscale(0.5, AverageAlgorithm::Mean, selection)?,
            compression,
            OptimizationHandler::MetadataRemoval,
        ];

        let profiles = HashMap::from([
            (Profile::LosslessCompression, lossless),
            (Profile::LowCompression, low),
            (Profile::HighCompression, high),
            (Profile::MaximumCompression, maximum),
        ]);
        Ok(ProfileRegistry { profiles })
    }

    pub fn handlers(&self, profile: Profile) -> &[OptimizationHandler] {
        self.profiles
            .get(&profile)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Look up a profile by name
    pub fn lookup(&self, name: &str) -> Result<&[OptimizationHandler]> {
        let profile: Profile = name.parse()?;
        Ok(self.handlers(profile))
    }
}

/// Rescales palette images and re-indexes them, keeping direct color when
/// the rescaled image no longer fits a 256 entry palette
pub fn indexed_downscale(
    factor: f64,
    algorithm: AverageAlgorithm,
    selection: Selection,
) -> Result<OptimizationHandler> {
    let chain = ProcessorChain::builder()
        .add(Processor::Deindex)
        .add(Processor::scale(factor, algorithm)?)
        .add(Processor::Index {
            max_palette_size: crate::palette::MAX_PALETTE_SIZE,
        })
        .build()?;
    Ok(OptimizationHandler::ImageQuality(
        ImageQualityOptimizer::new()
            .with_lossless(chain, Encoding::Flate)
            .with_selection(selection)
            .with_policy(ReplacePolicy::OnlyIfSmaller),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_profile_registered() {
        let registry = ProfileRegistry::global().unwrap();
        for profile in Profile::ALL {
            assert!(!registry.handlers(profile).is_empty(), "{}", profile);
        }
    }

    #[test]
    fn test_lookup_accepts_spellings() {
        let registry = ProfileRegistry::global().unwrap();
        let a = registry.lookup("HIGH_COMPRESSION").unwrap();
        let b = registry.lookup("high-compression").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_unknown_profile() {
        let registry = ProfileRegistry::global().unwrap();
        assert_eq!(
            registry.lookup("ultra").unwrap_err(),
            OptimizeError::UnknownProfile("ultra".into())
        );
    }

    #[test]
    fn test_indexed_downscale_rejects_bad_factor() {
        assert!(matches!(
            indexed_downscale(0.0, AverageAlgorithm::Mean, Selection::default()),
            Err(OptimizeError::IncompatibleChain(_))
        ));
        assert!(indexed_downscale(0.03, AverageAlgorithm::Mean, Selection::default()).is_ok());
    }

    #[test]
    fn test_profile_round_trips_through_name() {
        for profile in Profile::ALL {
            assert_eq!(profile.to_string().parse::<Profile>().unwrap(), profile);
        }
    }
}
