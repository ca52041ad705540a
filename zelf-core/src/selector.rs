use crate::binary::ElfImage;
use crate::codec::CodecKind;
use crate::features::{self, Feature, FeatureVector};
use crate::filter::{FilterHint, FilterKind};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prediction {
    Kanzi,
    Bcj,
}

impl From<Prediction> for FilterKind {
    fn from(p: Prediction) -> Self {
        match p {
            Prediction::Kanzi => FilterKind::Kanzi,
            Prediction::Bcj => FilterKind::Bcj,
        }
    }
}

/// Per-codec binary decision between the two executable filters.
pub trait Classifier: Send + Sync {
    fn predict(&self, codec: CodecKind, features: &FeatureVector) -> Prediction;
}

/// Single split on call/jump statistics, shared by every codec.
///
/// Kanzi wins when there are enough rel32 branches and most of them land in
/// executable segments, which is when absolute targets repeat.
#[derive(Debug, Clone, Copy)]
pub struct StumpClassifier {
    pub min_rel32: f64,
    pub min_in_text_ratio: f64,
}

impl StumpClassifier {
    pub const DEFAULT: StumpClassifier = StumpClassifier {
        min_rel32: 8.0,
        min_in_text_ratio: 0.35,
    };
}

impl Default for StumpClassifier {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl Classifier for StumpClassifier {
    fn predict(&self, _codec: CodecKind, fv: &FeatureVector) -> Prediction {
        let rel32 = fv.get(Feature::E8Count) + fv.get(Feature::E9Count);
        if rel32 >= self.min_rel32 && fv.get(Feature::Rel32InTextRatio) > self.min_in_text_ratio {
            Prediction::Kanzi
        } else {
            Prediction::Bcj
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterChoice {
    #[default]
    Auto,
    None,
    Bcj,
    Kanzi,
}

impl fmt::Display for FilterChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FilterChoice::Auto => "auto",
            FilterChoice::None => "none",
            FilterChoice::Bcj => "bcj",
            FilterChoice::Kanzi => "kanzi",
        })
    }
}

impl FromStr for FilterChoice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(FilterChoice::Auto),
            "none" => Ok(FilterChoice::None),
            "bcj" => Ok(FilterChoice::Bcj),
            "kanzi" | "kanzi-exe" => Ok(FilterChoice::Kanzi),
            _ => Err(format!("unknown filter {s:?}")),
        }
    }
}

/// Result of filter selection: what was asked for, what actually ran and the
/// bytes to hand to the codec.
#[derive(Debug, Clone)]
pub struct FilterOutcome {
    pub requested: FilterKind,
    pub applied: FilterKind,
    pub data: Vec<u8>,
}

impl FilterOutcome {
    pub fn fell_back(&self) -> bool {
        self.requested != self.applied
    }
}

pub struct FilterSelector<'c> {
    classifier: &'c dyn Classifier,
}

impl<'c> FilterSelector<'c> {
    pub fn new(classifier: &'c dyn Classifier) -> Self {
        FilterSelector { classifier }
    }

    /// The filter `choice` resolves to for `codec`, consulting the classifier
    /// for [`FilterChoice::Auto`].
    pub fn resolve(&self, choice: FilterChoice, codec: CodecKind, image: &ElfImage) -> FilterKind {
        match choice {
            FilterChoice::None => FilterKind::None,
            FilterChoice::Bcj => FilterKind::Bcj,
            FilterChoice::Kanzi => FilterKind::Kanzi,
            FilterChoice::Auto => {
                let fv = features::extract(image);
                let prediction = self.classifier.predict(codec, &fv);
                log::info!("{codec}: classifier picked {:?}", prediction);
                prediction.into()
            }
        }
    }

    /// Resolves `choice` and runs the filter, falling back to no filter when
    /// it refuses the input.
    pub fn apply(&self, choice: FilterChoice, codec: CodecKind, image: &ElfImage) -> FilterOutcome {
        let requested = self.resolve(choice, codec, image);
        let hint = FilterHint::for_elf(&image.bytes, image.code_range.clone());
        attempt(requested, &image.bytes, &hint)
    }
}

/// Runs `kind` forward over `input`; a refusal yields the unfiltered bytes.
pub fn attempt(kind: FilterKind, input: &[u8], hint: &FilterHint) -> FilterOutcome {
    match kind.backend().forward(input, hint) {
        Some(data) => {
            log::debug!("{kind}: {} -> {} bytes", input.len(), data.len());
            FilterOutcome {
                requested: kind,
                applied: kind,
                data,
            }
        }
        None => {
            log::info!("{kind} refused the input, packing unfiltered");
            FilterOutcome {
                requested: kind,
                applied: FilterKind::None,
                data: input.to_vec(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stump_prefers_kanzi_for_dense_local_calls() {
        let stump = StumpClassifier::default();
        assert_eq!(stump.min_rel32, StumpClassifier::DEFAULT.min_rel32);
        assert_eq!(stump.min_in_text_ratio, StumpClassifier::DEFAULT.min_in_text_ratio);
        let mut fv = FeatureVector::default();
        assert_eq!(stump.predict(CodecKind::Lz4, &fv), Prediction::Bcj);

        fv.set(Feature::E8Count, 100.0);
        fv.set(Feature::Rel32InTextRatio, 0.9);
        assert_eq!(stump.predict(CodecKind::Lz4, &fv), Prediction::Kanzi);

        fv.set(Feature::Rel32InTextRatio, 0.2);
        assert_eq!(stump.predict(CodecKind::Lz4, &fv), Prediction::Bcj);
    }

    #[test]
    fn kanzi_refusal_falls_back_to_none() {
        let input = vec![0x11u8; 8192];
        let outcome = attempt(FilterKind::Kanzi, &input, &FilterHint::default());
        assert_eq!(outcome.applied, FilterKind::None);
        assert!(outcome.fell_back());
        assert_eq!(outcome.data, input);
    }

    #[test]
    fn bcj_never_refuses() {
        let outcome = attempt(FilterKind::Bcj, &[0xE8, 1, 0, 0, 0, 0], &FilterHint::default());
        assert_eq!(outcome.applied, FilterKind::Bcj);
        assert!(!outcome.fell_back());
    }

    #[test]
    fn filter_choice_parses() {
        assert_eq!("BCJ".parse::<FilterChoice>().unwrap(), FilterChoice::Bcj);
        assert_eq!("kanzi".parse::<FilterChoice>().unwrap(), FilterChoice::Kanzi);
        assert!("lzx".parse::<FilterChoice>().is_err());
    }
}
