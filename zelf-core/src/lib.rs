pub mod admission;
pub mod archive;
pub mod binary;
pub mod builder;
pub mod codec;
pub mod container;
pub mod depack;
pub mod error;
pub mod features;
pub mod filter;
pub mod header;
pub mod locator;
pub mod pack;
pub mod params;
pub mod password;
pub mod resolver;
pub mod segments;
pub mod selector;
pub mod strip;

pub use admission::SystemResources;
pub use archive::{Archive, ArchiveKind, ArchiveOptions, ArchiveReport};
pub use binary::ElfImage;
pub use builder::AddressMode;
pub use codec::{Codec, CodecKind};
pub use container::{Container, ContainerHeader, LayoutDecision, LayoutKind, LayoutSource};
pub use depack::{DepackOptions, DepackReport, Depacker, Inspection, MismatchPolicy};
pub use error::{Error, Result};
pub use filter::{Arch, Filter, FilterKind};
pub use locator::Discovery;
pub use pack::{PackOptions, PackReport, Packer};
pub use params::ParamsBlock;
pub use resolver::AddressResolver;
pub use segments::{SegmentFlags, SegmentInfo};
pub use selector::{Classifier, FilterChoice, Prediction, StumpClassifier};
