use crate::admission::SystemResources;
use crate::binary::ElfImage;
use crate::builder::{self, AddressMode};
use crate::codec::CodecKind;
use crate::container::{ContainerHeader, LayoutKind};
use crate::depack::write_executable;
use crate::error::{Error, Result};
use crate::filter::{Arch, FilterKind};
use crate::params::ParamsBlock;
use crate::password;
use crate::selector::{Classifier, FilterChoice, FilterSelector, StumpClassifier};
use crate::strip;
use std::fs;
use std::path::{Path, PathBuf};

static DEFAULT_CLASSIFIER: StumpClassifier = StumpClassifier::DEFAULT;

#[derive(Debug, Clone)]
pub struct PackOptions {
    pub codec: CodecKind,
    pub filter: FilterChoice,
    /// `None` follows the input: `PT_INTERP` means position-independent.
    pub address_mode: Option<AddressMode>,
    /// Keep artifacts that are not smaller than the input.
    pub allow_growth: bool,
    pub password: Option<String>,
    /// Loader stub to embed instead of the placeholder.
    pub stub: Option<Vec<u8>>,
    /// Super-strip the input first. The depacked result is then the stripped
    /// image, not the original file.
    pub strip: bool,
}

impl Default for PackOptions {
    fn default() -> Self {
        PackOptions {
            codec: CodecKind::Lz4,
            filter: FilterChoice::Auto,
            address_mode: None,
            allow_growth: false,
            password: None,
            stub: None,
            strip: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackReport {
    pub codec: CodecKind,
    pub requested_filter: FilterKind,
    pub filter: FilterKind,
    pub layout: LayoutKind,
    pub address_mode: AddressMode,
    /// Size of the file handed to the packer.
    pub input_size: usize,
    /// Size of the image actually compressed (smaller than `input_size`
    /// after a super-strip).
    pub orig_size: usize,
    pub filtered_size: usize,
    pub comp_size: usize,
    pub packed_size: usize,
    pub container_offset: usize,
    pub packed_data_vaddr: u64,
    pub sealed: bool,
    pub output: Option<PathBuf>,
}

impl PackReport {
    pub fn ratio(&self) -> f64 {
        if self.input_size == 0 {
            0.0
        } else {
            self.packed_size as f64 / self.input_size as f64
        }
    }

    pub fn stripped(&self) -> bool {
        self.orig_size < self.input_size
    }
}

/// Default output path: the input path with `.zelf` appended.
pub fn default_output_path(input: &Path) -> PathBuf {
    let mut s = input.as_os_str().to_owned();
    s.push(".zelf");
    PathBuf::from(s)
}

/// Backup kept by [`Packer::pack_in_place`]: the input path with `.bak` appended.
pub fn backup_path(input: &Path) -> PathBuf {
    let mut s = input.as_os_str().to_owned();
    s.push(".bak");
    PathBuf::from(s)
}

pub struct Packer<'c> {
    options: PackOptions,
    classifier: &'c dyn Classifier,
    resources: SystemResources,
}

impl Packer<'static> {
    /// Packer with the built-in classifier and detected system limits.
    pub fn new(options: PackOptions) -> Self {
        Packer {
            options,
            classifier: &DEFAULT_CLASSIFIER,
            resources: SystemResources::detect(),
        }
    }
}

impl<'c> Packer<'c> {
    pub fn with_classifier<'n>(self, classifier: &'n dyn Classifier) -> Packer<'n> {
        Packer {
            options: self.options,
            classifier,
            resources: self.resources,
        }
    }

    pub fn with_resources(mut self, resources: SystemResources) -> Self {
        self.resources = resources;
        self
    }

    pub fn options(&self) -> &PackOptions {
        &self.options
    }

    /// Packs `image` into a new ELF.
    pub fn pack_image(&self, image: &ElfImage) -> Result<(Vec<u8>, PackReport)> {
        let opts = &self.options;
        let codec = opts.codec;
        let input_size = image.len();

        let slim;
        let image = if opts.strip {
            slim = strip::super_strip(image)?.0;
            &slim
        } else {
            image
        };
        let orig_size = image.len();

        let selector = FilterSelector::new(self.classifier);
        let filtered = selector.apply(opts.filter, codec, image);
        let bcj = filtered.applied == FilterKind::Bcj;
        let kanzi = filtered.applied == FilterKind::Kanzi;

        self.resources.admit(codec, filtered.data.len() as u64)?;
        let backend = codec.backend()?;
        let compressed = backend.compress(&filtered.data)?;
        log::info!(
            "{codec}: {} -> {} bytes ({})",
            filtered.data.len(),
            compressed.len(),
            filtered.applied
        );

        let layout = LayoutKind::for_pack(codec, bcj);
        let filtered_size = (layout == LayoutKind::Modern).then_some(filtered.data.len());
        let header = ContainerHeader::new(
            codec,
            orig_size as u64,
            image.header.e_entry,
            compressed.len(),
            filtered_size,
        )?;
        let container = header.encode(&compressed);

        let seal = opts.password.as_deref().map(|pw| password::seal(pw.as_bytes()));
        let params = ParamsBlock::new(bcj, kanzi, seal);

        let mode = opts.address_mode.unwrap_or(if image.has_interp {
            AddressMode::PositionIndependent
        } else {
            AddressMode::Static
        });
        let arch = Arch::from_machine(image.machine()).unwrap_or(Arch::X86);
        let stub = opts
            .stub
            .as_deref()
            .unwrap_or_else(|| builder::placeholder_stub(arch));

        let built = builder::build(image.machine(), mode, stub, params, &container)?;

        if built.bytes.len() >= input_size && !opts.allow_growth {
            return Err(Error::NoGain {
                original: input_size,
                packed: built.bytes.len(),
            });
        }

        let report = PackReport {
            codec,
            requested_filter: filtered.requested,
            filter: filtered.applied,
            layout,
            address_mode: mode,
            input_size,
            orig_size,
            filtered_size: filtered.data.len(),
            comp_size: compressed.len(),
            packed_size: built.bytes.len(),
            container_offset: built.container_offset,
            packed_data_vaddr: built.packed_data_vaddr,
            sealed: seal.is_some(),
            output: None,
        };
        Ok((built.bytes, report))
    }

    pub fn pack_bytes(&self, bytes: Vec<u8>) -> Result<(Vec<u8>, PackReport)> {
        let image = ElfImage::parse(bytes)?;
        self.pack_image(&image)
    }

    /// Packs `input` into `output`, or [`default_output_path`] when `None`.
    pub fn pack_file(&self, input: &Path, output: Option<&Path>) -> Result<PackReport> {
        let image = ElfImage::open(input)?;
        let (bytes, mut report) = self.pack_image(&image)?;
        let path = output
            .map(Path::to_path_buf)
            .unwrap_or_else(|| default_output_path(input));
        write_executable(&path, &bytes, 0o755)?;
        log::info!(
            "wrote {} ({} -> {} bytes)",
            path.display(),
            report.orig_size,
            report.packed_size
        );
        report.output = Some(path);
        Ok(report)
    }

    /// Packs `input` over itself. With `backup` the untouched input is first
    /// copied to [`backup_path`], keeping its permissions.
    pub fn pack_in_place(&self, input: &Path, backup: bool) -> Result<PackReport> {
        let image = ElfImage::open(input)?;
        let (bytes, mut report) = self.pack_image(&image)?;
        if backup {
            let bak = backup_path(input);
            fs::copy(input, &bak).map_err(|e| Error::file(&bak, e))?;
            log::info!("backup written to {}", bak.display());
        }
        write_executable(input, &bytes, 0o755)?;
        log::info!(
            "packed {} in place ({} -> {} bytes)",
            input.display(),
            report.input_size,
            report.packed_size
        );
        report.output = Some(input.to_path_buf());
        Ok(report)
    }

    /// [`Packer::pack_best`] over a file, written like [`Packer::pack_file`].
    pub fn pack_best_file(
        &self,
        input: &Path,
        output: Option<&Path>,
        candidates: &[CodecKind],
    ) -> Result<PackReport> {
        let image = ElfImage::open(input)?;
        let (bytes, mut report) = self.pack_best(&image, candidates)?;
        let path = output
            .map(Path::to_path_buf)
            .unwrap_or_else(|| default_output_path(input));
        write_executable(&path, &bytes, 0o755)?;
        log::info!(
            "wrote {} ({} via {}/{})",
            path.display(),
            report.packed_size,
            report.codec,
            report.filter
        );
        report.output = Some(path);
        Ok(report)
    }

    /// Tries every codec in `candidates` with BCJ, Kanzi and no filter and
    /// keeps the smallest artifact. Candidates that fail are skipped; if all
    /// fail the last error is returned.
    pub fn pack_best(
        &self,
        image: &ElfImage,
        candidates: &[CodecKind],
    ) -> Result<(Vec<u8>, PackReport)> {
        let mut best: Option<(Vec<u8>, PackReport)> = None;
        let mut last_err = None;

        for &codec in candidates {
            for filter in [FilterChoice::Bcj, FilterChoice::Kanzi, FilterChoice::None] {
                let trial = Packer {
                    options: PackOptions {
                        codec,
                        filter,
                        ..self.options.clone()
                    },
                    classifier: self.classifier,
                    resources: self.resources,
                };
                match trial.pack_image(image) {
                    Ok((bytes, report)) => {
                        log::debug!("best: {codec}/{filter} -> {} bytes", bytes.len());
                        if best.as_ref().map_or(true, |(b, _)| bytes.len() < b.len()) {
                            best = Some((bytes, report));
                        }
                    }
                    Err(e) => {
                        log::debug!("best: {codec}/{filter} skipped: {e}");
                        last_err = Some(e);
                    }
                }
            }
        }

        match (best, last_err) {
            (Some(found), _) => Ok(found),
            (None, Some(e)) => Err(e),
            (None, None) => Err(crate::error::FormatError::InvalidField {
                field: "codec candidates",
                value: 0,
            }
            .into()),
        }
    }
}
