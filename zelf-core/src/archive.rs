//! Single-file ZLF archives and their self-extracting ELF wrapper.
//!
//! ```text
//! [marker 6][version u32][flags u32][orig_size u64][comp_size u32][crc32 u32][name_len u16][name][payload]
//! ```
//!
//! Any file can be archived, ELF or not; nothing is filtered. An SFX archive
//! is a two-header ELF whose loadable segment is the extractor stub. The ZLF
//! bytes follow the stub, and a 32-byte footer at the very end of the file
//! points back at them.

use crate::admission::SystemResources;
use crate::builder::{placeholder_stub, PAGE_SIZE};
use crate::codec::CodecKind;
use crate::container::{MARKER_LEN, MARKER_PREFIX};
use crate::depack::write_executable;
use crate::error::{CodecError, Error, FormatError, Result};
use crate::filter::Arch;
use crate::header::{Elf64Ehdr, Elf64Phdr};
use byteorder::{ByteOrder, WriteBytesExt, LE};
use goblin::elf::header::{EM_AARCH64, EM_X86_64, ET_DYN};
use goblin::elf::program_header::{PF_R, PF_W, PF_X, PT_GNU_STACK, PT_LOAD};
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};

pub const ARCHIVE_VERSION: u32 = 1;

/// The payload is a tar stream of a directory.
pub const FLAG_TAR: u32 = 1;

/// Header bytes before the stored name.
pub const FIXED_HEADER_LEN: usize = 32;

/// `"zELFSFX\0"` read as a little-endian word.
pub const SFX_FOOTER_MAGIC: u64 = 0x0058_4653_464c_457a;
pub const SFX_FOOTER_VERSION: u32 = 1;
pub const SFX_FOOTER_LEN: usize = 32;

const SFX_STUB_OFFSET: u64 = 0x1000;
const SFX_STUB_VADDR: u64 = 0x5000;

const MAX_ARCHIVE_ORIG: u64 = 1 << 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArchiveKind {
    #[default]
    Plain,
    SelfExtracting,
}

impl ArchiveKind {
    fn extension(self) -> &'static str {
        match self {
            ArchiveKind::Plain => ".zlf",
            ArchiveKind::SelfExtracting => ".sfx",
        }
    }
}

impl fmt::Display for ArchiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ArchiveKind::Plain => "ZLF",
            ArchiveKind::SelfExtracting => "ZLF-SFX",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveHeader {
    pub codec: CodecKind,
    pub version: u32,
    pub flags: u32,
    pub orig_size: u64,
    pub comp_size: u32,
    pub crc32: u32,
    /// Base name of the archived file; may be empty.
    pub name: String,
}

impl ArchiveHeader {
    pub fn encoded_len(&self) -> usize {
        FIXED_HEADER_LEN + self.name.len()
    }

    pub fn is_tar(&self) -> bool {
        self.flags & FLAG_TAR != 0
    }

    pub fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_all(&MARKER_PREFIX)?;
        out.write_all(&self.codec.suffix())?;
        out.write_u32::<LE>(self.version)?;
        out.write_u32::<LE>(self.flags)?;
        out.write_u64::<LE>(self.orig_size)?;
        out.write_u32::<LE>(self.comp_size)?;
        out.write_u32::<LE>(self.crc32)?;
        out.write_u16::<LE>(self.name.len() as u16)?;
        out.write_all(self.name.as_bytes())
    }

    /// Parses the header at the start of `zlf` and returns it with the
    /// payload range, both relative to `zlf`.
    pub fn parse(zlf: &[u8]) -> std::result::Result<(Self, Range<usize>), FormatError> {
        let h = zlf.get(..FIXED_HEADER_LEN).ok_or(FormatError::Truncated {
            what: "archive header",
            offset: 0,
            needed: FIXED_HEADER_LEN,
            available: zlf.len(),
        })?;

        let mut marker = [0u8; MARKER_LEN];
        marker.copy_from_slice(&h[..MARKER_LEN]);
        if marker[..4] != MARKER_PREFIX {
            return Err(FormatError::BadMarker(marker, 0));
        }
        let codec = CodecKind::from_suffix(&marker[4..])
            .ok_or_else(|| FormatError::UnknownCodec(String::from_utf8_lossy(&marker[4..]).into()))?;

        let version = LE::read_u32(&h[6..10]);
        if version != ARCHIVE_VERSION {
            return Err(FormatError::InvalidField {
                field: "archive version",
                value: version.into(),
            });
        }
        let name_len = usize::from(LE::read_u16(&h[30..32]));
        let name_end = FIXED_HEADER_LEN + name_len;
        let name = zlf.get(FIXED_HEADER_LEN..name_end).ok_or(FormatError::Truncated {
            what: "archive name",
            offset: FIXED_HEADER_LEN,
            needed: name_len,
            available: zlf.len() - FIXED_HEADER_LEN,
        })?;

        let header = ArchiveHeader {
            codec,
            version,
            flags: LE::read_u32(&h[10..14]),
            orig_size: LE::read_u64(&h[14..22]),
            comp_size: LE::read_u32(&h[22..26]),
            crc32: LE::read_u32(&h[26..30]),
            name: String::from_utf8_lossy(name).into_owned(),
        };

        let comp = header.comp_size as usize;
        if zlf.len() - name_end < comp {
            return Err(FormatError::Truncated {
                what: "archive payload",
                offset: name_end,
                needed: comp,
                available: zlf.len() - name_end,
            });
        }
        Ok((header, name_end..name_end + comp))
    }
}

/// A parsed archive; ranges index the whole file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Archive {
    pub kind: ArchiveKind,
    pub header: ArchiveHeader,
    pub zlf: Range<usize>,
    pub payload: Range<usize>,
}

/// ZLF range named by a valid SFX footer, if the file ends with one.
fn sfx_payload(bytes: &[u8]) -> Option<Range<usize>> {
    let body = bytes.len().checked_sub(SFX_FOOTER_LEN)?;
    let f = &bytes[body..];
    if LE::read_u64(&f[..8]) != SFX_FOOTER_MAGIC || LE::read_u32(&f[8..12]) != SFX_FOOTER_VERSION {
        return None;
    }
    let off = usize::try_from(LE::read_u64(&f[16..24])).ok()?;
    let size = usize::try_from(LE::read_u64(&f[24..32])).ok()?;
    let end = off.checked_add(size)?;
    (end <= body).then_some(off..end)
}

/// Recognises a plain or self-extracting archive in `bytes`.
pub fn open(bytes: &[u8]) -> Result<Archive> {
    let (kind, zlf) = match sfx_payload(bytes) {
        Some(range) => (ArchiveKind::SelfExtracting, range),
        None => (ArchiveKind::Plain, 0..bytes.len()),
    };
    let (header, payload) = ArchiveHeader::parse(&bytes[zlf.clone()])?;
    log::debug!(
        "{kind} archive: {} {} bytes -> {} ({})",
        header.codec,
        header.orig_size,
        header.comp_size,
        if header.name.is_empty() { "unnamed" } else { header.name.as_str() }
    );
    let payload = zlf.start + payload.start..zlf.start + payload.end;
    Ok(Archive {
        kind,
        header,
        zlf,
        payload,
    })
}

/// Compresses `data` into a plain ZLF archive storing `name`.
pub fn create(
    data: &[u8],
    name: &str,
    codec: CodecKind,
    resources: &SystemResources,
) -> Result<Vec<u8>> {
    if name.len() > usize::from(u16::MAX) {
        return Err(FormatError::InvalidField {
            field: "archive name length",
            value: name.len() as i64,
        }
        .into());
    }
    resources.admit(codec, data.len() as u64)?;
    let compressed = codec.backend()?.compress(data)?;
    let comp_size = u32::try_from(compressed.len()).map_err(|_| FormatError::InvalidField {
        field: "comp_size",
        value: compressed.len() as i64,
    })?;

    let header = ArchiveHeader {
        codec,
        version: ARCHIVE_VERSION,
        flags: 0,
        orig_size: data.len() as u64,
        comp_size,
        crc32: crc32fast::hash(data),
        name: name.to_owned(),
    };
    let mut out = Vec::with_capacity(header.encoded_len() + compressed.len());
    header.write_to(&mut out)?;
    out.extend_from_slice(&compressed);

    if out.len() >= data.len() {
        log::warn!(
            "archive did not reduce size ({} >= {} bytes)",
            out.len(),
            data.len()
        );
    }
    Ok(out)
}

/// Wraps a ZLF archive in an ELF that runs `stub`.
pub fn wrap_sfx(zlf: &[u8], e_machine: u16, stub: &[u8]) -> Result<Vec<u8>> {
    let ehdr = Elf64Ehdr::new(ET_DYN, e_machine, SFX_STUB_VADDR, 2);
    let mut out = Vec::with_capacity(SFX_STUB_OFFSET as usize + stub.len() + zlf.len() + SFX_FOOTER_LEN);
    ehdr.write_to(&mut out)?;
    Elf64Phdr {
        p_type: PT_LOAD,
        p_flags: PF_R | PF_X,
        p_offset: SFX_STUB_OFFSET,
        p_vaddr: SFX_STUB_VADDR,
        p_paddr: SFX_STUB_VADDR,
        p_filesz: stub.len() as u64,
        p_memsz: stub.len() as u64,
        p_align: PAGE_SIZE,
    }
    .write_to(&mut out)?;
    Elf64Phdr {
        p_type: PT_GNU_STACK,
        p_flags: PF_R | PF_W,
        p_align: 16,
        ..Elf64Phdr::default()
    }
    .write_to(&mut out)?;

    out.resize(SFX_STUB_OFFSET as usize, 0);
    out.extend_from_slice(stub);
    out.extend_from_slice(zlf);

    out.write_u64::<LE>(SFX_FOOTER_MAGIC)?;
    out.write_u32::<LE>(SFX_FOOTER_VERSION)?;
    out.write_u32::<LE>(0)?;
    out.write_u64::<LE>(SFX_STUB_OFFSET + stub.len() as u64)?;
    out.write_u64::<LE>(zlf.len() as u64)?;
    Ok(out)
}

/// Decompresses the archive in `bytes`, checking its size and CRC32.
pub fn extract(bytes: &[u8]) -> Result<(Archive, Vec<u8>)> {
    let archive = open(bytes)?;
    let header = &archive.header;
    if header.orig_size > MAX_ARCHIVE_ORIG {
        return Err(FormatError::InvalidField {
            field: "orig_size",
            value: header.orig_size as i64,
        }
        .into());
    }
    let orig = header.orig_size as usize;

    let mut out = vec![0u8; orig];
    let n = header
        .codec
        .backend()?
        .decompress(&bytes[archive.payload.clone()], &mut out)?;
    if n != orig {
        return Err(CodecError::SizeMismatch {
            codec: header.codec.display_name(),
            expected: orig,
            actual: n,
        }
        .into());
    }

    let actual = crc32fast::hash(&out);
    if actual != header.crc32 {
        return Err(FormatError::ChecksumMismatch {
            expected: header.crc32,
            actual,
        }
        .into());
    }
    Ok((archive, out))
}

fn host_target() -> (u16, Arch) {
    if cfg!(target_arch = "aarch64") {
        (EM_AARCH64, Arch::Arm64)
    } else {
        (EM_X86_64, Arch::X86)
    }
}

#[derive(Debug, Clone)]
pub struct ArchiveOptions {
    pub codec: CodecKind,
    pub kind: ArchiveKind,
    /// Extractor stub for SFX output instead of the placeholder.
    pub stub: Option<Vec<u8>>,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        ArchiveOptions {
            codec: CodecKind::Lz4,
            kind: ArchiveKind::Plain,
            stub: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveReport {
    pub kind: ArchiveKind,
    pub codec: CodecKind,
    pub name: String,
    pub orig_size: usize,
    pub comp_size: usize,
    pub archive_size: usize,
    pub crc32: u32,
    pub output: PathBuf,
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "archive".into())
}

/// Default archive path: the input path with `.zlf` or `.sfx` appended.
pub fn default_archive_path(input: &Path, kind: ArchiveKind) -> PathBuf {
    let mut s = input.as_os_str().to_owned();
    s.push(kind.extension());
    PathBuf::from(s)
}

/// Archives `input` into `output`: a directory receives `<name>.zlf`/`.sfx`,
/// `None` means [`default_archive_path`].
pub fn archive_file(
    input: &Path,
    output: Option<&Path>,
    options: &ArchiveOptions,
    resources: &SystemResources,
) -> Result<ArchiveReport> {
    let data = fs::read(input).map_err(|e| Error::file(input, e))?;
    let name = file_name_of(input);
    log::info!("archiving {} ({} bytes) with {}", input.display(), data.len(), options.codec);

    let zlf = create(&data, &name, options.codec, resources)?;
    let (header, _) = ArchiveHeader::parse(&zlf)?;
    let bytes = match options.kind {
        ArchiveKind::Plain => zlf,
        ArchiveKind::SelfExtracting => {
            let (machine, arch) = host_target();
            let stub = options.stub.as_deref().unwrap_or_else(|| placeholder_stub(arch));
            wrap_sfx(&zlf, machine, stub)?
        }
    };

    let path = match output {
        Some(dir) if dir.is_dir() => dir.join(format!("{name}{}", options.kind.extension())),
        Some(p) => p.to_path_buf(),
        None => default_archive_path(input, options.kind),
    };
    match options.kind {
        ArchiveKind::Plain => fs::write(&path, &bytes).map_err(|e| Error::file(&path, e))?,
        ArchiveKind::SelfExtracting => write_executable(&path, &bytes, 0o755)?,
    }
    log::info!("wrote {} ({} bytes)", path.display(), bytes.len());

    Ok(ArchiveReport {
        kind: options.kind,
        codec: options.codec,
        name,
        orig_size: data.len(),
        comp_size: header.comp_size as usize,
        archive_size: bytes.len(),
        crc32: header.crc32,
        output: path,
    })
}

/// Safe file name for extracted data: the stored name's last component, or
/// the archive's own name without `.zlf`, or with `.unpacked` appended.
fn extracted_name(stored: &str, input: &Path) -> String {
    if let Some(name) = Path::new(stored).file_name() {
        return name.to_string_lossy().into_owned();
    }
    let base = file_name_of(input);
    match base.strip_suffix(".zlf") {
        Some(stem) if !stem.is_empty() => stem.to_owned(),
        _ => format!("{base}.unpacked"),
    }
}

/// Lists the archive in `input` without decompressing it.
pub fn inspect_file(input: &Path) -> Result<Archive> {
    let bytes = fs::read(input).map_err(|e| Error::file(input, e))?;
    open(&bytes)
}

/// Extracts the archive in `input`. The default destination is the stored
/// name next to the archive; a directory `output` receives the stored name.
pub fn extract_file(input: &Path, output: Option<&Path>) -> Result<ArchiveReport> {
    let bytes = fs::read(input).map_err(|e| Error::file(input, e))?;
    let (archive, data) = extract(&bytes)?;
    let header = &archive.header;
    if header.is_tar() {
        log::warn!("directory archive: writing the raw tar stream");
    }

    let name = extracted_name(&header.name, input);
    let path = match output {
        Some(dir) if dir.is_dir() => dir.join(&name),
        Some(p) => p.to_path_buf(),
        None => input.parent().unwrap_or(Path::new(".")).join(&name),
    };
    fs::write(&path, &data).map_err(|e| Error::file(&path, e))?;
    log::info!("extracted {} bytes to {}", data.len(), path.display());

    Ok(ArchiveReport {
        kind: archive.kind,
        codec: header.codec,
        name: header.name.clone(),
        orig_size: data.len(),
        comp_size: header.comp_size as usize,
        archive_size: bytes.len(),
        crc32: header.crc32,
        output: path,
    })
}
