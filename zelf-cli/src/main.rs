use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde::Serialize;
use std::path::PathBuf;
use tabled::settings::Style;
use tabled::{Table, Tabled};
use zelf_core::archive::{self, Archive, ArchiveKind, ArchiveOptions, ArchiveReport};
use zelf_core::depack::{self, Inspection};
use zelf_core::{
    AddressMode, CodecKind, DepackOptions, Depacker, FilterChoice, MismatchPolicy,
    PackOptions, PackReport, Packer, SystemResources,
};

/// ELF executable packer
#[derive(Parser)]
#[command(
    name = "zelf",
    about = "Compress ELF executables into self-describing packed binaries and restore them",
    version,
    author
)]
struct Cli {
    /// Debug logging (RUST_LOG still wins when set)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Pack an ELF executable
    Pack {
        input: PathBuf,
        /// Output path (default: <input>.zelf)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Codec name or two-letter marker suffix
        #[arg(short, long, default_value = "lz4")]
        codec: CodecKind,
        /// auto, none, bcj or kanzi
        #[arg(short, long, default_value = "auto")]
        filter: FilterChoice,
        /// Emit a position-independent (ET_DYN) image
        #[arg(long, conflicts_with = "static_image")]
        pie: bool,
        /// Emit a fixed-address (ET_EXEC) image
        #[arg(long = "static")]
        static_image: bool,
        /// Keep the result even if it is not smaller than the input
        #[arg(long)]
        allow_growth: bool,
        /// Try every available codec with every filter and keep the smallest
        #[arg(long, conflicts_with_all = ["codec", "filter"])]
        best: bool,
        /// Seal the artifact with a password
        #[arg(long)]
        password: Option<String>,
        /// Drop section headers and unmapped trailing bytes before packing
        #[arg(long)]
        strip: bool,
        /// Replace the input with the packed result
        #[arg(long, conflicts_with_all = ["output", "best"])]
        in_place: bool,
        /// Do not keep <input>.bak when packing in place
        #[arg(long, requires = "in_place")]
        no_backup: bool,
    },
    /// Restore the original executable from a packed one
    Unpack {
        input: PathBuf,
        /// Output path (default: <input>.unpacked)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Fail instead of keeping filtered bytes when the Kanzi inverse mismatches
        #[arg(long)]
        strict_unfilter: bool,
        /// Password to check against a sealed artifact
        #[arg(long)]
        password: Option<String>,
    },
    /// Describe the container inside a packed executable
    Inspect {
        input: PathBuf,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Compress any file into a ZLF archive
    Archive {
        input: PathBuf,
        /// Output file or directory (default: <input>.zlf or <input>.sfx)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Codec name or two-letter marker suffix
        #[arg(short, long, default_value = "lz4")]
        codec: CodecKind,
        /// Wrap the archive in a self-extracting ELF
        #[arg(long)]
        sfx: bool,
    },
    /// Restore the file stored in a ZLF or self-extracting archive
    Extract {
        input: PathBuf,
        /// Output file or directory (default: stored name next to the archive)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Show the header of a ZLF or self-extracting archive
    List {
        input: PathBuf,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// List codecs and their availability
    Codecs {
        /// Input size used for the memory estimate
        #[arg(long, default_value_t = 1 << 20)]
        size: u64,
    },
}

#[derive(Serialize)]
struct ParamsJson {
    offset: usize,
    version: u64,
    virtual_start: u64,
    packed_data_vaddr: u64,
    bcj: bool,
    kanzi: bool,
    sealed: bool,
}

#[derive(Serialize)]
struct InspectJson {
    discovery: String,
    container_offset: usize,
    codec: String,
    suffix: String,
    layout: String,
    layout_source: String,
    bcj: bool,
    orig_size: u64,
    entry_offset: u64,
    comp_size: i32,
    filtered_size: Option<i32>,
    payload_start: usize,
    payload_end: usize,
    params: Option<ParamsJson>,
}

impl From<&Inspection> for InspectJson {
    fn from(i: &Inspection) -> Self {
        let header = i.header();
        InspectJson {
            discovery: i.discovery.to_string(),
            container_offset: i.container.offset,
            codec: header.codec.to_string(),
            suffix: String::from_utf8_lossy(&header.codec.suffix()).into_owned(),
            layout: i.decision.layout.to_string(),
            layout_source: i.decision.source.to_string(),
            bcj: i.decision.bcj,
            orig_size: header.orig_size,
            entry_offset: header.entry_offset,
            comp_size: header.comp_size,
            filtered_size: header.filtered_size,
            payload_start: i.container.payload.start,
            payload_end: i.container.payload.end,
            params: i.params.map(|p| ParamsJson {
                offset: p.offset,
                version: p.block.version,
                virtual_start: p.block.virtual_start,
                packed_data_vaddr: p.block.packed_data_vaddr,
                bcj: p.block.bcj(),
                kanzi: p.block.kanzi(),
                sealed: p.block.seal.is_some(),
            }),
        }
    }
}

#[derive(Serialize)]
struct ArchiveJson {
    kind: String,
    name: String,
    codec: String,
    version: u32,
    tar: bool,
    orig_size: u64,
    comp_size: u32,
    crc32: String,
}

impl From<&Archive> for ArchiveJson {
    fn from(a: &Archive) -> Self {
        ArchiveJson {
            kind: a.kind.to_string(),
            name: a.header.name.clone(),
            codec: a.header.codec.to_string(),
            version: a.header.version,
            tar: a.header.is_tar(),
            orig_size: a.header.orig_size,
            comp_size: a.header.comp_size,
            crc32: format!("{:08x}", a.header.crc32),
        }
    }
}

#[derive(Tabled)]
struct CodecRow {
    #[tabled(rename = "Suffix")]
    suffix: String,
    #[tabled(rename = "Codec")]
    name: &'static str,
    #[tabled(rename = "Backend")]
    backend: &'static str,
    #[tabled(rename = "Scan")]
    scan: &'static str,
    #[tabled(rename = "Layout")]
    layout: &'static str,
    #[tabled(rename = "Est. memory")]
    memory: String,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default)).init();
}

fn print_pack_report(report: &PackReport) {
    println!(
        "{} {} -> {} bytes ({:.1}%)",
        "packed".green().bold(),
        report.input_size,
        report.packed_size,
        report.ratio() * 100.0
    );
    println!("  codec:     {} ({})", report.codec, String::from_utf8_lossy(&report.codec.suffix()));
    if report.requested_filter != report.filter {
        println!(
            "  filter:    {} ({} refused)",
            report.filter,
            report.requested_filter.to_string().yellow()
        );
    } else {
        println!("  filter:    {}", report.filter);
    }
    if report.stripped() {
        println!(
            "  stripped:  {} -> {} bytes",
            report.input_size, report.orig_size
        );
    }
    println!("  layout:    {}", report.layout);
    println!("  mode:      {}", report.address_mode);
    println!("  container: 0x{:x} ({} bytes compressed)", report.container_offset, report.comp_size);
    if report.packed_data_vaddr != 0 {
        println!("  vaddr:     0x{:x}", report.packed_data_vaddr);
    }
    if report.sealed {
        println!("  sealed:    yes");
    }
    if let Some(path) = &report.output {
        println!("  output:    {}", path.display());
    }
}

fn print_inspection(i: &Inspection) {
    let header = i.header();
    println!("{} 0x{:x} ({})", "container".cyan().bold(), i.container.offset, i.discovery);
    println!(
        "  marker:        {}",
        String::from_utf8_lossy(&header.marker())
    );
    println!("  codec:         {}", header.codec);
    println!("  orig_size:     {}", header.orig_size);
    println!("  entry_offset:  0x{:x}", header.entry_offset);
    println!("  comp_size:     {}", header.comp_size);
    match header.filtered_size {
        Some(fs) => println!("  filtered_size: {fs}"),
        None => println!("  filtered_size: -"),
    }
    let source = i.decision.source.to_string();
    let source = if i.decision.source == zelf_core::LayoutSource::Heuristic {
        source.yellow().to_string()
    } else {
        source
    };
    println!("  layout:        {} via {} (bcj {})", i.decision.layout, source, i.decision.bcj);

    match &i.params {
        Some(p) => {
            println!("{} 0x{:x}", "params".cyan().bold(), p.offset);
            println!("  version:           0x{:x}", p.block.version);
            println!("  virtual_start:     0x{:x}", p.block.virtual_start);
            println!("  packed_data_vaddr: 0x{:x}", p.block.packed_data_vaddr);
            println!("  bcj / kanzi:       {} / {}", p.block.bcj(), p.block.kanzi());
            println!("  sealed:            {}", p.block.seal.is_some());
        }
        None => println!("{} none", "params".cyan().bold()),
    }
}

fn print_archive_report(verb: &str, report: &ArchiveReport) {
    println!(
        "{} {} ({} -> {} bytes, {})",
        verb.green().bold(),
        report.name,
        report.orig_size,
        report.archive_size,
        report.kind
    );
    println!("  codec:  {}", report.codec);
    println!("  crc32:  {:08x}", report.crc32);
    println!("  output: {}", report.output.display());
}

fn print_archive(a: &Archive) {
    let header = &a.header;
    println!("{} {}", a.kind.to_string().cyan().bold(), header.name);
    println!("  version:   {}", header.version);
    println!("  codec:     {}", header.codec);
    println!("  orig_size: {}", header.orig_size);
    println!("  comp_size: {}", header.comp_size);
    println!("  crc32:     {:08x}", header.crc32);
    if header.is_tar() {
        println!("  contents:  {}", "tar stream".yellow());
    }
}

fn codec_rows(size: u64) -> Vec<CodecRow> {
    CodecKind::ALL
        .into_iter()
        .map(|k| CodecRow {
            suffix: String::from_utf8_lossy(&k.suffix()).into_owned(),
            name: k.display_name(),
            backend: if k.is_available() { "linked" } else { "unavailable" },
            scan: if k.is_scan_visible() { "yes" } else { "params only" },
            layout: if k.forces_legacy_layout() { "legacy" } else { "either" },
            memory: k
                .working_set(size)
                .map(|b| format!("{} MiB", b >> 20))
                .unwrap_or_else(|| "-".into()),
        })
        .collect()
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Command::Pack {
            input,
            output,
            codec,
            filter,
            pie,
            static_image,
            allow_growth,
            best,
            password,
            strip,
            in_place,
            no_backup,
        } => {
            let address_mode = match (pie, static_image) {
                (true, _) => Some(AddressMode::PositionIndependent),
                (_, true) => Some(AddressMode::Static),
                _ => None,
            };
            let packer = Packer::new(PackOptions {
                codec,
                filter,
                address_mode,
                allow_growth,
                password,
                strip,
                stub: None,
            });

            let report = if in_place {
                packer.pack_in_place(&input, !no_backup)
            } else if best {
                let candidates: Vec<CodecKind> =
                    CodecKind::ALL.into_iter().filter(|k| k.is_available()).collect();
                packer.pack_best_file(&input, output.as_deref(), &candidates)
            } else {
                packer.pack_file(&input, output.as_deref())
            }
            .with_context(|| format!("failed to pack {}", input.display()))?;
            print_pack_report(&report);
        }

        Command::Unpack {
            input,
            output,
            strict_unfilter,
            password,
        } => {
            let depacker = Depacker::new(DepackOptions {
                mismatch_policy: if strict_unfilter {
                    MismatchPolicy::Strict
                } else {
                    MismatchPolicy::Lenient
                },
                password,
                ..DepackOptions::default()
            });
            let report = depacker
                .unpack_file(&input, output.as_deref())
                .with_context(|| format!("failed to unpack {}", input.display()))?;

            let status = if report.recovered {
                "recovered".yellow().bold()
            } else {
                "unpacked".green().bold()
            };
            println!(
                "{status} {} bytes ({}, {} filter, {})",
                report.output_len,
                report.inspection.codec(),
                report.filter,
                report.inspection.discovery
            );
            if let Some(path) = &report.output {
                println!("  output: {}", path.display());
            }
            if report.recovered {
                println!(
                    "  {}",
                    "Kanzi inverse did not match; the output is still filtered".yellow()
                );
            }
        }

        Command::Inspect { input, json } => {
            let bytes = std::fs::read(&input)
                .with_context(|| format!("failed to read {}", input.display()))?;
            let inspection = depack::inspect(&bytes)
                .with_context(|| format!("no usable container in {}", input.display()))?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&InspectJson::from(&inspection))?
                );
            } else {
                print_inspection(&inspection);
            }
        }

        Command::Archive {
            input,
            output,
            codec,
            sfx,
        } => {
            let options = ArchiveOptions {
                codec,
                kind: if sfx {
                    ArchiveKind::SelfExtracting
                } else {
                    ArchiveKind::Plain
                },
                ..ArchiveOptions::default()
            };
            let report = archive::archive_file(
                &input,
                output.as_deref(),
                &options,
                &SystemResources::detect(),
            )
            .with_context(|| format!("failed to archive {}", input.display()))?;
            print_archive_report("archived", &report);
        }

        Command::Extract { input, output } => {
            let report = archive::extract_file(&input, output.as_deref())
                .with_context(|| format!("failed to extract {}", input.display()))?;
            print_archive_report("extracted", &report);
        }

        Command::List { input, json } => {
            let found = archive::inspect_file(&input)
                .with_context(|| format!("no archive in {}", input.display()))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&ArchiveJson::from(&found))?);
            } else {
                print_archive(&found);
            }
        }

        Command::Codecs { size } => {
            if size == 0 {
                bail!("--size must be positive");
            }
            let resources = SystemResources::detect();
            let mut table = Table::new(codec_rows(size));
            table.with(Style::modern());
            println!("{table}");
            match resources.available_ram {
                Some(ram) => println!("available RAM: {} MiB", ram >> 20),
                None => println!("available RAM: unknown"),
            }
            for k in CodecKind::ALL {
                if let Err(e) = resources.admit(k, size) {
                    println!("{} {e}", "refused".red().bold());
                }
            }
        }
    }

    Ok(())
}
