//! Fixed-schema statistics over an ELF's loadable segments, fed to the filter
//! classifier.
//!
//! Segments are grouped as text (`PF_X`), read-only (R and not W) and data
//! (W). Counts are raw, ratios are in `[0, 1]` and entropies are bits per byte.

use crate::binary::ElfImage;
use crate::segments::{SegmentClass, SegmentInfo};

macro_rules! features {
    ($($variant:ident => $name:literal,)*) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Feature {
            $($variant,)*
        }

        impl Feature {
            pub const ALL: &'static [Feature] = &[$(Feature::$variant,)*];

            pub fn name(self) -> &'static str {
                match self {
                    $(Feature::$variant => $name,)*
                }
            }
        }
    };
}

features! {
    FileSize => "file_size",
    EType => "etype",
    HasInterp => "has_interp",
    NLoad => "n_load",
    TextSize => "text_sz",
    RoSize => "ro_sz",
    DataSize => "data_sz",
    TextRatio => "text_ratio",
    RoRatio => "ro_ratio",
    DataRatio => "data_ratio",
    TextEntropy => "text_entropy",
    RoEntropy => "ro_entropy",
    DataEntropy => "data_entropy",
    ZerosRatioTotal => "zeros_ratio_total",
    ZeroRuns16 => "zero_runs_16",
    ZeroRuns32 => "zero_runs_32",
    AsciiRatioRodata => "ascii_ratio_rodata",
    E8Count => "e8_cnt",
    E9Count => "e9_cnt",
    FfCallJmpCount => "ff_calljmp_cnt",
    EbCount => "eb_cnt",
    Jcc32Count => "jcc32_cnt",
    BranchDensityPerKb => "branch_density_per_kb",
    RipRelEstimate => "riprel_estimate",
    NopRatioText => "nop_ratio_text",
    Imm64MovCount => "imm64_mov_cnt",
    AlignPadRatio => "align_pad_ratio",
    RoPtrLikeCount => "ro_ptr_like_cnt",
    Rel32InTextRatio => "rel32_intext_ratio",
    Rel32InTextCount => "rel32_intext_cnt",
    Rel32DispEntropy8 => "rel32_disp_entropy8",
    XLoadCount => "x_load_cnt",
    RoLoadCount => "ro_load_cnt",
    RwLoadCount => "rw_load_cnt",
    BssSize => "bss_sz",
    AvgPAlignLog2 => "avg_p_align_log2",
    MaxPAlignLog2 => "max_p_align_log2",
    RetCount => "ret_cnt",
    RelBranchRatio => "rel_branch_ratio",
    AvgRel32Abs => "avg_rel32_abs",
    MaxRel32Abs => "max_rel32_abs",
}

pub const FEATURE_COUNT: usize = 41;

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector {
    values: [f64; FEATURE_COUNT],
}

impl Default for FeatureVector {
    fn default() -> Self {
        FeatureVector {
            values: [0.0; FEATURE_COUNT],
        }
    }
}

impl FeatureVector {
    pub fn get(&self, feature: Feature) -> f64 {
        self.values[feature as usize]
    }

    pub fn set(&mut self, feature: Feature, value: f64) {
        self.values[feature as usize] = value;
    }

    /// Values in schema order.
    pub fn as_slice(&self) -> &[f64] {
        &self.values
    }

    pub fn iter(&self) -> impl Iterator<Item = (Feature, f64)> + '_ {
        Feature::ALL.iter().map(move |&f| (f, self.get(f)))
    }
}

fn entropy(hist: &[u64; 256]) -> f64 {
    let total: u64 = hist.iter().sum();
    if total == 0 {
        return 0.0;
    }
    hist.iter()
        .filter(|&&n| n != 0)
        .map(|&n| {
            let p = n as f64 / total as f64;
            -p * p.log2()
        })
        .sum()
}

fn ratio(num: u64, den: u64) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

fn zero_runs_at_least(p: &[u8], threshold: usize) -> u64 {
    let mut runs = 0;
    let mut i = 0;
    while i < p.len() {
        if p[i] != 0 {
            i += 1;
            continue;
        }
        let start = i;
        while i < p.len() && p[i] == 0 {
            i += 1;
        }
        if i - start >= threshold {
            runs += 1;
        }
    }
    runs
}

/// 8-byte aligned words whose low 12 bits are clear.
fn page_aligned_words(p: &[u8]) -> u64 {
    p.chunks_exact(8)
        .filter(|w| {
            let v = u64::from_le_bytes([w[0], w[1], w[2], w[3], w[4], w[5], w[6], w[7]]);
            v & 0xFFF == 0
        })
        .count() as u64
}

/// Accumulators for the executable segments.
struct TextStats {
    size: u64,
    hist: [u64; 256],
    e8: u64,
    e9: u64,
    ff_calljmp: u64,
    eb: u64,
    jcc32: u64,
    riprel: u64,
    imm64: u64,
    ret: u64,
    nop_bytes: u64,
    pad_bytes: u64,
    disp_top_hist: [u64; 256],
    rel32_in_text: u64,
    rel32_abs_sum: u64,
    rel32_abs_max: u64,
}

impl Default for TextStats {
    fn default() -> Self {
        TextStats {
            size: 0,
            hist: [0; 256],
            e8: 0,
            e9: 0,
            ff_calljmp: 0,
            eb: 0,
            jcc32: 0,
            riprel: 0,
            imm64: 0,
            ret: 0,
            nop_bytes: 0,
            pad_bytes: 0,
            disp_top_hist: [0; 256],
            rel32_in_text: 0,
            rel32_abs_sum: 0,
            rel32_abs_max: 0,
        }
    }
}

impl TextStats {
    fn scan(&mut self, seg: &SegmentInfo, p: &[u8], text_ranges: &[(u64, u64)]) {
        self.size += p.len() as u64;
        for &b in p {
            self.hist[b as usize] += 1;
        }
        self.eb += p.iter().filter(|&&b| b == 0xEB).count() as u64;
        self.nop_bytes += p.iter().filter(|&&b| b == 0x90).count() as u64;

        for (j, w) in p.windows(5).enumerate() {
            if w[0] != 0xE8 && w[0] != 0xE9 {
                continue;
            }
            if w[0] == 0xE8 {
                self.e8 += 1;
            } else {
                self.e9 += 1;
            }
            let disp = i32::from_le_bytes([w[1], w[2], w[3], w[4]]);
            self.disp_top_hist[w[4] as usize] += 1;

            let abs = u64::from(disp.unsigned_abs());
            self.rel32_abs_sum += abs;
            self.rel32_abs_max = self.rel32_abs_max.max(abs);

            let target = seg
                .vaddr
                .wrapping_add(j as u64 + 5)
                .wrapping_add(disp as i64 as u64);
            if text_ranges.iter().any(|&(lo, hi)| target >= lo && target < hi) {
                self.rel32_in_text += 1;
            }
        }

        // runs of 4+ identical 0x00 or 0x90 bytes count as alignment padding
        let mut j = 0;
        while j < p.len() {
            let b = p[j];
            if b != 0x00 && b != 0x90 {
                j += 1;
                continue;
            }
            let start = j;
            while j < p.len() && p[j] == b {
                j += 1;
            }
            if j - start >= 4 {
                self.pad_bytes += (j - start) as u64;
            }
        }

        for w in p.windows(2) {
            match w {
                [0x0F, op] if op & 0xF0 == 0x80 => self.jcc32 += 1,
                [0xFF, modrm] if matches!((modrm >> 3) & 7, 2 | 4) => self.ff_calljmp += 1,
                [0x48, 0xB8..=0xBF] => self.imm64 += 1,
                _ => {}
            }
        }
        for w in p.windows(3) {
            if w[0] == 0x48 && (w[1] == 0x8B || w[1] == 0x8D) && w[2] >> 6 == 0 && w[2] & 7 == 5 {
                self.riprel += 1;
            }
        }
        for (t, &b) in p.iter().enumerate() {
            if b == 0xC3 || (b == 0xC2 && t + 2 < p.len()) {
                self.ret += 1;
            }
        }
    }
}

/// Computes the feature vector of `image`. Segments whose file range falls
/// outside the image are skipped.
pub fn extract(image: &ElfImage) -> FeatureVector {
    let segments = &image.segments;
    let text_ranges: Vec<(u64, u64)> = segments
        .iter()
        .filter(|s| s.flags.x)
        .map(|s| (s.vaddr, s.vaddr.saturating_add(s.filesz)))
        .collect();

    let mut text = TextStats::default();
    let mut ro_hist = [0u64; 256];
    let mut data_hist = [0u64; 256];
    let (mut ro_size, mut data_size) = (0u64, 0u64);
    let (mut text_zeros, mut ro_zeros) = (0u64, 0u64);
    let mut ro_ascii = 0u64;
    let (mut zero_runs_16, mut zero_runs_32, mut ro_ptr_like) = (0u64, 0u64, 0u64);

    for seg in segments {
        let Some(p) = seg.bytes(&image.bytes).filter(|p| !p.is_empty()) else {
            continue;
        };
        let class = seg.flags.class();
        match class {
            SegmentClass::Text => {
                text.scan(seg, p, &text_ranges);
                text_zeros += p.iter().filter(|&&b| b == 0).count() as u64;
            }
            SegmentClass::ReadOnly => {
                ro_size += p.len() as u64;
                for &b in p {
                    ro_hist[b as usize] += 1;
                    if (0x20..=0x7E).contains(&b) || matches!(b, b'\t' | b'\n' | b'\r') {
                        ro_ascii += 1;
                    }
                }
                ro_zeros += p.iter().filter(|&&b| b == 0).count() as u64;
                ro_ptr_like += page_aligned_words(p);
            }
            SegmentClass::Data => {
                data_size += p.len() as u64;
                for &b in p {
                    data_hist[b as usize] += 1;
                }
            }
            SegmentClass::Other => {}
        }
        if matches!(class, SegmentClass::Text | SegmentClass::ReadOnly) {
            zero_runs_16 += zero_runs_at_least(p, 16);
            zero_runs_32 += zero_runs_at_least(p, 32);
        }
    }

    let file_size = image.len() as u64;
    let text_kb = if text.size > 0 {
        text.size as f64 / 1024.0
    } else {
        1.0
    };
    let rel32 = text.e8 + text.e9;
    let rel_branches = (rel32 + text.jcc32 + text.eb) as f64;
    let abs_branches = text.ff_calljmp as f64;

    let count_class = |class: SegmentClass| {
        segments.iter().filter(|s| s.flags.class() == class).count() as f64
    };
    let bss: u64 = segments
        .iter()
        .map(|s| s.memsz.saturating_sub(s.filesz))
        .sum();
    let align_log2: Vec<f64> = segments
        .iter()
        .map(|s| if s.align > 1 { f64::from(s.align.ilog2()) } else { 0.0 })
        .collect();

    let mut fv = FeatureVector::default();
    use Feature::*;
    fv.set(FileSize, file_size as f64);
    fv.set(EType, f64::from(image.header.e_type));
    fv.set(HasInterp, if image.has_interp { 1.0 } else { 0.0 });
    fv.set(NLoad, segments.len() as f64);
    fv.set(TextSize, text.size as f64);
    fv.set(RoSize, ro_size as f64);
    fv.set(DataSize, data_size as f64);
    fv.set(TextRatio, ratio(text.size, file_size));
    fv.set(RoRatio, ratio(ro_size, file_size));
    fv.set(DataRatio, ratio(data_size, file_size));
    fv.set(TextEntropy, entropy(&text.hist));
    fv.set(RoEntropy, entropy(&ro_hist));
    fv.set(DataEntropy, entropy(&data_hist));
    fv.set(ZerosRatioTotal, ratio(text_zeros + ro_zeros, text.size + ro_size));
    fv.set(ZeroRuns16, zero_runs_16 as f64);
    fv.set(ZeroRuns32, zero_runs_32 as f64);
    fv.set(AsciiRatioRodata, ratio(ro_ascii, ro_size));
    fv.set(E8Count, text.e8 as f64);
    fv.set(E9Count, text.e9 as f64);
    fv.set(FfCallJmpCount, text.ff_calljmp as f64);
    fv.set(EbCount, text.eb as f64);
    fv.set(Jcc32Count, text.jcc32 as f64);
    fv.set(BranchDensityPerKb, (rel32 + text.ff_calljmp) as f64 / text_kb);
    fv.set(RipRelEstimate, text.riprel as f64);
    fv.set(NopRatioText, ratio(text.nop_bytes, text.size));
    fv.set(Imm64MovCount, text.imm64 as f64);
    fv.set(AlignPadRatio, ratio(text.pad_bytes, text.size));
    fv.set(RoPtrLikeCount, ro_ptr_like as f64);
    fv.set(Rel32InTextRatio, ratio(text.rel32_in_text, rel32));
    fv.set(Rel32InTextCount, text.rel32_in_text as f64);
    fv.set(Rel32DispEntropy8, entropy(&text.disp_top_hist));
    fv.set(XLoadCount, count_class(SegmentClass::Text));
    fv.set(RoLoadCount, count_class(SegmentClass::ReadOnly));
    fv.set(RwLoadCount, count_class(SegmentClass::Data));
    fv.set(BssSize, bss as f64);
    if !align_log2.is_empty() {
        fv.set(AvgPAlignLog2, align_log2.iter().sum::<f64>() / align_log2.len() as f64);
        fv.set(MaxPAlignLog2, align_log2.iter().cloned().fold(0.0, f64::max));
    }
    fv.set(RetCount, text.ret as f64);
    if rel_branches + abs_branches > 0.0 {
        fv.set(RelBranchRatio, rel_branches / (rel_branches + abs_branches));
    }
    fv.set(AvgRel32Abs, ratio(text.rel32_abs_sum, rel32));
    fv.set(MaxRel32Abs, text.rel32_abs_max as f64);

    log::debug!(
        "features: text {} B, e8 {}, e9 {}, rel32 in text {:.2}",
        text.size,
        text.e8,
        text.e9,
        fv.get(Rel32InTextRatio)
    );
    fv
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_has_fixed_order() {
        assert_eq!(Feature::ALL.len(), FEATURE_COUNT);
        assert_eq!(Feature::FileSize as usize, 0);
        assert_eq!(Feature::E8Count as usize, 17);
        assert_eq!(Feature::Rel32InTextRatio as usize, 28);
        assert_eq!(Feature::MaxRel32Abs as usize, 40);
        assert_eq!(Feature::MaxRel32Abs.name(), "max_rel32_abs");
    }

    #[test]
    fn entropy_bounds() {
        let mut hist = [0u64; 256];
        assert_eq!(entropy(&hist), 0.0);
        hist[7] = 100;
        assert_eq!(entropy(&hist), 0.0);
        let uniform = [1u64; 256];
        assert!((entropy(&uniform) - 8.0).abs() < 1e-9);
    }

    #[test]
    fn zero_runs_respect_threshold() {
        let mut p = vec![1u8; 100];
        p[10..26].fill(0);
        p[40..80].fill(0);
        assert_eq!(zero_runs_at_least(&p, 16), 2);
        assert_eq!(zero_runs_at_least(&p, 32), 1);
    }

    #[test]
    fn page_aligned_words_counts_low_bits_clear() {
        let mut p = Vec::new();
        p.extend_from_slice(&0x40_1000u64.to_le_bytes());
        p.extend_from_slice(&0x40_1008u64.to_le_bytes());
        p.extend_from_slice(&0u64.to_le_bytes());
        p.extend_from_slice(&[0u8; 5]);
        assert_eq!(page_aligned_words(&p), 2);
    }

    #[test]
    fn text_scan_counts_branches() {
        let seg = SegmentInfo {
            offset: 0,
            vaddr: 0x1000,
            filesz: 32,
            memsz: 32,
            align: 0x1000,
            flags: crate::segments::SegmentFlags::from_bits(5),
        };
        // call +0 lands inside the segment, jmp far away does not
        let mut p = vec![0xCCu8; 32];
        p[0..5].copy_from_slice(&[0xE8, 0, 0, 0, 0]);
        p[5..10].copy_from_slice(&[0xE9, 0, 0, 0, 0x10]);
        p[10..12].copy_from_slice(&[0x0F, 0x85]);
        p[12..14].copy_from_slice(&[0xFF, 0xD0]);
        p[14] = 0xC3;
        let mut t = TextStats::default();
        t.scan(&seg, &p, &[(0x1000, 0x1020)]);
        assert_eq!((t.e8, t.e9, t.jcc32, t.ff_calljmp, t.ret), (1, 1, 1, 1, 1));
        assert_eq!(t.rel32_in_text, 1);
        assert_eq!(t.rel32_abs_max, 0x1000_0000);
    }
}
