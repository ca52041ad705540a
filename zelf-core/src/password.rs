//! Password seal stored in a version-2 ParamsBlock.

use crate::params::PasswordSeal;
use std::io::Read;
use std::time::{SystemTime, UNIX_EPOCH};

/// Offset basis used by every stub and depacker of this format. It is not
/// the textbook FNV-1a-64 basis (0xcbf29ce484222325); artifacts depend on it.
const FNV_OFFSET: u64 = 1_469_598_103_934_665_603;
const FNV_PRIME: u64 = 1_099_511_628_211;
const GOLDEN: u64 = 0x9E37_79B9_7F4A_7C15;

fn fnv1a64(h: u64, bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .fold(h, |h, &b| (h ^ u64::from(b)).wrapping_mul(FNV_PRIME))
}

fn mask(salt: u64) -> u64 {
    salt.wrapping_mul(GOLDEN) ^ (salt >> 13)
}

/// Obfuscated hash of `password` under `salt`.
pub fn obfuscated_hash(salt: u64, password: &[u8]) -> u64 {
    let h = fnv1a64(FNV_OFFSET, &salt.to_le_bytes());
    fnv1a64(h, password) ^ mask(salt)
}

pub fn seal(password: &[u8]) -> PasswordSeal {
    let salt = fresh_salt();
    log::debug!("password seal salt {salt:#x}");
    PasswordSeal {
        salt,
        obfhash: obfuscated_hash(salt, password),
    }
}

pub fn verify(seal: &PasswordSeal, password: &[u8]) -> bool {
    obfuscated_hash(seal.salt, password) == seal.obfhash
}

fn fresh_salt() -> u64 {
    let mut buf = [0u8; 8];
    let urandom = std::fs::File::open("/dev/urandom").and_then(|mut f| f.read_exact(&mut buf));
    let salt = match urandom {
        Ok(()) => u64::from_le_bytes(buf),
        Err(e) => {
            log::debug!("/dev/urandom unavailable: {e}");
            0
        }
    };
    if salt != 0 {
        return salt;
    }

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    (now.as_secs() << 32) ^ u64::from(now.subsec_nanos()) ^ u64::from(std::process::id())
}
