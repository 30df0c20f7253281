//! Process-wide helpers: randomness, page arithmetic, temp directory
//! discovery.

use std::io::Read;
use std::path::Path;
use std::path::PathBuf;
use std::sync::OnceLock;

use log::warn;

use crate::error::fatal;

/// The system page size.
pub fn page_size() -> usize {
    page_size::get()
}

/// The granularity mappings must be aligned to. Equal to the page size on
/// every POSIX system.
pub fn allocation_granularity() -> usize {
    page_size::get_granularity()
}

/// Rounds `n` up to the next page boundary.
pub fn round_up_to_page_size(n: u64) -> u64 {
    let ps = page_size() as u64;
    n.div_ceil(ps) * ps
}

/// Rounds `n` down to the previous page boundary.
pub fn round_down_to_page_size(n: u64) -> u64 {
    let ps = page_size() as u64;
    n / ps * ps
}

/// A hex string from `bytes` bytes of kernel randomness, so twice `bytes`
/// characters long. Suitable as an unguessable filename.
pub fn random_string(bytes: usize) -> String {
    let mut raw = vec![0u8; bytes];
    let mut urandom = match std::fs::File::open("/dev/urandom") {
        Ok(f) => f,
        Err(e) => fatal("opening /dev/urandom failed", &e),
    };
    if let Err(e) = urandom.read_exact(&mut raw) {
        fatal("reading /dev/urandom failed", &e);
    }
    let mut out = String::with_capacity(bytes * 2);
    for b in raw {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

fn running_set_id() -> bool {
    use nix::unistd::getegid;
    use nix::unistd::geteuid;
    use nix::unistd::getgid;
    use nix::unistd::getuid;
    getuid() != geteuid() || getgid() != getegid()
}

/// True if we can create and delete a file in `dir`.
fn probe_directory(dir: &Path) -> bool {
    let name = format!(".probe-{}", random_string(16));
    let candidate = dir.join(&name);
    match std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&candidate)
    {
        Ok(f) => {
            drop(f);
            let _ = std::fs::remove_file(&candidate);
            true
        }
        Err(_) => false,
    }
}

/// The preferred directory for temporary files.
///
/// Honours `TMPDIR`, `TMP`, `TEMP`, `TEMPDIR` and `XDG_RUNTIME_DIR`, then
/// falls back to `/tmp`, `/var/tmp` and `$HOME`. The environment is ignored
/// entirely when running set-UID or set-GID, because it is then attacker
/// controlled. Every candidate is probed with a create-and-unlink before
/// use: what the environment claims about these paths is frequently wrong.
pub fn temp_directory_path() -> &'static Path {
    static CACHED: OnceLock<PathBuf> = OnceLock::new();
    CACHED.get_or_init(discover_temp_directory).as_path()
}

fn discover_temp_directory() -> PathBuf {
    let trust_env = !running_set_id();
    let mut candidates: Vec<PathBuf> = Vec::new();
    if trust_env {
        for var in ["TMPDIR", "TMP", "TEMP", "TEMPDIR", "XDG_RUNTIME_DIR"] {
            if let Some(v) = std::env::var_os(var) {
                if !v.is_empty() {
                    candidates.push(PathBuf::from(v));
                }
            }
        }
    }
    candidates.push(PathBuf::from("/tmp"));
    candidates.push(PathBuf::from("/var/tmp"));
    if trust_env {
        if let Some(home) = std::env::var_os("HOME") {
            if !home.is_empty() {
                candidates.push(PathBuf::from(home));
            }
        }
    }
    for cand in candidates {
        if probe_directory(&cand) {
            return cand;
        }
    }
    warn!("no writable temporary directory found, defaulting to /tmp");
    PathBuf::from("/tmp")
}
