//! Kernel command-line tokenization.
//!
//! The rewrite must drop the unverified `root=` device and the `rw` flag
//! without touching look-alike parameters (`rootwait`, `rootfstype=ext4`,
//! `rwlock=...`), so the line is split into `key[=value]` tokens and
//! filtered by key, never by substring.

/// Drop the `root` parameter and the bare `rw` token, keep everything
/// else (including `quiet`). Token order is preserved; whitespace is
/// normalized to single spaces.
pub fn strip_unverified_root(cmdline: &str) -> String {
    cmdline
        .split_ascii_whitespace()
        .filter(|token| !names_unverified_root(token))
        .collect::<Vec<_>>()
        .join(" ")
}

fn names_unverified_root(token: &str) -> bool {
    let key = token.split_once('=').map_or(token, |(key, _)| key);
    key == "root" || token == "rw"
}
