//! Reorders the cipher suites of a located ClientHello in place.

use crate::hello::{self, ClientHelloView};
use modcipher_traits::{CipherSuite, Preferences, SuiteList};
use std::cmp::Reverse;
use std::fmt::Write as _;
use tracing::{debug, info};

/// Outcome of a rewrite, kept for logging and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rewrite {
    pub offset: usize,
    pub before: Vec<CipherSuite>,
    pub after: Vec<CipherSuite>,
}

impl Rewrite {
    pub fn changed(&self) -> bool {
        self.before != self.after
    }
}

/// Stable sort by descending score: suites with equal scores keep their
/// original relative order.
pub fn prioritize(suites: &[CipherSuite], preferences: &Preferences) -> Vec<CipherSuite> {
    let mut ordered = suites.to_vec();
    ordered.sort_by_key(|&suite| Reverse(preferences.score(suite)));
    ordered
}

/// Overwrites the suite list described by `view` inside `buf`.
///
/// `view` must come from inspecting the same bytes. Returns `None` without
/// touching `buf` if the described range does not fit.
pub fn apply(buf: &mut [u8], view: ClientHelloView, preferences: &Preferences) -> Option<Rewrite> {
    let range = view.range();
    if range.end > buf.len() {
        return None;
    }

    info!(
        cipher_suites = %SuiteList(&view.cipher_suites),
        at = view.offset,
        "ClientHello"
    );

    let after = prioritize(&view.cipher_suites, preferences);

    info!(cipher_suites = %SuiteList(&after), "ClientHello (modified)");

    debug!(bytes = %hex(buf), "record before rewrite");
    for (slot, suite) in buf[range].chunks_exact_mut(2).zip(&after) {
        slot.copy_from_slice(&suite.to_be_bytes());
    }
    debug!(bytes = %hex(buf), "record after rewrite");

    Some(Rewrite {
        offset: view.offset,
        before: view.cipher_suites,
        after,
    })
}

/// Locates and reorders the cipher suites of `buf`. The length of `buf`
/// never changes; a buffer that is not a ClientHello is left untouched.
pub fn rewrite_in_place(buf: &mut [u8], preferences: &Preferences) -> Option<Rewrite> {
    let view = hello::locate(buf)?;
    apply(buf, view, preferences)
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{:02x}", b);
    }
    out
}
