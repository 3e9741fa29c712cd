//! String interning.
//!
//! Strings used as identifiers, literals, and dunder method names are interned
//! once per VM so that equality between interned strings reduces to comparing
//! a `StringId`. Interning is keyed by (length, bytes); re-interning an
//! equal byte sequence returns the existing id.

use ahash::AHashMap;

/// Index into the intern table's storage.
///
/// `u32` rather than `usize` to keep bytecode operands and table entries
/// compact; four billion unique interned strings is far beyond any real
/// program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "bytecode-serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StringId(u32);

impl StringId {
    /// Reconstructs a `StringId` from a 16-bit bytecode operand.
    #[inline]
    #[must_use]
    pub fn from_operand(index: u16) -> Self {
        Self(u32::from(index))
    }

    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// FNV-1a over bytes, 32-bit, matching the hash stored on `String` objects.
#[must_use]
pub fn fnv1a(bytes: &[u8]) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    let mut hash = OFFSET_BASIS;
    for &b in bytes {
        hash ^= u32::from(b);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// Per-VM table of interned strings.
///
/// Backed by a growable `Vec` for id→bytes lookup (used for error messages
/// and `repr`), plus a hash map for the reverse byte-sequence→id lookup used
/// while interning.
#[derive(Debug, Default)]
pub struct Interns {
    strings: Vec<Box<[u8]>>,
    lookup: AHashMap<Box<[u8]>, StringId>,
}

impl Interns {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns `bytes`, returning the existing id if an equal string was
    /// already interned.
    pub fn intern(&mut self, bytes: &[u8]) -> StringId {
        if let Some(&id) = self.lookup.get(bytes) {
            return id;
        }
        let id = StringId(u32::try_from(self.strings.len()).expect("intern table overflow"));
        let boxed: Box<[u8]> = bytes.into();
        self.strings.push(boxed.clone());
        self.lookup.insert(boxed, id);
        id
    }

    pub fn intern_str(&mut self, s: &str) -> StringId {
        self.intern(s.as_bytes())
    }

    #[must_use]
    pub fn bytes(&self, id: StringId) -> &[u8] {
        &self.strings[id.index()]
    }

    #[must_use]
    pub fn as_str(&self, id: StringId) -> &str {
        std::str::from_utf8(self.bytes(id)).expect("interned identifiers are always valid UTF-8")
    }

    /// Drops any interned entry whose bytes are not found by `is_reachable`.
    ///
    /// Called by the collector after mark, before sweep: interned strings are
    /// a weak table and must not themselves keep a `String` object alive.
    pub fn retain_reachable(&mut self, mut is_reachable: impl FnMut(&[u8]) -> bool) {
        self.lookup.retain(|bytes, _| is_reachable(bytes));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_idempotent() {
        let mut interns = Interns::new();
        let a = interns.intern_str("hello");
        let b = interns.intern_str("hello");
        assert_eq!(a, b);
        let c = interns.intern_str("world");
        assert_ne!(a, c);
        assert_eq!(interns.as_str(a), "hello");
    }

    #[test]
    fn fnv1a_is_stable() {
        assert_eq!(fnv1a(b""), 0x811c_9dc5);
        assert_eq!(fnv1a(b"hello"), fnv1a(b"hello"));
        assert_ne!(fnv1a(b"hello"), fnv1a(b"world"));
    }
}
