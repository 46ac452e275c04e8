use std::fmt;

use hickory_proto::rr::Name;
use rustc_hash::{FxHashMap, FxHashSet};

/// Pads single-character names in the bucket key. A label never starts with '-'.
const PAD: u8 = b'-';

/// Immutable set of domain names with suffix matching.
///
/// Names are bucketed by their first two bytes so a lookup only scans a small
/// subset. Built once through [`DomainSetBuilder`], shared read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct DomainSet {
    buckets: FxHashMap<u16, FxHashSet<Box<str>>>,
    len: usize,
}

/// Single-threaded build phase for a [`DomainSet`].
#[derive(Debug, Default)]
pub struct DomainSetBuilder {
    set: DomainSet,
}

impl DomainSetBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if `name` does not normalise to a valid label sequence.
    pub fn add(&mut self, name: &str) -> bool {
        let Some(name) = normalize_domain(name) else {
            return false;
        };
        let bucket = self.set.buckets.entry(bucket_key(&name)).or_default();
        if bucket.insert(name.into_boxed_str()) {
            self.set.len += 1;
        }
        true
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.set.len
    }

    pub fn build(self) -> DomainSet {
        self.set
    }
}

impl DomainSet {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True if `name` equals, or is a subdomain of, a stored entry.
    /// `name` must already be lower-cased and without trailing dot.
    pub fn matches(&self, name: &str) -> bool {
        if self.len == 0 || name.is_empty() {
            return false;
        }

        let mut child = name;
        loop {
            if let Some(bucket) = self.buckets.get(&bucket_key(child)) {
                if bucket.contains(child) {
                    return true;
                }
                if bucket.iter().any(|parent| is_subdomain(child, parent)) {
                    return true;
                }
            }

            match child.find('.') {
                Some(i) if i > 0 => child = &child[i + 1..],
                _ => break,
            }
        }
        false
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.buckets.values().flat_map(|b| b.iter().map(|s| s.as_ref()))
    }
}

impl fmt::Display for DomainSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.iter().collect();
        names.sort_unstable();
        write!(f, "[{}]", names.join(", "))
    }
}

/// Big-endian key from the first two bytes of `name`.
#[inline]
fn bucket_key(name: &str) -> u16 {
    let b = name.as_bytes();
    match b.len() {
        0 => 0,
        1 => ((PAD as u16) << 8) | b[0] as u16,
        _ => ((b[0] as u16) << 8) | b[1] as u16,
    }
}

#[inline]
fn is_subdomain(child: &str, parent: &str) -> bool {
    child.len() > parent.len()
        && child.ends_with(parent)
        && child.as_bytes()[child.len() - parent.len() - 1] == b'.'
}

/// Lower-cases, IDNA-encodes and strips the trailing dot of `input`.
/// Returns `None` for the root, empty labels, or characters a hostname can't carry.
pub fn normalize_domain(input: &str) -> Option<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() || trimmed == "." {
        return None;
    }

    let ascii = if trimmed.is_ascii() {
        trimmed.to_ascii_lowercase()
    } else {
        Name::from_utf8(trimmed).ok()?.to_ascii().to_ascii_lowercase()
    };
    let name = ascii.strip_suffix('.').unwrap_or(&ascii);

    if name.is_empty() || name.len() > 253 {
        return None;
    }
    let valid = name.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && label
                .bytes()
                .all(|c| c.is_ascii_alphanumeric() || c == b'-' || c == b'_')
    });
    valid.then(|| name.to_string())
}

/// Lower-cases a query name and drops its trailing dot (the root stays ".").
pub fn normalize_qname(qname: &str) -> String {
    let lower = qname.to_ascii_lowercase();
    if lower.len() > 1 {
        lower.trim_end_matches('.').to_string()
    } else {
        lower
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_of(names: &[&str]) -> DomainSet {
        let mut b = DomainSetBuilder::new();
        for n in names {
            assert!(b.add(n), "failed to add {n}");
        }
        b.build()
    }

    #[test]
    fn exact_and_subdomain_match() {
        let set = set_of(&["b.com", "example.org"]);
        assert!(set.matches("b.com"));
        assert!(set.matches("a.b.com"));
        assert!(set.matches("x.y.a.b.com"));
        assert!(set.matches("example.org"));
        assert!(!set.matches("ab.com"));
        assert!(!set.matches("com"));
        assert!(!set.matches("example.net"));
    }

    #[test]
    fn suffix_owner_in_other_bucket_is_found() {
        let set = set_of(&["zz.io"]);
        // "aa.zz.io" hashes to bucket "aa" but its suffix "zz.io" lives in "zz" / "aa.zz.io" 落在 "aa" 桶，但后缀 "zz.io" 在 "zz" 桶
        assert!(set.matches("aa.zz.io"));
    }

    #[test]
    fn single_character_names_use_padded_bucket() {
        let set = set_of(&["x", "x.com"]);
        assert_eq!(bucket_key("x"), ((b'-' as u16) << 8) | b'x' as u16);
        assert!(set.matches("x"));
        assert!(set.matches("a.x"));
        assert!(set.matches("x.com"));
        assert!(!set.matches("y"));
    }

    #[test]
    fn add_normalises_case_dot_and_idna() {
        let mut b = DomainSetBuilder::new();
        assert!(b.add("Example.COM."));
        assert!(b.add("bücher.de"));
        assert!(b.add("example.com"));
        let set = b.build();
        assert_eq!(set.len(), 2);
        assert!(set.matches("www.example.com"));
        assert!(set.matches("shop.xn--bcher-kva.de"));
    }

    #[test]
    fn add_rejects_invalid_names() {
        let mut b = DomainSetBuilder::new();
        assert!(!b.add(""));
        assert!(!b.add("."));
        assert!(!b.add("a..b"));
        assert!(!b.add("foo bar"));
        assert!(!b.add("-lead.com"));
        assert_eq!(b.len(), 0);
    }

    #[test]
    fn empty_set_matches_nothing() {
        let set = DomainSet::default();
        assert!(set.is_empty());
        assert!(!set.matches("example.com"));
        assert!(!set.matches("."));
    }

    #[test]
    fn normalize_qname_keeps_root() {
        assert_eq!(normalize_qname("."), ".");
        assert_eq!(normalize_qname("WWW.Example.com."), "www.example.com");
    }
}
