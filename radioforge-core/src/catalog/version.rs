//! Structured firmware version ordering.
//!
//! Baseband version tokens are not semver; they are dot/underscore separated
//! mixes of numeric and alphabetic runs. Plain lexical comparison would put
//! "13.10" before "13.2", so versions are split into segments and numeric
//! segments compare as numbers.

use std::cmp::Ordering;

#[derive(Debug, PartialEq, Eq)]
enum Segment<'a> {
    /// Raw digit run. Compared numerically without parsing: strip leading
    /// zeros, then longer means greater, equal lengths compare lexically.
    Num(&'a str),
    Alpha(&'a str),
}

fn segments(version: &str) -> Vec<Segment<'_>> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut kind: Option<bool> = None; // Some(true) = digit run

    for (i, c) in version.char_indices() {
        let digit = c.is_ascii_digit();
        if c.is_ascii_alphanumeric() {
            match kind {
                Some(k) if k == digit => {}
                Some(k) => {
                    out.push(if k {
                        Segment::Num(&version[start..i])
                    } else {
                        Segment::Alpha(&version[start..i])
                    });
                    start = i;
                    kind = Some(digit);
                }
                None => {
                    start = i;
                    kind = Some(digit);
                }
            }
        } else if let Some(k) = kind.take() {
            out.push(if k {
                Segment::Num(&version[start..i])
            } else {
                Segment::Alpha(&version[start..i])
            });
        }
    }
    if let Some(k) = kind {
        out.push(if k {
            Segment::Num(&version[start..])
        } else {
            Segment::Alpha(&version[start..])
        });
    }
    out
}

fn cmp_numeric(a: &str, b: &str) -> Ordering {
    let a = a.trim_start_matches('0');
    let b = b.trim_start_matches('0');
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

/// Total order over version tokens. Numeric segments compare as numbers,
/// alphabetic segments lexically; a numeric segment orders before an
/// alphabetic one; a missing segment orders before any present one.
pub fn cmp_versions(a: &str, b: &str) -> Ordering {
    let sa = segments(a);
    let sb = segments(b);
    let mut ia = sa.iter();
    let mut ib = sb.iter();
    loop {
        match (ia.next(), ib.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                let ord = match (x, y) {
                    (Segment::Num(x), Segment::Num(y)) => cmp_numeric(x, y),
                    (Segment::Alpha(x), Segment::Alpha(y)) => x.cmp(y),
                    (Segment::Num(_), Segment::Alpha(_)) => Ordering::Less,
                    (Segment::Alpha(_), Segment::Num(_)) => Ordering::Greater,
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

/// Substring/prefix match used by search version filters.
pub fn version_matches(version: &str, filter: &str) -> bool {
    filter.is_empty() || version.contains(filter)
}
