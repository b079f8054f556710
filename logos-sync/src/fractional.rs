//! Fractional order keys for scene stacking order.
//!
//! Every element carries a key; a scene is rendered in ascending key order
//! (ties broken by element id). Inserting between two neighbours never
//! touches any other element's key, so concurrent inserts on different
//! peers merge without renumbering.
//!
//! Keys are base-62 digit strings read as fractions in `(0, 1)`, so plain
//! byte-wise string comparison gives the numeric order. A key never ends
//! in the zero digit, otherwise `"a"` and `"a0"` would denote the same
//! fraction.

const DIGITS: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const ZERO: u8 = b'0';

fn digit_value(c: u8) -> Option<usize> {
    match c {
        b'0'..=b'9' => Some((c - b'0') as usize),
        b'A'..=b'Z' => Some((c - b'A') as usize + 10),
        b'a'..=b'z' => Some((c - b'a') as usize + 36),
        _ => None,
    }
}

/// Whether `key` is a well-formed order key.
pub fn is_valid_key(key: &str) -> bool {
    let bytes = key.as_bytes();
    match bytes.last() {
        None => false,
        Some(&last) => last != ZERO && bytes.iter().all(|&c| digit_value(c).is_some()),
    }
}

/// Generate a key strictly between `before` and `after`.
///
/// `None` means "no bound on this side". Both bounds must be valid keys
/// and `before < after` when both are present.
pub fn key_between(before: Option<&str>, after: Option<&str>) -> String {
    debug_assert!(before.map_or(true, is_valid_key));
    debug_assert!(after.map_or(true, is_valid_key));
    debug_assert!(match (before, after) {
        (Some(a), Some(b)) => a < b,
        _ => true,
    });
    midpoint(before.unwrap_or(""), after)
}

/// Generate `count` ascending keys between `before` and `after`.
pub fn keys_between(before: Option<&str>, after: Option<&str>, count: usize) -> Vec<String> {
    let mut keys = Vec::with_capacity(count);
    let mut prev = before.map(str::to_owned);
    for _ in 0..count {
        let key = key_between(prev.as_deref(), after);
        prev = Some(key.clone());
        keys.push(key);
    }
    keys
}

fn midpoint(a: &str, b: Option<&str>) -> String {
    if let Some(b) = b {
        let (ab, bb) = (a.as_bytes(), b.as_bytes());
        let mut n = 0;
        while n < bb.len() && ab.get(n).copied().unwrap_or(ZERO) == bb[n] {
            n += 1;
        }
        if n > 0 {
            let rest = a.get(n..).unwrap_or("");
            return format!("{}{}", &b[..n], midpoint(rest, Some(&b[n..])));
        }
    }

    let digit_a = a.bytes().next().and_then(digit_value).unwrap_or(0);
    let digit_b = b
        .and_then(|b| b.bytes().next())
        .and_then(digit_value)
        .unwrap_or(DIGITS.len());

    if digit_b - digit_a > 1 {
        let mid = (digit_a + digit_b + 1) / 2;
        (DIGITS[mid] as char).to_string()
    } else if let Some(b) = b.filter(|b| b.len() > 1) {
        b[..1].to_string()
    } else {
        let tail = midpoint(a.get(1..).unwrap_or(""), None);
        format!("{}{}", DIGITS[digit_a] as char, tail)
    }
}
