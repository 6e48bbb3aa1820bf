use std::cmp::Ordering;
use ulid::Ulid;

pub fn generate_ulid() -> String {
    Ulid::new().to_string()
}

/// Compares two provider history cursors.
///
/// Cursors are opaque strings, but Gmail issues them as increasing integers.
/// When both sides parse as integers they are compared numerically; otherwise
/// the order is unknown and `None` is returned.
pub fn compare_cursors(current: &str, candidate: &str) -> Option<Ordering> {
    let current = current.trim().parse::<u128>().ok()?;
    let candidate = candidate.trim().parse::<u128>().ok()?;
    Some(candidate.cmp(&current))
}

/// Whether `candidate` may replace `current` as the persisted checkpoint.
///
/// A cursor only moves forward. An unknown ordering is accepted, since the
/// provider is the only authority on opaque values.
pub fn cursor_advances(current: Option<&str>, candidate: &str) -> bool {
    match current {
        None => true,
        Some(current) => !matches!(
            compare_cursors(current, candidate),
            Some(Ordering::Less) | Some(Ordering::Equal)
        ),
    }
}
