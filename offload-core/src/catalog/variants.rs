//! Recognize derived renditions by file name and attach them to their primary.

use std::collections::BTreeSet;

use super::DerivedKind;

const MODERN_EXTS: &[&str] = &["webp", "avif"];
const SCALED_SUFFIX: &str = "-scaled";
const MAX_HOPS: usize = 4;

/// `("photo-150x150", "jpg")`; extension is `""` when absent.
pub fn split_name(name: &str) -> (&str, &str) {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, ext),
        _ => (name, ""),
    }
}

fn join_name(stem: &str, ext: &str) -> String {
    if ext.is_empty() {
        stem.to_string()
    } else {
        format!("{stem}.{ext}")
    }
}

/// `photo-300x200` -> `photo`
fn strip_dimensions(stem: &str) -> Option<&str> {
    let (base, dims) = stem.rsplit_once('-')?;
    let (w, h) = dims.split_once('x')?;
    let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    (digits(w) && digits(h) && !base.is_empty()).then_some(base)
}

/// `photo-e1700000000` -> `photo`
fn strip_edit_suffix(stem: &str) -> Option<&str> {
    let (base, suffix) = stem.rsplit_once('-')?;
    let stamp = suffix.strip_prefix('e')?;
    let ok = !stamp.is_empty() && stamp.bytes().all(|b| b.is_ascii_digit()) && !base.is_empty();
    ok.then_some(base)
}

fn existing_primary(base: &str, ext: &str, names: &BTreeSet<String>) -> Option<String> {
    [join_name(base, ext), join_name(&format!("{base}{SCALED_SUFFIX}"), ext)]
        .into_iter()
        .find(|candidate| names.contains(candidate))
}

fn is_modern(ext: &str) -> bool {
    MODERN_EXTS.iter().any(|m| m.eq_ignore_ascii_case(ext))
}

/// The file `name` is derived from (one hop), if any sibling in `names` qualifies.
pub fn parent_of(name: &str, names: &BTreeSet<String>) -> Option<(String, DerivedKind)> {
    let (stem, ext) = split_name(name);

    if let Some(base) = strip_dimensions(stem) {
        if let Some(orig) = strip_edit_suffix(base) {
            if let Some(p) = existing_primary(orig, ext, names) {
                return Some((p, DerivedKind::BackupSize));
            }
        }
        if let Some(p) = existing_primary(base, ext, names) {
            return Some((p, DerivedKind::Size));
        }
    }

    if let Some(orig) = strip_edit_suffix(stem) {
        if let Some(p) = existing_primary(orig, ext, names) {
            return Some((p, DerivedKind::BackupSize));
        }
    }

    if !stem.ends_with(SCALED_SUFFIX) {
        let scaled = join_name(&format!("{stem}{SCALED_SUFFIX}"), ext);
        if names.contains(&scaled) {
            return Some((scaled, DerivedKind::Original));
        }
    }

    if is_modern(ext) {
        let sibling = names.iter().find(|other| {
            let (s, e) = split_name(other);
            s == stem && !e.is_empty() && !is_modern(e)
        });
        if let Some(p) = sibling {
            return Some((p.clone(), DerivedKind::ModernSibling));
        }
    }

    None
}

/// Follow `parent_of` until a primary is reached. The kind is that of the
/// first hop. `None` means `name` is itself a primary.
pub fn resolve_primary(name: &str, names: &BTreeSet<String>) -> Option<(String, DerivedKind)> {
    let (mut current, kind) = parent_of(name, names)?;
    for _ in 0..MAX_HOPS {
        match parent_of(&current, names) {
            Some((next, _)) if next != name => current = next,
            _ => break,
        }
    }
    Some((current, kind))
}
