/// Longest sanitized key that is used verbatim as a file name.
const MAX_PLAIN_LEN: usize = 96;

/// Readable prefix kept in front of the digest for hashed names.
const HASHED_PREFIX_LEN: usize = 64;

/// Derive the cache file stem for a logical request key.
///
/// Keys made only of `[A-Za-z0-9._-]` that are short enough map to themselves,
/// so `docker_universe-devel` stays greppable in the cache directory. Anything
/// else (path separators, colons, very long keys, a leading dot) is sanitized
/// and suffixed with a blake3 digest of the original key. Two distinct keys
/// therefore never share a file: `a/b` and `a_b` end up in different entries.
pub fn derive_file_name(key: &str) -> String {
    let sanitized: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();

    let needs_hash = sanitized != key
        || sanitized.is_empty()
        || sanitized.len() > MAX_PLAIN_LEN
        || sanitized.starts_with('.');
    if !needs_hash {
        return sanitized;
    }

    let digest = blake3::hash(key.as_bytes()).to_hex();
    let prefix: String = sanitized
        .trim_start_matches('.')
        .chars()
        .take(HASHED_PREFIX_LEN)
        .collect();
    format!("{prefix}-{}", &digest[..32])
}
