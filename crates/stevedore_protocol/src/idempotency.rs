use blake3::Hasher;

const SEP: u8 = 0x1f;

fn hash_parts(parts: &[&str]) -> String {
    let mut hasher = Hasher::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(&[SEP]);
    }
    hasher.finalize().to_hex().to_string()
}

/// Stable content hash for a job-creation request.
///
/// Components: owner, kind, resource, format, and the normalized request
/// payload (filters/fields for exports, source descriptor for imports).
/// Reserved for content-hash deduplication; persisted as `request_hash`.
pub fn request_hash(
    owner_id: &str,
    kind: &str,
    resource: &str,
    format: &str,
    payload_json: &str,
) -> String {
    hash_parts(&[owner_id, kind, resource, format, payload_json])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_and_separator_safe() {
        let a = request_hash("o1", "export", "users", "json", "{}");
        let b = request_hash("o1", "export", "users", "json", "{}");
        assert_eq!(a, b);

        // Concatenation ambiguity must not collide.
        let c = request_hash("o1", "exportusers", "", "json", "{}");
        assert_ne!(a, c);
    }
}
