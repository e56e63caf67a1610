//! Deterministic, length-bounded Postgres identifiers for namespaces, chunk
//! tables and attribute columns.

use xxhash_rust::xxh64::Xxh64;

use crate::event::AttributeKey;

/// Postgres truncates identifiers beyond this many bytes.
pub const MAX_IDENTIFIER_LEN: usize = 63;

const NAMESPACE_STEM_LEN: usize = 40;
const COLUMN_STEM_LEN: usize = 48;

/// Hash of `parts` with each part length-prefixed, so ("ab", "c") and
/// ("a", "bc") differ.
pub(crate) fn identifier_hash(parts: &[&[u8]]) -> u64 {
    let mut hasher = Xxh64::new(0);
    for part in parts {
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    hasher.digest()
}

fn sanitize(value: &str, max_len: usize) -> String {
    let mut normalized = String::with_capacity(value.len().min(max_len));
    for ch in value.chars() {
        if normalized.len() >= max_len {
            break;
        }
        if ch.is_ascii_alphanumeric() || ch == '_' {
            normalized.push(ch.to_ascii_lowercase());
        } else {
            normalized.push('_');
        }
    }
    if normalized.is_empty() {
        normalized.push('_');
    }
    normalized
}

/// Schema holding every table of one namespace.
pub fn namespace_schema_name(namespace: &str) -> String {
    format!(
        "ns_{}_{:016x}",
        sanitize(namespace, NAMESPACE_STEM_LEN),
        identifier_hash(&[namespace.as_bytes()])
    )
}

/// Chunk table for one `(namespace, shape signature, chunk start)` triple.
pub fn chunk_table_name(namespace: &str, canonical_signature: &[u8], chunk_start: i64) -> String {
    let hash = identifier_hash(&[
        namespace.as_bytes(),
        canonical_signature,
        &chunk_start.to_be_bytes(),
    ]);
    format!("c_{chunk_start}_{hash:016x}")
}

/// Candidate physical column for `key`. `attempt` 0 is the plain sanitized
/// name; later attempts append a disambiguating suffix.
pub fn column_candidate(key: &AttributeKey, attempt: u32) -> String {
    let stem = sanitize(&key.name, COLUMN_STEM_LEN);
    let prefix = key.kind.column_prefix();
    if attempt == 0 {
        format!("{prefix}{stem}")
    } else {
        format!("{prefix}{stem}_{attempt}")
    }
}

pub fn quote_ident(value: &str) -> String {
    let escaped = value.replace('"', "\"\"");
    format!("\"{}\"", escaped)
}

pub fn qualified_name(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

/// Hex form of a namespace, safe inside file names.
pub fn hex_encode(value: &str) -> String {
    hex::encode(value)
}

pub fn hex_decode(value: &str) -> Option<String> {
    let bytes = hex::decode(value).ok()?;
    String::from_utf8(bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;

    #[test]
    fn qualified() {
        assert_eq!(qualified_name("public", "chunks"), "\"public\".\"chunks\"");
    }

    #[test]
    fn quote_handles_quotes() {
        assert_eq!(quote_ident("weird\"name"), "\"weird\"\"name\"");
    }

    #[test]
    fn names_fit_identifier_limit() {
        let ns = "x".repeat(512);
        assert!(namespace_schema_name(&ns).len() <= MAX_IDENTIFIER_LEN);
        let shape = Event::new(0).metadata("a", "1").shape().canonical();
        assert!(chunk_table_name(&ns, &shape, i64::MAX).len() <= MAX_IDENTIFIER_LEN);
        let key = AttributeKey::metadata("ü".repeat(200));
        assert!(column_candidate(&key, 9_999).len() <= MAX_IDENTIFIER_LEN);
    }

    #[test]
    fn schema_names_distinguish_similar_namespaces() {
        assert_ne!(namespace_schema_name("a.b"), namespace_schema_name("a-b"));
        assert!(namespace_schema_name("Orders").starts_with("ns_orders_"));
    }

    #[test]
    fn chunk_names_depend_on_every_input() {
        let a = Event::new(0).metadata("a", "1").shape().canonical();
        let b = Event::new(0).metadata("b", "1").shape().canonical();
        let base = chunk_table_name("ns", &a, 0);
        assert_eq!(base, chunk_table_name("ns", &a, 0));
        assert_ne!(base, chunk_table_name("ns", &b, 0));
        assert_ne!(base, chunk_table_name("ns2", &a, 0));
        assert_ne!(base, chunk_table_name("ns", &a, 3_600_000));
    }

    #[test]
    fn hash_parts_are_length_prefixed() {
        assert_ne!(
            identifier_hash(&[b"ab".as_slice(), b"c".as_slice()]),
            identifier_hash(&[b"a".as_slice(), b"bc".as_slice()])
        );
    }

    #[test]
    fn column_candidates_collide_then_disambiguate() {
        let a = AttributeKey::metadata("Host Name");
        let b = AttributeKey::metadata("host-name");
        assert_eq!(column_candidate(&a, 0), column_candidate(&b, 0));
        assert_eq!(column_candidate(&b, 1), "m_host_name_1");
        assert_eq!(
            column_candidate(&AttributeKey::dimension("Host Name"), 0),
            "d_host_name"
        );
    }

    #[test]
    fn hex_roundtrip() {
        let ns = "orders/eu ü";
        assert_eq!(hex_decode(&hex_encode(ns)).as_deref(), Some(ns));
        assert_eq!(hex_encode("a/b"), "612f62");
        assert_eq!(hex_decode("zz"), None);
        assert_eq!(hex_decode("abc"), None);
    }
}
