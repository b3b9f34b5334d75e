use crate::canonical::Fragment;

/// Computes the hex digest identifying a canonicalized (query, body) pair.
///
/// Fragments are canonicalized, concatenated in call order with no
/// delimiter, and hashed with MD5. The digest is an identity key for
/// fixture lookup, not a security boundary. Empty input hashes the empty
/// string, which is the canonical "no query, no body" identity.
pub fn fingerprint(fragments: &[Fragment]) -> String {
    let mut context = md5::Context::new();
    for fragment in fragments {
        context.consume(fragment.canonical());
    }
    format!("{:x}", context.finalize())
}
