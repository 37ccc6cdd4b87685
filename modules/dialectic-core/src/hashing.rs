use sha2::{Digest, Sha256};

/// Hash identifying one version of a piece of content.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.trim().as_bytes());
    hex::encode(hasher.finalize())
}

/// Lowercase, collapse whitespace, drop trailing sentence punctuation.
pub fn normalize_claim_text(text: &str) -> String {
    let collapsed = text
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    collapsed
        .trim_end_matches(['.', '!', '?', ';', ','])
        .trim_end()
        .to_string()
}

/// Key two canonical claims collide on when their text is the same assertion
/// up to case, spacing and final punctuation.
pub fn claim_text_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_claim_text(text).as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_ignores_surrounding_whitespace() {
        assert_eq!(content_hash("hello world"), content_hash("  hello world\n"));
        assert_ne!(content_hash("hello world"), content_hash("hello  world"));
        assert_eq!(content_hash("x").len(), 64);
    }

    #[test]
    fn claim_hash_normalises_case_space_and_punctuation() {
        assert_eq!(
            claim_text_hash("Rent control  reduces supply."),
            claim_text_hash("rent control reduces supply")
        );
        assert_ne!(
            claim_text_hash("Rent control reduces supply"),
            claim_text_hash("Rent control increases supply")
        );
    }
}
