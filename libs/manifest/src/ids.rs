//! Identifier helpers.

use uuid::Uuid;

/// Namespace for UUIDs derived from layered-registry digest chains.
pub const LAYER_CHAIN_NAMESPACE: Uuid = Uuid::from_u128(0x3f6c_8a0e_5b7d_4c21_9e4f_a1d2_6b8c_7e10);

/// Returns true if `s` is a lowercase hyphenated UUID (`8-4-4-4-12`).
///
/// `Uuid::parse_str` also accepts braced, URN, simple and uppercase forms;
/// image arguments only accept the canonical one.
pub fn is_canonical_uuid(s: &str) -> bool {
    let bytes = s.as_bytes();
    if bytes.len() != 36 {
        return false;
    }
    bytes.iter().enumerate().all(|(i, b)| match i {
        8 | 13 | 18 | 23 => *b == b'-',
        _ => b.is_ascii_digit() || (b'a'..=b'f').contains(b),
    })
}

/// Derive the image UUID for the layer chain ending at the last digest.
///
/// The same ordered digest list always yields the same UUID, so two hosts
/// importing the same registry image agree on every layer's identity.
pub fn layer_chain_uuid<S: AsRef<str>>(digests: &[S]) -> Uuid {
    let joined = digests
        .iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join("\n");
    Uuid::new_v5(&LAYER_CHAIN_NAMESPACE, joined.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("8d8b7b5e-9a3d-4e7c-bb1f-6c7a2b3e4f50", true)]
    #[case("8D8B7B5E-9A3D-4E7C-BB1F-6C7A2B3E4F50", false)]
    #[case("{8d8b7b5e-9a3d-4e7c-bb1f-6c7a2b3e4f50}", false)]
    #[case("8d8b7b5e9a3d4e7cbb1f6c7a2b3e4f50", false)]
    #[case("8d8b7b5e-9a3d-4e7c-bb1f-6c7a2b3e4f5g", false)]
    #[case("", false)]
    #[case("alpine:latest", false)]
    fn canonical_uuid(#[case] input: &str, #[case] expected: bool) {
        assert_eq!(is_canonical_uuid(input), expected);
    }

    #[test]
    fn layer_chain_uuid_is_deterministic() {
        let a = layer_chain_uuid(&["sha256:aaa", "sha256:bbb"]);
        let b = layer_chain_uuid(&["sha256:aaa".to_string(), "sha256:bbb".to_string()]);
        assert_eq!(a, b);
        assert!(is_canonical_uuid(&a.to_string()));
    }

    #[test]
    fn layer_chain_uuid_depends_on_order_and_prefix() {
        let ab = layer_chain_uuid(&["sha256:aaa", "sha256:bbb"]);
        let ba = layer_chain_uuid(&["sha256:bbb", "sha256:aaa"]);
        let a = layer_chain_uuid(&["sha256:aaa"]);
        assert_ne!(ab, ba);
        assert_ne!(ab, a);
    }
}
