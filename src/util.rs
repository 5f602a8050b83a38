//! Small helpers shared by the clustering and cache layers.

use xxhash_rust::xxh3::xxh3_64;

/// Derives an independent child seed so that parallel branches stay deterministic.
#[must_use]
pub(crate) fn derive_seed(seed: u64, branch: u64) -> u64 {
    let mut bytes = [0_u8; 16];
    bytes[..8].copy_from_slice(&seed.to_le_bytes());
    bytes[8..].copy_from_slice(&branch.to_le_bytes());
    xxh3_64(&bytes)
}

/// Hashes a list of node ids (order-sensitive).
#[must_use]
pub(crate) fn hash_nodes(nodes: &[usize]) -> u64 {
    let bytes: Vec<u8> = nodes
        .iter()
        .flat_map(|&node| (node as u64).to_le_bytes())
        .collect();
    xxh3_64(&bytes)
}

/// Replaces anything outside `[A-Za-z0-9_-]` so the value is safe inside a file name.
#[must_use]
pub(crate) fn sanitize_component(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_seed_differs_per_branch() {
        assert_ne!(derive_seed(7, 1), derive_seed(7, 2));
        assert_eq!(derive_seed(7, 1), derive_seed(7, 1));
    }

    #[test]
    fn sanitize_component_replaces_separators() {
        assert_eq!(sanitize_component("ogbn/arxiv v2"), "ogbn_arxiv_v2");
        assert_eq!(sanitize_component("ppi-training"), "ppi-training");
    }

    #[test]
    fn hash_nodes_is_order_sensitive() {
        assert_ne!(hash_nodes(&[1, 2, 3]), hash_nodes(&[3, 2, 1]));
    }
}
