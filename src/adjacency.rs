//! Adjacency block transforms applied to every assembled batch.
//!
//! The transform is a pure function of the block and the config: the same
//! block always yields the same normalized block.

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use sprs::{CsMat, TriMat};

/// How the adjacency block of a batch is rescaled before it reaches the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformMode {
    /// Degree normalization `D^-1 A`.
    #[default]
    Normalised,
    /// `(D + I)^-1 (A + I)`.
    SelfConnectionsScaledByDegree,
    /// `(D + I)^-1 (A + I)` followed by `Ã + λ·diag(Ã)`.
    SelfConnectionsScaledByDegreeWithDiagonalEnhancement,
}

impl TransformMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normalised => "normalised",
            Self::SelfConnectionsScaledByDegree => "self_connections_scaled_by_degree",
            Self::SelfConnectionsScaledByDegreeWithDiagonalEnhancement => {
                "self_connections_scaled_by_degree_with_diagonal_enhancement"
            }
        }
    }

    /// Whether the transform puts an entry on the diagonal of every real row.
    #[must_use]
    pub fn adds_self_connections(self) -> bool {
        !matches!(self, Self::Normalised)
    }
}

/// `adjacency` section of the options: transform mode plus the diagonal enhancement factor.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AdjacencyTransform {
    #[serde(default)]
    pub transform_mode: TransformMode,
    #[serde(default)]
    pub diag_lambda: f32,
}

impl AdjacencyTransform {
    #[must_use]
    pub fn new(transform_mode: TransformMode, diag_lambda: f32) -> Self {
        Self {
            transform_mode,
            diag_lambda,
        }
    }

    #[must_use]
    pub fn normalised() -> Self {
        Self::new(TransformMode::Normalised, 0.0)
    }

    /// `diag_lambda` only takes effect in the diagonal enhancement mode.
    #[must_use]
    pub fn effective_lambda(&self) -> f32 {
        match self.transform_mode {
            TransformMode::SelfConnectionsScaledByDegreeWithDiagonalEnhancement => {
                self.diag_lambda
            }
            _ => 0.0,
        }
    }

    /// Canonical description used in cache keys and logs.
    #[must_use]
    pub fn describe(&self) -> String {
        match self.transform_mode {
            TransformMode::SelfConnectionsScaledByDegreeWithDiagonalEnhancement => {
                format!("{}:{}", self.transform_mode.as_str(), self.diag_lambda)
            }
            mode => mode.as_str().to_string(),
        }
    }

    /// Applies the transform to a square block.
    #[must_use]
    pub fn apply(&self, block: &CsMat<f32>) -> CsMat<f32> {
        let size = block.rows();
        let self_connections = self.transform_mode.adds_self_connections();
        let lambda = self.effective_lambda();
        let mut triplets = TriMat::new((size, block.cols()));

        for (row, entries) in block.outer_iterator().enumerate() {
            let mut degree: f32 = entries.iter().map(|(_, &value)| value).sum();
            let mut diagonal = entries
                .iter()
                .find(|(col, _)| *col == row)
                .map_or(0.0, |(_, &value)| value);
            if self_connections {
                degree += 1.0;
                diagonal += 1.0;
            }
            if degree == 0.0 {
                continue;
            }

            for (col, &value) in entries.iter() {
                triplets.add_triplet(row, col, value / degree);
            }
            if self_connections {
                triplets.add_triplet(row, row, 1.0 / degree);
            }
            if lambda != 0.0 {
                triplets.add_triplet(row, row, lambda * diagonal / degree);
            }
        }

        triplets.to_csr()
    }
}

/// Renders a sparse block as a dense matrix for splits that disable the sparse representation.
#[must_use]
pub fn to_dense(block: &CsMat<f32>) -> Array2<f32> {
    let mut dense = Array2::zeros((block.rows(), block.cols()));
    for (row, entries) in block.outer_iterator().enumerate() {
        for (col, &value) in entries.iter() {
            dense[[row, col]] += value;
        }
    }
    dense
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path_block() -> CsMat<f32> {
        // 0 - 1 - 2
        let mut triplets = TriMat::new((3, 3));
        for (a, b) in [(0, 1), (1, 2)] {
            triplets.add_triplet(a, b, 1.0);
            triplets.add_triplet(b, a, 1.0);
        }
        triplets.to_csr()
    }

    fn row_sums(block: &CsMat<f32>) -> Vec<f32> {
        block
            .outer_iterator()
            .map(|entries| entries.iter().map(|(_, &v)| v).sum())
            .collect()
    }

    #[test]
    fn normalised_rows_sum_to_one() {
        let normalized = AdjacencyTransform::normalised().apply(&path_block());
        for sum in row_sums(&normalized) {
            assert!((sum - 1.0).abs() < 1e-6);
        }
        assert!((normalized.get(1, 0).copied().unwrap_or_default() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn normalised_is_idempotent() {
        let transform = AdjacencyTransform::normalised();
        let once = transform.apply(&path_block());
        let twice = transform.apply(&once);
        let (a, b) = (to_dense(&once), to_dense(&twice));
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-6);
        }
    }

    #[test]
    fn normalised_ignores_lambda() {
        let with_lambda = AdjacencyTransform::new(TransformMode::Normalised, 3.0);
        assert_eq!(
            to_dense(&with_lambda.apply(&path_block())),
            to_dense(&AdjacencyTransform::normalised().apply(&path_block()))
        );
        assert!(with_lambda.effective_lambda().abs() < f32::EPSILON);
    }

    #[test]
    fn self_connections_scale_by_degree_plus_one() {
        let transform = AdjacencyTransform::new(TransformMode::SelfConnectionsScaledByDegree, 0.0);
        let dense = to_dense(&transform.apply(&path_block()));
        // node 1 has degree 2, so every entry in its row is 1/3
        for col in 0..3 {
            assert!((dense[[1, col]] - 1.0 / 3.0).abs() < 1e-6);
        }
        assert!((dense[[0, 0]] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn diagonal_enhancement_scales_diagonal_only() {
        let transform = AdjacencyTransform::new(
            TransformMode::SelfConnectionsScaledByDegreeWithDiagonalEnhancement,
            1.0,
        );
        let dense = to_dense(&transform.apply(&path_block()));
        assert!((dense[[0, 0]] - 1.0).abs() < 1e-6);
        assert!((dense[[0, 1]] - 0.5).abs() < 1e-6);
        assert!((dense[[1, 1]] - 2.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn isolated_rows_stay_empty_when_normalised() {
        let block: CsMat<f32> = TriMat::new((2, 2)).to_csr();
        let normalized = AdjacencyTransform::normalised().apply(&block);
        assert_eq!(normalized.nnz(), 0);
    }

    #[test]
    fn transform_mode_parses_from_config_names() {
        let parsed: AdjacencyTransform = serde_json::from_str(
            r#"{"transform_mode": "self_connections_scaled_by_degree_with_diagonal_enhancement", "diag_lambda": 1.0}"#,
        )
        .expect("transform should parse");
        assert_eq!(
            parsed.transform_mode,
            TransformMode::SelfConnectionsScaledByDegreeWithDiagonalEnhancement
        );
        assert!((parsed.effective_lambda() - 1.0).abs() < f32::EPSILON);
    }
}
