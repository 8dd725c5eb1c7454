use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of numeric operation a selection model serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OperationType {
    ScalarAxpy,
    VectorAxpy,
    Reduction,
    MatrixAxpy,
    RowWiseReduction,
    ColWiseReduction,
    MatrixProductNN,
    MatrixProductNT,
    MatrixProductTN,
    MatrixProductTT,
}

impl OperationType {
    pub const ALL: [OperationType; 10] = [
        OperationType::ScalarAxpy,
        OperationType::VectorAxpy,
        OperationType::Reduction,
        OperationType::MatrixAxpy,
        OperationType::RowWiseReduction,
        OperationType::ColWiseReduction,
        OperationType::MatrixProductNN,
        OperationType::MatrixProductNT,
        OperationType::MatrixProductTN,
        OperationType::MatrixProductTT,
    ];

    /// Resolves an operation key of a model description.
    pub fn from_description_name(name: &str) -> Option<Self> {
        match name {
            "vaxpy" => Some(OperationType::VectorAxpy),
            "dot" => Some(OperationType::Reduction),
            "maxpy" => Some(OperationType::MatrixAxpy),
            "gemvN" => Some(OperationType::RowWiseReduction),
            "gemvT" => Some(OperationType::ColWiseReduction),
            "gemmNN" => Some(OperationType::MatrixProductNN),
            "gemmNT" => Some(OperationType::MatrixProductNT),
            "gemmTN" => Some(OperationType::MatrixProductTN),
            "gemmTT" => Some(OperationType::MatrixProductTT),
            _ => None,
        }
    }

    /// Scalar axpy has no description key; it always runs the built-in variant.
    pub fn description_name(self) -> Option<&'static str> {
        match self {
            OperationType::ScalarAxpy => None,
            OperationType::VectorAxpy => Some("vaxpy"),
            OperationType::Reduction => Some("dot"),
            OperationType::MatrixAxpy => Some("maxpy"),
            OperationType::RowWiseReduction => Some("gemvN"),
            OperationType::ColWiseReduction => Some("gemvT"),
            OperationType::MatrixProductNN => Some("gemmNN"),
            OperationType::MatrixProductNT => Some("gemmNT"),
            OperationType::MatrixProductTN => Some("gemmTN"),
            OperationType::MatrixProductTT => Some("gemmTT"),
        }
    }

    /// Number of integers in one description profile for this operation.
    pub fn profile_arity(self) -> usize {
        match self {
            OperationType::ScalarAxpy | OperationType::VectorAxpy | OperationType::Reduction => 4,
            OperationType::MatrixAxpy => 6,
            OperationType::RowWiseReduction | OperationType::ColWiseReduction => 5,
            OperationType::MatrixProductNN
            | OperationType::MatrixProductNT
            | OperationType::MatrixProductTN
            | OperationType::MatrixProductTT => 11,
        }
    }

    /// `(lhs transposed, rhs transposed)` for matrix products.
    pub fn transposition(self) -> Option<(bool, bool)> {
        match self {
            OperationType::MatrixProductNN => Some((false, false)),
            OperationType::MatrixProductNT => Some((false, true)),
            OperationType::MatrixProductTN => Some((true, false)),
            OperationType::MatrixProductTT => Some((true, true)),
            _ => None,
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationType::ScalarAxpy => "scalar-axpy",
            OperationType::VectorAxpy => "vector-axpy",
            OperationType::Reduction => "reduction",
            OperationType::MatrixAxpy => "matrix-axpy",
            OperationType::RowWiseReduction => "row-reduction",
            OperationType::ColWiseReduction => "col-reduction",
            OperationType::MatrixProductNN => "matrix-product-nn",
            OperationType::MatrixProductNT => "matrix-product-nt",
            OperationType::MatrixProductTN => "matrix-product-tn",
            OperationType::MatrixProductTT => "matrix-product-tt",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn description_names_round_trip() {
        for op in OperationType::ALL {
            match op.description_name() {
                Some(name) => assert_eq!(OperationType::from_description_name(name), Some(op)),
                None => assert_eq!(op, OperationType::ScalarAxpy),
            }
        }
        assert_eq!(OperationType::from_description_name("gemm"), None);
        assert_eq!(OperationType::from_description_name("GEMMNN"), None);
    }
}
