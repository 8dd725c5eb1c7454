use std::fmt;

use smallvec::SmallVec;

/// Size parameters of one operation instance, e.g. `[N]` for axpy or
/// `[M, N, K]` for a matrix product. Used as the predictor feature vector and
/// as the exact-match key of the override table. Equality is element-wise and
/// order-sensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct InputShape(SmallVec<[i64; 4]>);

impl InputShape {
    pub fn new(dims: impl IntoIterator<Item = i64>) -> Self {
        InputShape(dims.into_iter().collect())
    }

    pub fn as_slice(&self) -> &[i64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Feature `index`, or `0` past the end.
    pub fn feature(&self, index: usize) -> i64 {
        self.0.get(index).copied().unwrap_or(0)
    }
}

impl From<Vec<i64>> for InputShape {
    fn from(dims: Vec<i64>) -> Self {
        InputShape(SmallVec::from_vec(dims))
    }
}

impl<const N: usize> From<[i64; N]> for InputShape {
    fn from(dims: [i64; N]) -> Self {
        InputShape::new(dims)
    }
}

impl fmt::Display for InputShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (idx, dim) in self.0.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{dim}")?;
        }
        f.write_str("]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_is_order_sensitive() {
        assert_eq!(InputShape::from([64, 32]), InputShape::from(vec![64, 32]));
        assert_ne!(InputShape::from([64, 32]), InputShape::from([32, 64]));
        assert_ne!(InputShape::from([64]), InputShape::from([64, 1]));
    }

    #[test]
    fn display_lists_dims() {
        assert_eq!(InputShape::from([128, 64, 32]).to_string(), "[128, 64, 32]");
        assert_eq!(InputShape::default().to_string(), "[]");
    }
}
