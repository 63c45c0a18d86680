use nalgebra::DVector;

use crate::error::{ApexError, ApexResult};

/// Ordered sequence of residual vectors.
///
/// Entries carry no symbol labels: position is the only link between an entry
/// and the factor or conditional that produced it, so consumers must walk the
/// sequence in the order its producer emitted it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Errors {
    entries: Vec<DVector<f64>>,
}

impl Errors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Zero-filled sequence with the given per-entry lengths
    pub fn zeros(shape: impl IntoIterator<Item = usize>) -> Self {
        Self {
            entries: shape.into_iter().map(DVector::zeros).collect(),
        }
    }

    pub fn push(&mut self, entry: DVector<f64>) {
        self.entries.push(entry);
    }

    /// Move every entry of `tail` onto the end of this sequence.
    pub fn splice(&mut self, mut tail: Errors) {
        self.entries.append(&mut tail.entries);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&DVector<f64>> {
        self.entries.get(index)
    }

    /// Entries in order
    pub fn as_slice(&self) -> &[DVector<f64>] {
        &self.entries
    }

    pub fn iter(&self) -> std::slice::Iter<'_, DVector<f64>> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, DVector<f64>> {
        self.entries.iter_mut()
    }

    /// Lengths of the entries, in order
    pub fn shape(&self) -> Vec<usize> {
        self.entries.iter().map(|e| e.len()).collect()
    }

    /// Total number of scalar rows
    pub fn total_dim(&self) -> usize {
        self.entries.iter().map(|e| e.len()).sum()
    }

    pub fn dot(&self, other: &Errors) -> ApexResult<f64> {
        self.check_shape(other)?;
        Ok(self
            .entries
            .iter()
            .zip(&other.entries)
            .map(|(a, b)| a.dot(b))
            .sum())
    }

    pub fn norm_squared(&self) -> f64 {
        self.entries.iter().map(|e| e.norm_squared()).sum()
    }

    /// `self += alpha * x`
    pub fn axpy(&mut self, alpha: f64, x: &Errors) -> ApexResult<()> {
        self.check_shape(x)?;
        for (y, x) in self.entries.iter_mut().zip(&x.entries) {
            y.axpy(alpha, x, 1.0);
        }
        Ok(())
    }

    pub fn equals(&self, other: &Errors, tol: f64) -> bool {
        self.shape() == other.shape()
            && self
                .entries
                .iter()
                .zip(&other.entries)
                .all(|(a, b)| a.iter().zip(b.iter()).all(|(u, v)| (u - v).abs() <= tol))
    }

    fn check_shape(&self, other: &Errors) -> ApexResult<()> {
        if self.entries.len() != other.entries.len() {
            return Err(ApexError::OrderMismatch {
                expected: self.entries.len(),
                actual: other.entries.len(),
            });
        }
        for (i, (a, b)) in self.entries.iter().zip(&other.entries).enumerate() {
            if a.len() != b.len() {
                return Err(ApexError::dimension(
                    format!("errors entry {i}"),
                    a.len(),
                    b.len(),
                ));
            }
        }
        Ok(())
    }
}

impl From<Vec<DVector<f64>>> for Errors {
    fn from(entries: Vec<DVector<f64>>) -> Self {
        Self { entries }
    }
}

impl FromIterator<DVector<f64>> for Errors {
    fn from_iter<I: IntoIterator<Item = DVector<f64>>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a Errors {
    type Item = &'a DVector<f64>;
    type IntoIter = std::slice::Iter<'a, DVector<f64>>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

impl IntoIterator for Errors {
    type Item = DVector<f64>;
    type IntoIter = std::vec::IntoIter<DVector<f64>>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}
