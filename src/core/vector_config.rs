use std::collections::BTreeMap;
use std::collections::btree_map;
use std::ops::Mul;

use nalgebra::DVector;

use super::{Dimensions, Symbol};
use crate::error::{ApexError, ApexResult};

/// Named vector configuration: a map from variable symbol to a dense vector.
///
/// Each symbol appears at most once and keeps the dimension it was inserted
/// with. Binary operations run over the union of keys, a key missing on one
/// side counting as zero, but shared keys must agree on dimension.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VectorConfig {
    values: BTreeMap<Symbol, DVector<f64>>,
}

impl VectorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// All-zero config with the given variable dimensions
    pub fn zero(dims: &Dimensions) -> Self {
        let values = dims
            .iter()
            .map(|(key, &dim)| (key.clone(), DVector::zeros(dim)))
            .collect();
        Self { values }
    }

    /// Add a new variable; fails if the key is already present.
    pub fn insert(&mut self, key: impl Into<Symbol>, value: DVector<f64>) -> ApexResult<()> {
        match self.values.entry(key.into()) {
            btree_map::Entry::Occupied(entry) => Err(ApexError::DuplicateKey(entry.key().clone())),
            btree_map::Entry::Vacant(entry) => {
                entry.insert(value);
                Ok(())
            }
        }
    }

    /// Value of `key`, `MissingKey` if absent
    pub fn get(&self, key: impl AsRef<str>) -> ApexResult<&DVector<f64>> {
        let key = key.as_ref();
        self.values
            .get(key)
            .ok_or_else(|| ApexError::MissingKey(Symbol::from(key)))
    }

    /// Writable access to the entries of one variable. The slice keeps the
    /// variable's dimension fixed.
    pub fn get_mut(&mut self, key: impl AsRef<str>) -> ApexResult<&mut [f64]> {
        let key = key.as_ref();
        self.values
            .get_mut(key)
            .map(|v| v.as_mut_slice())
            .ok_or_else(|| ApexError::MissingKey(Symbol::from(key)))
    }

    pub fn contains(&self, key: impl AsRef<str>) -> bool {
        self.values.contains_key(key.as_ref())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &Symbol> {
        self.values.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Symbol, &DVector<f64>)> {
        self.values.iter()
    }

    /// Dimension of every key
    pub fn dims(&self) -> Dimensions {
        self.values
            .iter()
            .map(|(key, v)| (key.clone(), v.len()))
            .collect()
    }

    /// Total number of scalar entries
    pub fn total_dim(&self) -> usize {
        self.values.values().map(|v| v.len()).sum()
    }

    /// `self[key] += alpha * value`, inserting `alpha * value` when the key is new.
    pub fn add_scaled_to(
        &mut self,
        key: &Symbol,
        alpha: f64,
        value: &DVector<f64>,
    ) -> ApexResult<()> {
        match self.values.get_mut(key.as_str()) {
            Some(current) => {
                check_same_len(key, current.len(), value.len())?;
                current.axpy(alpha, value, 1.0);
            }
            None => {
                self.values.insert(key.clone(), value * alpha);
            }
        }
        Ok(())
    }

    /// `self += alpha * other`
    pub fn axpy(&mut self, alpha: f64, other: &VectorConfig) -> ApexResult<()> {
        for (key, value) in &other.values {
            self.add_scaled_to(key, alpha, value)?;
        }
        Ok(())
    }

    pub fn add_assign(&mut self, other: &VectorConfig) -> ApexResult<()> {
        self.axpy(1.0, other)
    }

    /// `self + other` over the union of keys; shared keys must agree in dimension
    pub fn add(&self, other: &VectorConfig) -> ApexResult<VectorConfig> {
        let mut sum = self.clone();
        sum.axpy(1.0, other)?;
        Ok(sum)
    }

    /// `self - other` over the union of keys
    pub fn sub(&self, other: &VectorConfig) -> ApexResult<VectorConfig> {
        let mut difference = self.clone();
        difference.axpy(-1.0, other)?;
        Ok(difference)
    }

    pub fn scale(&self, alpha: f64) -> VectorConfig {
        let values = self
            .values
            .iter()
            .map(|(key, v)| (key.clone(), v * alpha))
            .collect();
        VectorConfig { values }
    }

    pub fn scale_in_place(&mut self, alpha: f64) {
        for v in self.values.values_mut() {
            *v *= alpha;
        }
    }

    /// Inner product; keys present on one side only contribute nothing.
    pub fn dot(&self, other: &VectorConfig) -> ApexResult<f64> {
        let mut sum = 0.0;
        for (key, value) in &self.values {
            if let Some(rhs) = other.values.get(key) {
                check_same_len(key, value.len(), rhs.len())?;
                sum += value.dot(rhs);
            }
        }
        Ok(sum)
    }

    pub fn norm(&self) -> f64 {
        self.values
            .values()
            .map(|v| v.norm_squared())
            .sum::<f64>()
            .sqrt()
    }

    /// Same key set, same dimensions, entries equal up to `tol`
    pub fn equals(&self, other: &VectorConfig, tol: f64) -> bool {
        self.values.len() == other.values.len()
            && self.values.iter().all(|(key, v)| {
                other.values.get(key).is_some_and(|w| {
                    v.len() == w.len() && v.iter().zip(w.iter()).all(|(a, b)| (a - b).abs() <= tol)
                })
            })
    }

    /// Mutable entry for crate internals that need whole-vector updates.
    pub(crate) fn entry_mut(&mut self, key: &Symbol) -> ApexResult<&mut DVector<f64>> {
        self.values
            .get_mut(key.as_str())
            .ok_or_else(|| ApexError::MissingKey(key.clone()))
    }

    /// Entry for `key`, created as zeros of `dim` when absent.
    pub(crate) fn entry_or_zeros(
        &mut self,
        key: &Symbol,
        dim: usize,
    ) -> ApexResult<&mut DVector<f64>> {
        let value = self
            .values
            .entry(key.clone())
            .or_insert_with(|| DVector::zeros(dim));
        check_same_len(key, dim, value.len())?;
        Ok(value)
    }
}

fn check_same_len(key: &Symbol, expected: usize, actual: usize) -> ApexResult<()> {
    if expected != actual {
        return Err(ApexError::dimension(
            format!("config entry {key}"),
            expected,
            actual,
        ));
    }
    Ok(())
}

impl Mul<f64> for &VectorConfig {
    type Output = VectorConfig;

    fn mul(self, alpha: f64) -> VectorConfig {
        self.scale(alpha)
    }
}

impl<'a> IntoIterator for &'a VectorConfig {
    type Item = (&'a Symbol, &'a DVector<f64>);
    type IntoIter = btree_map::Iter<'a, Symbol, DVector<f64>>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.iter()
    }
}

impl IntoIterator for VectorConfig {
    type Item = (Symbol, DVector<f64>);
    type IntoIter = btree_map::IntoIter<Symbol, DVector<f64>>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.into_iter()
    }
}

impl FromIterator<(Symbol, DVector<f64>)> for VectorConfig {
    /// Later duplicates overwrite earlier ones.
    fn from_iter<I: IntoIterator<Item = (Symbol, DVector<f64>)>>(iter: I) -> Self {
        VectorConfig {
            values: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::dvector;

    fn config(entries: &[(&str, DVector<f64>)]) -> VectorConfig {
        let mut c = VectorConfig::new();
        for (key, v) in entries {
            c.insert(*key, v.clone()).unwrap();
        }
        c
    }

    #[test]
    fn test_insert_and_get() {
        let mut c = VectorConfig::new();
        c.insert("x1", dvector![1.0, 2.0]).unwrap();
        assert_eq!(c.get("x1").unwrap(), &dvector![1.0, 2.0]);
        assert_eq!(c.len(), 1);
        assert!(c.contains("x1"));
        assert!(!c.contains("x2"));
    }

    #[test]
    fn test_duplicate_insert_fails() {
        let mut c = VectorConfig::new();
        c.insert("x1", dvector![1.0]).unwrap();
        let err = c.insert("x1", dvector![2.0]).unwrap_err();
        assert_eq!(err, ApexError::DuplicateKey(Symbol::from("x1")));
        // the original value survives
        assert_eq!(c.get("x1").unwrap(), &dvector![1.0]);
    }

    #[test]
    fn test_missing_key() {
        let mut c = VectorConfig::new();
        assert_eq!(
            c.get("l1").unwrap_err(),
            ApexError::MissingKey(Symbol::from("l1"))
        );
        assert!(c.get_mut("l1").is_err());
    }

    #[test]
    fn test_get_mut_updates_in_place() {
        let mut c = config(&[("x1", dvector![1.0, 2.0])]);
        c.get_mut("x1").unwrap()[1] = 5.0;
        assert_eq!(c.get("x1").unwrap(), &dvector![1.0, 5.0]);
    }

    #[test]
    fn test_add_over_union() {
        let a = config(&[("x1", dvector![1.0, 2.0]), ("x2", dvector![3.0])]);
        let b = config(&[("x1", dvector![0.5, 0.5]), ("l1", dvector![1.0, 1.0])]);
        let sum = a.add(&b).unwrap();
        assert_eq!(sum.get("x1").unwrap(), &dvector![1.5, 2.5]);
        assert_eq!(sum.get("x2").unwrap(), &dvector![3.0]);
        assert_eq!(sum.get("l1").unwrap(), &dvector![1.0, 1.0]);
    }

    #[test]
    fn test_dimension_mismatch() {
        let a = config(&[("x1", dvector![1.0, 2.0])]);
        let b = config(&[("x1", dvector![1.0])]);
        assert!(matches!(
            a.add(&b),
            Err(ApexError::DimensionMismatch { .. })
        ));
        assert!(matches!(
            a.dot(&b),
            Err(ApexError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_scale_dot_and_axpy() {
        let a = config(&[("x1", dvector![1.0, 2.0]), ("x2", dvector![3.0])]);
        let scaled = &a * 2.0;
        assert_eq!(scaled.get("x2").unwrap(), &dvector![6.0]);
        assert_eq!(a.dot(&scaled).unwrap(), 2.0 * (1.0 + 4.0 + 9.0));

        let mut y = a.clone();
        y.axpy(-1.0, &a).unwrap();
        assert_eq!(y.norm(), 0.0);
        assert!(y.equals(&VectorConfig::zero(&a.dims()), 0.0));
    }

    #[test]
    fn test_zero_matches_dims() {
        let a = config(&[("x1", dvector![1.0, 2.0]), ("l1", dvector![3.0, 4.0, 5.0])]);
        let z = VectorConfig::zero(&a.dims());
        assert_eq!(z.total_dim(), 5);
        assert_eq!(z.get("l1").unwrap().len(), 3);
    }
}
