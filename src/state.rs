use crate::error::BridgeError;

/// Ordered set of active predictor indices.
///
/// Entries keep their insertion order; removing one shifts the later entries
/// down by one position. Membership and position lookups go through a dense
/// table over all `p` predictors, so they never hold positions across changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveSet {
    indices: Vec<usize>,
    position: Vec<Option<usize>>,
}

impl ActiveSet {
    pub fn new(num_predictors: usize) -> Self {
        Self {
            indices: Vec::new(),
            position: vec![None; num_predictors],
        }
    }

    pub fn from_indices(num_predictors: usize, indices: &[usize]) -> Result<Self, BridgeError> {
        let mut set = Self::new(num_predictors);
        for &j in indices {
            if j >= num_predictors {
                return Err(BridgeError::Configuration(format!(
                    "predictor index {j} is out of range for {num_predictors} predictors"
                )));
            }
            if set.contains(j) {
                return Err(BridgeError::Configuration(format!(
                    "predictor index {j} appears twice"
                )));
            }
            set.push(j);
        }
        Ok(set)
    }

    pub fn num_predictors(&self) -> usize {
        self.position.len()
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn contains(&self, predictor: usize) -> bool {
        self.position(predictor).is_some()
    }

    pub fn position(&self, predictor: usize) -> Option<usize> {
        self.position.get(predictor).copied().flatten()
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.indices.iter().copied()
    }

    pub(crate) fn push(&mut self, predictor: usize) {
        debug_assert!(!self.contains(predictor));
        self.position[predictor] = Some(self.indices.len());
        self.indices.push(predictor);
    }

    /// Remove `predictor` and return its former position.
    pub(crate) fn remove(&mut self, predictor: usize) -> Option<usize> {
        let pos = self.position(predictor)?;
        self.indices.remove(pos);
        self.position[predictor] = None;
        for &later in &self.indices[pos..] {
            if let Some(p) = self.position[later].as_mut() {
                *p -= 1;
            }
        }
        Some(pos)
    }
}

/// The full state of the chain. `L` holds the family-specific latent
/// variables; snapshots drop them by projecting to `ModelState<()>`.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelState<L> {
    pub active_set: ActiveSet,
    /// Aligned with `active_set`.
    pub coefficients: Vec<f64>,
    pub global_scale: f64,
    /// Aligned with `active_set`.
    pub local_scales: Vec<f64>,
    pub likelihood_params: L,
}

impl<L> ModelState<L> {
    pub fn dim(&self) -> usize {
        self.active_set.len()
    }

    /// Coefficient of `predictor`, exactly zero when it is inactive.
    pub fn coefficient(&self, predictor: usize) -> f64 {
        self.active_set
            .position(predictor)
            .map(|pos| self.coefficients[pos])
            .unwrap_or(0.)
    }

    /// Coefficients over all predictors.
    pub fn dense_coefficients(&self) -> Vec<f64> {
        let mut out = vec![0f64; self.active_set.num_predictors()];
        for (&j, &beta) in self.active_set.indices().iter().zip(&self.coefficients) {
            out[j] = beta;
        }
        out
    }

    pub fn project(&self) -> ModelState<()> {
        ModelState {
            active_set: self.active_set.clone(),
            coefficients: self.coefficients.clone(),
            global_scale: self.global_scale,
            local_scales: self.local_scales.clone(),
            likelihood_params: (),
        }
    }

    /// Append a predictor with its coefficient and local scale.
    pub(crate) fn insert(&mut self, predictor: usize, coefficient: f64, local_scale: f64) {
        self.active_set.push(predictor);
        self.coefficients.push(coefficient);
        self.local_scales.push(local_scale);
    }

    /// Remove a predictor, returning its coefficient and local scale.
    pub(crate) fn delete(&mut self, predictor: usize) -> Option<(f64, f64)> {
        let pos = self.active_set.remove(predictor)?;
        Some((self.coefficients.remove(pos), self.local_scales.remove(pos)))
    }

    pub fn check_invariants(&self, excluded: &[bool]) -> Result<(), BridgeError> {
        let k = self.active_set.len();
        if self.coefficients.len() != k || self.local_scales.len() != k {
            return Err(BridgeError::CorruptState(format!(
                "{} active predictors but {} coefficients and {} local scales",
                k,
                self.coefficients.len(),
                self.local_scales.len()
            )));
        }
        if !(self.global_scale > 0. && self.global_scale.is_finite()) {
            return Err(BridgeError::CorruptState(format!(
                "global scale {} is not positive",
                self.global_scale
            )));
        }
        if let Some(&bad) = self
            .local_scales
            .iter()
            .find(|&&s| !(s > 0. && s.is_finite()))
        {
            return Err(BridgeError::CorruptState(format!(
                "local scale {bad} is not positive"
            )));
        }
        if let Some(&bad) = self.coefficients.iter().find(|b| !b.is_finite()) {
            return Err(BridgeError::CorruptState(format!(
                "coefficient {bad} is not finite"
            )));
        }
        for (pos, j) in self.active_set.iter().enumerate() {
            if self.active_set.position(j) != Some(pos) {
                return Err(BridgeError::CorruptState(format!(
                    "position table disagrees for predictor {j}"
                )));
            }
            if excluded.get(j).copied().unwrap_or(false) {
                return Err(BridgeError::CorruptState(format!(
                    "excluded predictor {j} is active"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    use super::*;

    fn state(indices: &[usize]) -> ModelState<()> {
        ModelState {
            active_set: ActiveSet::from_indices(10, indices).unwrap(),
            coefficients: indices.iter().map(|&j| j as f64 + 0.5).collect(),
            global_scale: 1.,
            local_scales: vec![1.; indices.len()],
            likelihood_params: (),
        }
    }

    #[test]
    fn delete_preserves_order() {
        let mut s = state(&[4, 1, 7, 3]);
        assert_eq!(s.delete(1), Some((1.5, 1.)));
        assert_eq!(s.active_set.indices(), &[4, 7, 3]);
        assert_eq!(s.coefficients, vec![4.5, 7.5, 3.5]);
        assert_eq!(s.active_set.position(3), Some(2));
        assert_eq!(s.delete(1), None);

        s.insert(0, -2., 0.3);
        assert_eq!(s.active_set.indices(), &[4, 7, 3, 0]);
        assert_eq!(s.coefficient(0), -2.);
        assert_eq!(s.coefficient(5), 0.);
        assert_eq!(
            s.dense_coefficients(),
            vec![-2., 0., 0., 3.5, 4.5, 0., 0., 7.5, 0., 0.]
        );
        s.check_invariants(&[false; 10]).unwrap();
    }

    #[test]
    fn invariant_violations() {
        let mut s = state(&[2, 5]);
        let mut excluded = vec![false; 10];
        excluded[5] = true;
        assert!(matches!(
            s.check_invariants(&excluded),
            Err(BridgeError::CorruptState(_))
        ));

        s.local_scales.pop();
        assert!(s.check_invariants(&[false; 10]).is_err());
    }

    #[test]
    fn rejects_bad_indices() {
        assert!(ActiveSet::from_indices(3, &[0, 3]).is_err());
        assert!(ActiveSet::from_indices(3, &[1, 1]).is_err());
    }

    proptest! {
        #[test]
        fn push_remove_keeps_positions(ops in prop::collection::vec((any::<bool>(), 0usize..20), 0..200)) {
            let mut set = ActiveSet::new(20);
            let mut reference: Vec<usize> = Vec::new();
            for (insert, j) in ops {
                if insert && !set.contains(j) {
                    set.push(j);
                    reference.push(j);
                } else if !insert {
                    let expected = reference.iter().position(|&x| x == j);
                    prop_assert_eq!(set.remove(j), expected);
                    if let Some(pos) = expected {
                        reference.remove(pos);
                    }
                }
                prop_assert_eq!(set.indices(), &reference[..]);
                for (pos, &j) in reference.iter().enumerate() {
                    prop_assert_eq!(set.position(j), Some(pos));
                }
            }
        }
    }
}
