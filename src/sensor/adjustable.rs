//! Named, sigma-scaled, lockable parameters that an optimizer can drive.
//!
//! Each parameter holds a normalized `value`; the physical offset the sensor
//! model applies is `value * sigma`. The store keeps several named adjustment
//! sets and exactly one of them is current.

use serde::{Deserialize, Serialize};

use super::SensorModelError;
use crate::keywordlist::{join_key, KeywordList, KeywordListError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdjustableParameter {
    pub id: usize,
    pub description: String,
    pub unit: String,
    /// Normalized value, nominally within `[-1, 1]`.
    pub value: f64,
    /// Physical size of one normalized unit.
    pub sigma: f64,
    /// Normalized value that re-centering and reset return to.
    pub center: f64,
    pub locked: bool,
}

impl AdjustableParameter {
    pub fn new(id: usize, description: &str, unit: &str, sigma: f64) -> Self {
        Self {
            id,
            description: description.to_string(),
            unit: unit.to_string(),
            value: 0.0,
            sigma,
            center: 0.0,
            locked: false,
        }
    }

    /// Physical offset applied by the owning model.
    pub fn offset(&self) -> f64 {
        self.value * self.sigma
    }

    fn save_state(&self, kwl: &mut KeywordList, prefix: &str) {
        kwl.save(&join_key(prefix, "description"), &self.description);
        kwl.save(&join_key(prefix, "unit"), &self.unit);
        kwl.save(&join_key(prefix, "parameter"), self.value);
        kwl.save(&join_key(prefix, "sigma"), self.sigma);
        kwl.save(&join_key(prefix, "center"), self.center);
        kwl.save(&join_key(prefix, "lock_flag"), self.locked);
    }

    fn load_state(id: usize, kwl: &KeywordList, prefix: &str) -> Result<Self, KeywordListError> {
        Ok(Self {
            id,
            description: kwl.require(&join_key(prefix, "description"))?.to_string(),
            unit: kwl
                .find(&join_key(prefix, "unit"))
                .unwrap_or_default()
                .to_string(),
            value: kwl.get_f64(&join_key(prefix, "parameter"))?,
            sigma: kwl.get_f64(&join_key(prefix, "sigma"))?,
            center: kwl.get_or(&join_key(prefix, "center"), 0.0)?,
            locked: kwl.get_bool(&join_key(prefix, "lock_flag"))?,
        })
    }
}

/// One named set of parameter values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Adjustment {
    pub description: String,
    pub parameters: Vec<AdjustableParameter>,
    pub dirty: bool,
}

impl Adjustment {
    pub fn new(description: &str) -> Self {
        Self {
            description: description.to_string(),
            parameters: Vec::new(),
            dirty: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdjustableParameterStore {
    adjustments: Vec<Adjustment>,
    current: usize,
}

impl Default for AdjustableParameterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AdjustableParameterStore {
    pub fn new() -> Self {
        Self {
            adjustments: vec![Adjustment::new("Initial adjustment")],
            current: 0,
        }
    }

    fn current(&self) -> &Adjustment {
        &self.adjustments[self.current]
    }

    fn current_mut(&mut self) -> &mut Adjustment {
        &mut self.adjustments[self.current]
    }

    fn checked(&self, index: usize) -> Result<&AdjustableParameter, SensorModelError> {
        self.current()
            .parameters
            .get(index)
            .ok_or(SensorModelError::ParameterIndexOutOfRange(index))
    }

    fn checked_mut(&mut self, index: usize) -> Result<&mut AdjustableParameter, SensorModelError> {
        let adjustment = self.current_mut();
        adjustment.dirty = true;
        adjustment
            .parameters
            .get_mut(index)
            .ok_or(SensorModelError::ParameterIndexOutOfRange(index))
    }

    /// Appends a parameter to the current adjustment and returns its index.
    pub fn add_parameter(&mut self, description: &str, unit: &str, sigma: f64) -> usize {
        let adjustment = self.current_mut();
        let id = adjustment.parameters.len();
        adjustment
            .parameters
            .push(AdjustableParameter::new(id, description, unit, sigma));
        id
    }

    pub fn number_of_parameters(&self) -> usize {
        self.current().parameters.len()
    }

    pub fn parameters(&self) -> &[AdjustableParameter] {
        &self.current().parameters
    }

    pub fn parameter(&self, index: usize) -> Result<&AdjustableParameter, SensorModelError> {
        self.checked(index)
    }

    pub fn value(&self, index: usize) -> Result<f64, SensorModelError> {
        Ok(self.checked(index)?.value)
    }

    pub fn set_value(&mut self, index: usize, value: f64) -> Result<(), SensorModelError> {
        if !value.is_finite() {
            return Err(SensorModelError::InvalidParams(format!(
                "parameter {index} value must be finite"
            )));
        }
        self.checked_mut(index)?.value = value;
        Ok(())
    }

    pub fn sigma(&self, index: usize) -> Result<f64, SensorModelError> {
        Ok(self.checked(index)?.sigma)
    }

    pub fn set_sigma(&mut self, index: usize, sigma: f64) -> Result<(), SensorModelError> {
        if !(sigma.is_finite() && sigma > 0.0) {
            return Err(SensorModelError::InvalidParams(format!(
                "parameter {index} sigma must be positive"
            )));
        }
        self.checked_mut(index)?.sigma = sigma;
        Ok(())
    }

    pub fn set_center(&mut self, index: usize, center: f64) -> Result<(), SensorModelError> {
        self.checked_mut(index)?.center = center;
        Ok(())
    }

    pub fn is_locked(&self, index: usize) -> Result<bool, SensorModelError> {
        Ok(self.checked(index)?.locked)
    }

    pub fn set_locked(&mut self, index: usize, locked: bool) -> Result<(), SensorModelError> {
        self.checked_mut(index)?.locked = locked;
        Ok(())
    }

    pub fn lock_all(&mut self) {
        let adjustment = self.current_mut();
        adjustment.dirty = true;
        adjustment.parameters.iter_mut().for_each(|p| p.locked = true);
    }

    pub fn unlock_all(&mut self) {
        let adjustment = self.current_mut();
        adjustment.dirty = true;
        adjustment
            .parameters
            .iter_mut()
            .for_each(|p| p.locked = false);
    }

    /// Physical offset of parameter `index`; zero for an unknown index.
    pub fn compute_offset(&self, index: usize) -> f64 {
        self.current()
            .parameters
            .get(index)
            .map_or(0.0, AdjustableParameter::offset)
    }

    /// Moves one parameter back to its center.
    pub fn recenter(&mut self, index: usize) -> Result<(), SensorModelError> {
        let parameter = self.checked_mut(index)?;
        parameter.value = parameter.center;
        Ok(())
    }

    pub fn find_parameter_index(&self, description: &str) -> Option<usize> {
        self.current()
            .parameters
            .iter()
            .position(|p| p.description.eq_ignore_ascii_case(description))
    }

    pub fn free_indices(&self) -> Vec<usize> {
        self.current()
            .parameters
            .iter()
            .enumerate()
            .filter(|(_, p)| !p.locked)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn locked_indices(&self) -> Vec<usize> {
        self.current()
            .parameters
            .iter()
            .enumerate()
            .filter(|(_, p)| p.locked)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn number_of_free_parameters(&self) -> usize {
        self.current().parameters.iter().filter(|p| !p.locked).count()
    }

    pub fn values(&self) -> Vec<f64> {
        self.current().parameters.iter().map(|p| p.value).collect()
    }

    pub fn sigmas(&self) -> Vec<f64> {
        self.current().parameters.iter().map(|p| p.sigma).collect()
    }

    // Adjustment sets

    pub fn number_of_adjustments(&self) -> usize {
        self.adjustments.len()
    }

    pub fn current_adjustment_index(&self) -> usize {
        self.current
    }

    pub fn current_adjustment_description(&self) -> &str {
        &self.current().description
    }

    pub fn set_current_adjustment_description(&mut self, description: &str) {
        self.current_mut().description = description.to_string();
    }

    pub fn is_dirty(&self) -> bool {
        self.current().dirty
    }

    pub fn clear_dirty(&mut self) {
        self.current_mut().dirty = false;
    }

    /// Adds a set with the current parameter layout at center values and makes it current.
    pub fn new_adjustment(&mut self, description: &str) -> usize {
        let mut adjustment = Adjustment::new(description);
        adjustment.parameters = self
            .current()
            .parameters
            .iter()
            .cloned()
            .map(|mut p| {
                p.value = p.center;
                p
            })
            .collect();
        self.adjustments.push(adjustment);
        self.current = self.adjustments.len() - 1;
        self.current
    }

    /// Duplicates the current set (values included) and makes the copy current.
    pub fn copy_adjustment(&mut self, description: &str) -> usize {
        let mut adjustment = self.current().clone();
        adjustment.description = description.to_string();
        adjustment.dirty = false;
        self.adjustments.push(adjustment);
        self.current = self.adjustments.len() - 1;
        self.current
    }

    pub fn select_adjustment(&mut self, index: usize) -> Result<(), SensorModelError> {
        if index >= self.adjustments.len() {
            return Err(SensorModelError::InvalidParams(format!(
                "adjustment {index} does not exist"
            )));
        }
        self.current = index;
        Ok(())
    }

    /// Removes a set. The last remaining set cannot be erased.
    pub fn erase_adjustment(&mut self, index: usize) -> Result<(), SensorModelError> {
        if index >= self.adjustments.len() || self.adjustments.len() == 1 {
            return Err(SensorModelError::InvalidParams(format!(
                "adjustment {index} cannot be erased"
            )));
        }
        self.adjustments.remove(index);
        if self.current >= index && self.current > 0 {
            self.current -= 1;
        }
        Ok(())
    }

    /// Returns every parameter of the current set to its center.
    pub fn reset_adjustment(&mut self) {
        let adjustment = self.current_mut();
        adjustment.dirty = true;
        adjustment
            .parameters
            .iter_mut()
            .for_each(|p| p.value = p.center);
    }

    pub fn save_state(&self, kwl: &mut KeywordList, prefix: &str) {
        kwl.save(
            &join_key(prefix, "number_of_adjustments"),
            self.adjustments.len(),
        );
        kwl.save(&join_key(prefix, "current_adjustment"), self.current);
        for (i, adjustment) in self.adjustments.iter().enumerate() {
            let adj_prefix = join_key(prefix, &format!("adjustment_{i}"));
            kwl.save(
                &join_key(&adj_prefix, "description"),
                &adjustment.description,
            );
            kwl.save(&join_key(&adj_prefix, "dirty_flag"), adjustment.dirty);
            kwl.save(
                &join_key(&adj_prefix, "number_of_params"),
                adjustment.parameters.len(),
            );
            for (j, parameter) in adjustment.parameters.iter().enumerate() {
                parameter.save_state(kwl, &join_key(&adj_prefix, &format!("adj_param_{j}")));
            }
        }
    }

    pub fn load_state(kwl: &KeywordList, prefix: &str) -> Result<Self, KeywordListError> {
        let count: usize = kwl.get(&join_key(prefix, "number_of_adjustments"))?;
        let current: usize = kwl.get_or(&join_key(prefix, "current_adjustment"), 0)?;
        let mut adjustments = Vec::with_capacity(count);
        for i in 0..count {
            let adj_prefix = join_key(prefix, &format!("adjustment_{i}"));
            let mut adjustment = Adjustment::new(
                kwl.find(&join_key(&adj_prefix, "description"))
                    .unwrap_or_default(),
            );
            adjustment.dirty = kwl
                .find(&join_key(&adj_prefix, "dirty_flag"))
                .map(|_| kwl.get_bool(&join_key(&adj_prefix, "dirty_flag")))
                .transpose()?
                .unwrap_or(false);
            let params: usize = kwl.get(&join_key(&adj_prefix, "number_of_params"))?;
            for j in 0..params {
                adjustment.parameters.push(AdjustableParameter::load_state(
                    j,
                    kwl,
                    &join_key(&adj_prefix, &format!("adj_param_{j}")),
                )?);
            }
            adjustments.push(adjustment);
        }
        if adjustments.is_empty() {
            adjustments.push(Adjustment::new("Initial adjustment"));
        }
        let current = current.min(adjustments.len() - 1);
        Ok(Self {
            adjustments,
            current,
        })
    }
}
