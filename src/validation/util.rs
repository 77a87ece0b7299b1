use super::Error;
use crate::elements::{Local, ValueType};

/// A helper to deal with the functions' locals: the parameters concatenated
/// with the run-length encoded declared locals.
#[derive(Debug)]
pub struct Locals<'a> {
    params: &'a [ValueType],
    local_groups: &'a [Local],
    count: u32,
}

impl<'a> Locals<'a> {
    /// Create a new wrapper around declared variables and parameters.
    ///
    /// Fails if the total count of locals does not fit `u32`.
    pub fn new(params: &'a [ValueType], local_groups: &'a [Local]) -> Result<Locals<'a>, Error> {
        let mut acc = params.len() as u32;
        for locals_group in local_groups {
            acc = acc
                .checked_add(locals_group.count())
                .ok_or_else(|| Error("more than 2^32 locals".into()))?;
        }

        Ok(Locals {
            params,
            local_groups,
            count: acc,
        })
    }

    /// Returns the type of a local variable (either a declared local or a
    /// parameter).
    pub fn type_of_local(&self, idx: u32) -> Result<ValueType, Error> {
        if let Some(param) = self.params.get(idx as usize) {
            return Ok(*param);
        }

        // The local index is relative to all locals, so subtract the
        // parameters and scan the run-length encoded groups.
        let mut start_idx = self.params.len() as u32;
        for locals_group in self.local_groups {
            let end_idx = start_idx
                .checked_add(locals_group.count())
                .ok_or_else(|| Error("more than 2^32 locals".into()))?;

            if idx >= start_idx && idx < end_idx {
                return Ok(locals_group.value_type());
            }

            start_idx = end_idx;
        }

        Err(Error(format!("Nonexistent local variable at index {}", idx)))
    }

    /// Returns the total count of all locals including parameters.
    pub fn count(&self) -> u32 {
        self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_and_declared_locals() {
        let params = vec![ValueType::I32, ValueType::I64];
        let local_groups = vec![Local::new(2, ValueType::F32), Local::new(1, ValueType::F64)];
        let locals = Locals::new(&params, &local_groups).unwrap();
        assert_eq!(locals.type_of_local(0).unwrap(), ValueType::I32);
        assert_eq!(locals.type_of_local(1).unwrap(), ValueType::I64);
        assert_eq!(locals.type_of_local(2).unwrap(), ValueType::F32);
        assert_eq!(locals.type_of_local(3).unwrap(), ValueType::F32);
        assert_eq!(locals.type_of_local(4).unwrap(), ValueType::F64);
        assert!(locals.type_of_local(5).is_err());
        assert_eq!(locals.count(), 5);
    }

    #[test]
    fn locals_overflow_is_rejected() {
        let local_groups = vec![Local::new(u32::MAX, ValueType::I32), Local::new(1, ValueType::I32)];
        assert!(Locals::new(&[], &local_groups).is_err());
    }
}
