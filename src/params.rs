//! Bound parameter values for one execution.
use std::sync::Arc;

use crate::{
    Result,
    encode::{Encode, Encoded},
    error::ErrorKind,
    postgres::{Oid, UNSPECIFIED},
};

/// A mutable set of parameter values bound by 1-based index or, for NAMED
/// rewrites, by name.
///
/// Every slot carries the encoded value, its type oid and its wire format.
/// All slots must be bound before execution.
#[derive(Debug, Clone, Default)]
pub struct ParameterList {
    slots: Vec<Option<Encoded<'static>>>,
    /// Placeholder name to 1-based slot, shared with the rewritten query.
    /// Empty when the query has no named placeholders.
    names: Arc<[(String, usize)]>,
}

impl ParameterList {
    pub fn new(count: usize) -> ParameterList {
        ParameterList { slots: vec![None; count], names: Arc::from([]) }
    }

    pub(crate) fn with_names(count: usize, names: &[(String, usize)]) -> ParameterList {
        ParameterList {
            slots: vec![None; count],
            names: Arc::from(names.to_vec()),
        }
    }

    /// Number of slots the bound query expects.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Bind a value to a 1-based slot.
    pub fn bind<V: Encode<'static>>(&mut self, index: usize, value: V) -> Result<()> {
        let slot = self.slot_mut(index)?;
        *slot = Some(value.encode());
        Ok(())
    }

    /// Bind a value by placeholder name.
    pub fn bind_named<V: Encode<'static>>(&mut self, name: &str, value: V) -> Result<()> {
        let slot = self
            .names
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, slot)| *slot)
            .ok_or_else(|| ErrorKind::InvalidParameterName(name.to_owned()))?;
        self.slots[slot - 1] = Some(value.encode());
        Ok(())
    }

    /// Bind the SQL `NULL` to a slot.
    pub fn bind_null(&mut self, index: usize, oid: Oid) -> Result<()> {
        let slot = self.slot_mut(index)?;
        *slot = Some(Encoded::null(oid));
        Ok(())
    }

    /// Mark a slot unbound again.
    pub fn reset(&mut self, index: usize) -> Result<()> {
        let slot = self.slot_mut(index)?;
        *slot = None;
        Ok(())
    }

    /// Mark every slot unbound.
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
    }

    fn slot_mut(&mut self, index: usize) -> Result<&mut Option<Encoded<'static>>> {
        if index == 0 || index > self.slots.len() {
            return Err(ErrorKind::InvalidParameterValue(format!(
                "parameter index {index} out of range 1..={}",
                self.slots.len()
            ))
            .into());
        }
        Ok(&mut self.slots[index - 1])
    }

    /// Check that no slot is left unset, then collect the values.
    ///
    /// The returned vec is indexed by slot - 1. The value bytes are shared,
    /// not copied.
    pub(crate) fn bound(&self) -> Result<Vec<Encoded<'static>>> {
        self.slots
            .iter()
            .enumerate()
            .map(|(i, slot)| {
                slot.clone()
                    .ok_or_else(|| ErrorKind::MissingParameter { index: i + 1 }.into())
            })
            .collect()
    }

    /// Duplicate for a batch entry. O(n) over the slots.
    pub fn duplicate(&self) -> ParameterList {
        self.clone()
    }

    /// The type oid of every slot, [`UNSPECIFIED`] for unbound ones.
    pub(crate) fn oids(&self) -> Vec<Oid> {
        self.slots
            .iter()
            .map(|s| s.as_ref().map(Encoded::oid).unwrap_or(UNSPECIFIED))
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn positional_binding() {
        let mut params = ParameterList::new(2);
        params.bind(1, 111).unwrap();
        params.bind(2, "foo").unwrap();

        let bound = params.bound().unwrap();
        assert_eq!(bound.len(), 2);
        assert_eq!(bound[0].value_bytes(), b"111");
        assert_eq!(bound[1].value_bytes(), b"foo");
    }

    #[test]
    fn out_of_range_index_rejected() {
        let mut params = ParameterList::new(1);
        for bad in [0usize, 2] {
            let err = params.bind(bad, 1).unwrap_err();
            assert!(matches!(err.kind(), ErrorKind::InvalidParameterValue(_)));
        }
    }

    #[test]
    fn unknown_name_rejected() {
        let names = vec![("a".to_owned(), 1), ("b".to_owned(), 2)];
        let mut params = ParameterList::with_names(2, &names);
        params.bind_named("a", 1).unwrap();
        let err = params.bind_named("missing", 1).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::InvalidParameterName(_)));
    }

    #[test]
    fn named_bind_targets_its_global_slot() {
        // under ANY style a named placeholder can own a later slot
        let names = vec![("a".to_owned(), 5), ("b".to_owned(), 6)];
        let mut params = ParameterList::with_names(6, &names);
        params.bind_named("a", 555).unwrap();
        for i in 1..=4 {
            params.bind(i, 0).unwrap();
        }
        params.bind_named("b", 666).unwrap();

        let bound = params.bound().unwrap();
        assert_eq!(bound[4].value_bytes(), b"555");
        assert_eq!(bound[5].value_bytes(), b"666");
    }

    #[test]
    fn unbound_slot_fails_execution_check() {
        let mut params = ParameterList::new(2);
        params.bind(2, 5).unwrap();
        let err = params.bound().unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::MissingParameter { index: 1 }));
    }

    #[test]
    fn reset_marks_slot_unbound() {
        let mut params = ParameterList::new(1);
        params.bind(1, 5).unwrap();
        params.reset(1).unwrap();
        assert!(params.bound().is_err());
    }

    #[test]
    fn duplicate_is_independent() {
        let mut params = ParameterList::new(1);
        params.bind(1, 5).unwrap();
        let copy = params.duplicate();
        params.clear();
        assert!(copy.bound().is_ok());
        assert!(params.bound().is_err());
    }
}
