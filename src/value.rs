use bytes::{Buf, Bytes};

const INLINE_LEN: usize = 23;

/// Borrowed, inline, or shared value bytes.
#[derive(Clone)]
pub(crate) enum ValueRef<'a> {
    Slice(&'a [u8]),
    Inline {
        offset: usize,
        value: [u8; INLINE_LEN],
    },
    Bytes(Bytes),
}

impl ValueRef<'_> {
    pub fn inline(slice: &[u8]) -> ValueRef<'static> {
        let len = slice.len();
        assert!(len <= INLINE_LEN, "inline slice is too large");
        let mut value = [0u8; INLINE_LEN];
        value[INLINE_LEN - len..].copy_from_slice(slice);
        ValueRef::Inline { offset: INLINE_LEN - len, value }
    }

    pub fn len(&self) -> usize {
        match self {
            ValueRef::Slice(items) => items.len(),
            ValueRef::Inline { offset, .. } => INLINE_LEN - offset,
            ValueRef::Bytes(bytes) => bytes.len(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            ValueRef::Slice(items) => items,
            ValueRef::Inline { offset, value } => &value[*offset..],
            ValueRef::Bytes(bytes) => bytes,
        }
    }

    /// Copy a borrowed slice so the value can outlive its source.
    pub fn into_owned(self) -> ValueRef<'static> {
        match self {
            ValueRef::Slice(items) if items.len() <= INLINE_LEN => ValueRef::inline(items),
            ValueRef::Slice(items) => ValueRef::Bytes(Bytes::copy_from_slice(items)),
            ValueRef::Inline { offset, value } => ValueRef::Inline { offset, value },
            ValueRef::Bytes(bytes) => ValueRef::Bytes(bytes),
        }
    }
}

impl Buf for ValueRef<'_> {
    fn remaining(&self) -> usize {
        self.len()
    }

    fn chunk(&self) -> &[u8] {
        self.as_bytes()
    }

    fn advance(&mut self, cnt: usize) {
        match self {
            ValueRef::Slice(items) => Buf::advance(items, cnt),
            ValueRef::Inline { offset, .. } => *offset += cnt,
            ValueRef::Bytes(bytes) => Buf::advance(bytes, cnt),
        }
    }
}

impl<'a> From<&'a [u8]> for ValueRef<'a> {
    fn from(value: &'a [u8]) -> Self {
        ValueRef::Slice(value)
    }
}

impl<'a> From<&'a str> for ValueRef<'a> {
    fn from(value: &'a str) -> Self {
        ValueRef::Slice(value.as_bytes())
    }
}

impl From<String> for ValueRef<'static> {
    fn from(value: String) -> Self {
        ValueRef::Bytes(Bytes::from(value.into_bytes()))
    }
}

impl From<Vec<u8>> for ValueRef<'static> {
    fn from(value: Vec<u8>) -> Self {
        ValueRef::Bytes(Bytes::from(value))
    }
}

impl From<Bytes> for ValueRef<'static> {
    fn from(value: Bytes) -> Self {
        ValueRef::Bytes(value)
    }
}

impl std::fmt::Debug for ValueRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        use crate::ext::FmtExt;
        self.as_bytes().lossy().fmt(f)
    }
}
