//! Typed field access on lockdown dictionaries.
//!
//! Absent fields are `None`; a field of the wrong variant is an
//! [`LockdownError::UnexpectedType`].

use imobile_core::error::Result;
use imobile_core::LockdownError;
use imobile_plist::{Dictionary, PropertyNode};

fn typed<'a, T>(
    dict: &'a Dictionary,
    key: &'static str,
    expected: &'static str,
    extract: impl FnOnce(&'a PropertyNode) -> Option<T>,
) -> Result<Option<T>> {
    match dict.get(key) {
        None => Ok(None),
        Some(node) => extract(node)
            .map(Some)
            .ok_or_else(|| LockdownError::UnexpectedType { key, expected }.into()),
    }
}

pub(crate) fn string(dict: &Dictionary, key: &'static str) -> Result<Option<String>> {
    typed(dict, key, "String", |n| n.as_string().map(str::to_string))
}

pub(crate) fn require_string(dict: &Dictionary, key: &'static str) -> Result<String> {
    string(dict, key)?.ok_or_else(|| LockdownError::MissingField(key).into())
}

pub(crate) fn data(dict: &Dictionary, key: &'static str) -> Result<Option<Vec<u8>>> {
    typed(dict, key, "Data", |n| n.as_data().map(<[u8]>::to_vec))
}

pub(crate) fn require_data(dict: &Dictionary, key: &'static str) -> Result<Vec<u8>> {
    data(dict, key)?.ok_or_else(|| LockdownError::MissingField(key).into())
}

pub(crate) fn boolean(dict: &Dictionary, key: &'static str) -> Result<Option<bool>> {
    typed(dict, key, "Boolean", PropertyNode::as_boolean)
}

pub(crate) fn integer(dict: &Dictionary, key: &'static str) -> Result<Option<i64>> {
    typed(dict, key, "Integer", PropertyNode::as_integer)
}
