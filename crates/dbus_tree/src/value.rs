//! Plain values decoded from DBus variants.
//!
//! Decoding happens once, at the transport boundary. Object paths and arrays of object paths
//! stay distinguishable from other strings so the node can tell child references from scalars.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use zbus::zvariant::Value;

/// Property name to value, as delivered by `GetAll` or a `PropertiesChanged` signal.
pub type PropertyMap = HashMap<String, PropValue>;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PropValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Double(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<PropValue>),
    Dict(BTreeMap<String, PropValue>),
    /// A single object path.
    Path(String),
    /// An array of object paths (`ao`).
    PathList(Vec<String>),
}

impl PropValue {
    /// Decode a variant into a plain value, unwrapping nested variants.
    pub fn from_variant(value: &Value<'_>) -> PropValue {
        match value {
            Value::U8(x) => PropValue::UInt(u64::from(*x)),
            Value::Bool(x) => PropValue::Bool(*x),
            Value::I16(x) => PropValue::Int(i64::from(*x)),
            Value::U16(x) => PropValue::UInt(u64::from(*x)),
            Value::I32(x) => PropValue::Int(i64::from(*x)),
            Value::U32(x) => PropValue::UInt(u64::from(*x)),
            Value::I64(x) => PropValue::Int(*x),
            Value::U64(x) => PropValue::UInt(*x),
            Value::F64(x) => PropValue::Double(*x),
            Value::Str(x) => PropValue::Str(x.as_str().to_owned()),
            Value::Signature(x) => PropValue::Str(x.as_str().to_owned()),
            Value::ObjectPath(x) => PropValue::Path(x.as_str().to_owned()),
            Value::Value(inner) => PropValue::from_variant(inner),
            Value::Array(array) => match array.element_signature().as_str() {
                "o" => PropValue::PathList(
                    array
                        .iter()
                        .filter_map(|x| match x {
                            Value::ObjectPath(path) => Some(path.as_str().to_owned()),
                            _ => None,
                        })
                        .collect(),
                ),
                "y" => PropValue::Bytes(
                    array
                        .iter()
                        .filter_map(|x| match x {
                            Value::U8(b) => Some(*b),
                            _ => None,
                        })
                        .collect(),
                ),
                _ => PropValue::List(array.iter().map(PropValue::from_variant).collect()),
            },
            Value::Dict(dict) => {
                PropValue::Dict(dict.iter().map(|(k, v)| (dict_key(k), PropValue::from_variant(v))).collect())
            }
            Value::Structure(structure) => PropValue::List(structure.fields().iter().map(PropValue::from_variant).collect()),
            Value::Fd(_) => PropValue::Str("<unix-fd>".to_owned()),
            #[allow(unreachable_patterns)]
            other => PropValue::Str(format!("{:?}", other)),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropValue::Str(x) | PropValue::Path(x) => Some(x),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropValue::Bool(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            PropValue::UInt(x) => Some(*x),
            PropValue::Int(x) => u64::try_from(*x).ok(),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<String, PropValue>> {
        match self {
            PropValue::Dict(x) => Some(x),
            _ => None,
        }
    }

    /// Follow a chain of dictionary keys, e.g. `["802-11-wireless", "ssid"]`.
    pub fn lookup(&self, keys: &[&str]) -> Option<&PropValue> {
        keys.iter().try_fold(self, |value, key| value.as_dict()?.get(*key))
    }
}

fn dict_key(key: &Value<'_>) -> String {
    match PropValue::from_variant(key) {
        PropValue::Str(x) | PropValue::Path(x) => x,
        PropValue::Int(x) => x.to_string(),
        PropValue::UInt(x) => x.to_string(),
        PropValue::Bool(x) => x.to_string(),
        PropValue::Double(x) => x.to_string(),
        other => format!("{:?}", other),
    }
}

impl From<&str> for PropValue {
    fn from(x: &str) -> Self {
        PropValue::Str(x.to_owned())
    }
}

impl From<String> for PropValue {
    fn from(x: String) -> Self {
        PropValue::Str(x)
    }
}

impl From<bool> for PropValue {
    fn from(x: bool) -> Self {
        PropValue::Bool(x)
    }
}

impl From<u32> for PropValue {
    fn from(x: u32) -> Self {
        PropValue::UInt(u64::from(x))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use zbus::zvariant::{Array, ObjectPath};

    #[test]
    fn test_object_path_list_is_path_list() {
        let paths = vec![ObjectPath::try_from("/a").unwrap(), ObjectPath::try_from("/b").unwrap()];
        let value = Value::from(Array::from(paths));
        assert_eq!(PropValue::from_variant(&value), PropValue::PathList(vec!["/a".to_owned(), "/b".to_owned()]));
    }

    #[test]
    fn test_byte_array_and_nested_variant() {
        let ssid = Value::from(b"kiosk".to_vec());
        assert_eq!(PropValue::from_variant(&ssid), PropValue::Bytes(b"kiosk".to_vec()));

        let wrapped = Value::Value(Box::new(Value::from(42u32)));
        assert_eq!(PropValue::from_variant(&wrapped), PropValue::UInt(42));
    }

    #[test]
    fn test_single_path_stays_a_reference() {
        let value = Value::from(ObjectPath::try_from("/org/freedesktop/NetworkManager/AccessPoint/4").unwrap());
        assert_eq!(
            PropValue::from_variant(&value),
            PropValue::Path("/org/freedesktop/NetworkManager/AccessPoint/4".to_owned())
        );
    }

    #[test]
    fn test_lookup() {
        let settings = PropValue::Dict(maplit::btreemap! {
            "802-11-wireless".to_owned() => PropValue::Dict(maplit::btreemap! {
                "ssid".to_owned() => PropValue::Bytes(b"home".to_vec()),
            }),
        });
        assert_eq!(settings.lookup(&["802-11-wireless", "ssid"]), Some(&PropValue::Bytes(b"home".to_vec())));
        assert_eq!(settings.lookup(&["802-11-wireless", "mode"]), None);
        assert_eq!(settings.lookup(&["ipv4"]), None);
    }
}
