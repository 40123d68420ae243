use bytecheck::CheckBytes;
use rkyv::{Archive, Serialize};

/// A stored configuration value.
///
/// The tag set mirrors the wire types clients exchange: fixed-width
/// integers, the string-like leaves, and the container forms. Values read
/// back from a database carry their tag, so no schema is needed to
/// recover the type. The rkyv archive of a `Value` is the binary form
/// used by database files and serialized change-sets; the serde form is
/// the text used by keyfile backends.
#[derive(Clone, Debug, PartialEq, Archive, Serialize, serde::Serialize, serde::Deserialize)]
#[archive_attr(derive(Debug, CheckBytes))]
#[archive_attr(check_bytes(
    bound = "__C: rkyv::validation::ArchiveContext, <__C as rkyv::Fallible>::Error: std::error::Error"
))]
#[archive(bound(serialize = "__S: rkyv::ser::ScratchSpace + rkyv::ser::Serializer"))]
#[serde(rename_all = "kebab-case")]
#[repr(C)]
pub enum Value {
    Bool(bool),
    Byte(u8),
    Int16(i16),
    Uint16(u16),
    Int32(i32),
    Uint32(u32),
    Int64(i64),
    Uint64(u64),
    Double(f64),
    Str(String),
    ObjectPath(String),
    Signature(String),
    Array(
        #[omit_bounds]
        #[archive_attr(omit_bounds)]
        Vec<Value>,
    ),
    Tuple(
        #[omit_bounds]
        #[archive_attr(omit_bounds)]
        Vec<Value>,
    ),
    DictEntry(
        #[omit_bounds]
        #[archive_attr(omit_bounds)]
        Box<Value>,
        #[omit_bounds]
        #[archive_attr(omit_bounds)]
        Box<Value>,
    ),
    Variant(
        #[omit_bounds]
        #[archive_attr(omit_bounds)]
        Box<Value>,
    ),
}

impl Value {
    /// Wraps the value in a variant, the form stored under keys.
    pub fn boxed(self) -> Value {
        Value::Variant(Box::new(self))
    }

    /// Unwraps any number of variant layers.
    pub fn unboxed(&self) -> &Value {
        let mut value = self;
        while let Value::Variant(inner) = value {
            value = inner;
        }
        value
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.unboxed() {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self.unboxed() {
            Value::Int32(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self.unboxed() {
            Value::Int64(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self.unboxed() {
            Value::Double(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self.unboxed() {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int32(i)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int64(i)
    }
}

impl From<f64> for Value {
    fn from(d: f64) -> Self {
        Value::Double(d)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl ArchivedValue {
    /// Deserializes the archived form back into an owned value.
    pub fn to_value(&self) -> Value {
        match self {
            ArchivedValue::Bool(b) => Value::Bool(*b),
            ArchivedValue::Byte(b) => Value::Byte(*b),
            ArchivedValue::Int16(i) => Value::Int16(*i),
            ArchivedValue::Uint16(u) => Value::Uint16(*u),
            ArchivedValue::Int32(i) => Value::Int32(*i),
            ArchivedValue::Uint32(u) => Value::Uint32(*u),
            ArchivedValue::Int64(i) => Value::Int64(*i),
            ArchivedValue::Uint64(u) => Value::Uint64(*u),
            ArchivedValue::Double(d) => Value::Double(*d),
            ArchivedValue::Str(s) => Value::Str(s.as_str().to_owned()),
            ArchivedValue::ObjectPath(s) => Value::ObjectPath(s.as_str().to_owned()),
            ArchivedValue::Signature(s) => Value::Signature(s.as_str().to_owned()),
            ArchivedValue::Array(vs) => Value::Array(vs.iter().map(|v| v.to_value()).collect()),
            ArchivedValue::Tuple(vs) => Value::Tuple(vs.iter().map(|v| v.to_value()).collect()),
            ArchivedValue::DictEntry(k, v) => {
                Value::DictEntry(Box::new(k.to_value()), Box::new(v.to_value()))
            }
            ArchivedValue::Variant(v) => Value::Variant(Box::new(v.to_value())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util;
    use rkyv::validation::validators::check_archived_root;

    #[test]
    fn archive_round_trip() {
        let value = Value::Tuple(vec![
            Value::Int32(-7),
            Value::Str("x".into()),
            Value::Array(vec![Value::Bool(true), Value::Bool(false)]),
            Value::DictEntry(Box::new(Value::Str("k".into())), Box::new(Value::Uint64(9))),
            Value::Int64(1).boxed(),
        ]);
        let bytes = util::archive(&value);
        let archived = check_archived_root::<Value>(&bytes).unwrap();
        assert_eq!(archived.to_value(), value);
    }

    #[test]
    fn text_round_trip() {
        let value = Value::Variant(Box::new(Value::Double(0.5)));
        let text = serde_json::to_string(&value).unwrap();
        assert_eq!(text, r#"{"variant":{"double":0.5}}"#);
        assert_eq!(serde_json::from_str::<Value>(&text).unwrap(), value);
    }

    #[test]
    fn unbox() {
        let value = Value::Int32(3).boxed();
        assert_eq!(value.as_i32(), Some(3));
        assert_eq!(value.unboxed(), &Value::Int32(3));
    }
}
