//! Adapter value model and stack variant conversion
//!
//! `EdgeValue` is the application-facing sum type over everything the adapter
//! can read, write, or report. Conversions cover both scalar and
//! single-dimension array forms of the stack's `Variant`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use opcua::types::{Array, Guid, LocalizedText, QualifiedName, UAString, Variant, VariantScalarTypeId};

use crate::error::AdapterError;
use crate::message::EdgeNodeId;

/// Length of the canonical GUID text form.
pub const GUID_TEXT_LENGTH: usize = 36;

/// Typed payload of a read result, write request, method argument, or report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EdgeValue {
    Boolean(bool),
    SByte(i8),
    Byte(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Float(f32),
    Double(f64),
    DateTime(DateTime<Utc>),
    String(String),
    ByteString(Vec<u8>),
    XmlElement(String),
    /// Canonical 36-character form `xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx`
    Guid(String),
    LocalizedText {
        locale: String,
        text: String,
    },
    QualifiedName {
        namespace_index: u16,
        name: String,
    },
    NodeId(EdgeNodeId),
    Array(Vec<EdgeValue>),
}

impl EdgeValue {
    /// Decode a stack variant, scalar or array. Unsupported wire types
    /// return `None` and the caller decides whether that is an error.
    pub fn from_variant(variant: &Variant) -> Option<EdgeValue> {
        match variant {
            Variant::Boolean(v) => Some(EdgeValue::Boolean(*v)),
            Variant::SByte(v) => Some(EdgeValue::SByte(*v)),
            Variant::Byte(v) => Some(EdgeValue::Byte(*v)),
            Variant::Int16(v) => Some(EdgeValue::Int16(*v)),
            Variant::UInt16(v) => Some(EdgeValue::UInt16(*v)),
            Variant::Int32(v) => Some(EdgeValue::Int32(*v)),
            Variant::UInt32(v) => Some(EdgeValue::UInt32(*v)),
            Variant::Int64(v) => Some(EdgeValue::Int64(*v)),
            Variant::UInt64(v) => Some(EdgeValue::UInt64(*v)),
            Variant::Float(v) => Some(EdgeValue::Float(*v)),
            Variant::Double(v) => Some(EdgeValue::Double(*v)),
            Variant::DateTime(v) => Some(EdgeValue::DateTime(v.as_chrono())),
            Variant::String(v) => Some(EdgeValue::String(v.as_ref().to_string())),
            Variant::ByteString(v) => {
                Some(EdgeValue::ByteString(v.value.clone().unwrap_or_default()))
            }
            Variant::XmlElement(v) => Some(EdgeValue::XmlElement(v.to_string())),
            Variant::Guid(v) => Some(EdgeValue::Guid(v.to_string())),
            Variant::LocalizedText(v) => Some(EdgeValue::LocalizedText {
                locale: v.locale.as_ref().to_string(),
                text: v.text.as_ref().to_string(),
            }),
            Variant::QualifiedName(v) => Some(EdgeValue::QualifiedName {
                namespace_index: v.namespace_index,
                name: v.name.as_ref().to_string(),
            }),
            Variant::NodeId(v) => Some(EdgeValue::NodeId(EdgeNodeId::from_node_id(v))),
            Variant::Array(array) => {
                let values: Option<Vec<EdgeValue>> =
                    array.values.iter().map(EdgeValue::from_variant).collect();
                values.map(EdgeValue::Array)
            }
            _ => None,
        }
    }

    /// Encode into a stack variant for writes and method inputs.
    pub fn to_variant(&self) -> Result<Variant, AdapterError> {
        match self {
            EdgeValue::Boolean(v) => Ok(Variant::from(*v)),
            EdgeValue::SByte(v) => Ok(Variant::from(*v)),
            EdgeValue::Byte(v) => Ok(Variant::from(*v)),
            EdgeValue::Int16(v) => Ok(Variant::from(*v)),
            EdgeValue::UInt16(v) => Ok(Variant::from(*v)),
            EdgeValue::Int32(v) => Ok(Variant::from(*v)),
            EdgeValue::UInt32(v) => Ok(Variant::from(*v)),
            EdgeValue::Int64(v) => Ok(Variant::from(*v)),
            EdgeValue::UInt64(v) => Ok(Variant::from(*v)),
            EdgeValue::Float(v) => Ok(Variant::from(*v)),
            EdgeValue::Double(v) => Ok(Variant::from(*v)),
            EdgeValue::DateTime(v) => Ok(Variant::from(opcua::types::DateTime::from(*v))),
            EdgeValue::String(v) => Ok(Variant::from(UAString::from(v.as_str()))),
            EdgeValue::ByteString(v) => {
                Ok(Variant::from(opcua::types::ByteString::from(v.clone())))
            }
            EdgeValue::XmlElement(v) => {
                Ok(Variant::XmlElement(opcua::types::XmlElement::from(v.as_str())))
            }
            EdgeValue::Guid(v) => {
                let guid = Guid::from_str(v)
                    .map_err(|_| AdapterError::UnsupportedValue(format!("guid {:?}", v)))?;
                Ok(Variant::from(guid))
            }
            EdgeValue::LocalizedText { locale, text } => Ok(Variant::from(LocalizedText {
                locale: UAString::from(locale.as_str()),
                text: UAString::from(text.as_str()),
            })),
            EdgeValue::QualifiedName { namespace_index, name } => {
                Ok(Variant::from(QualifiedName {
                    namespace_index: *namespace_index,
                    name: UAString::from(name.as_str()),
                }))
            }
            EdgeValue::NodeId(v) => Ok(Variant::from(v.to_node_id())),
            EdgeValue::Array(values) => {
                let value_type = values
                    .first()
                    .and_then(EdgeValue::scalar_type)
                    .ok_or_else(|| {
                        AdapterError::UnsupportedValue("empty or nested array".to_string())
                    })?;
                let variants: Result<Vec<Variant>, AdapterError> =
                    values.iter().map(EdgeValue::to_variant).collect();
                let array = Array::new(value_type, variants?)
                    .map_err(|e| AdapterError::UnsupportedValue(e.to_string()))?;
                Ok(Variant::Array(Box::new(array)))
            }
        }
    }

    /// The wire scalar type of this value, when it has one.
    fn scalar_type(&self) -> Option<VariantScalarTypeId> {
        match self {
            EdgeValue::Boolean(_) => Some(VariantScalarTypeId::Boolean),
            EdgeValue::SByte(_) => Some(VariantScalarTypeId::SByte),
            EdgeValue::Byte(_) => Some(VariantScalarTypeId::Byte),
            EdgeValue::Int16(_) => Some(VariantScalarTypeId::Int16),
            EdgeValue::UInt16(_) => Some(VariantScalarTypeId::UInt16),
            EdgeValue::Int32(_) => Some(VariantScalarTypeId::Int32),
            EdgeValue::UInt32(_) => Some(VariantScalarTypeId::UInt32),
            EdgeValue::Int64(_) => Some(VariantScalarTypeId::Int64),
            EdgeValue::UInt64(_) => Some(VariantScalarTypeId::UInt64),
            EdgeValue::Float(_) => Some(VariantScalarTypeId::Float),
            EdgeValue::Double(_) => Some(VariantScalarTypeId::Double),
            EdgeValue::DateTime(_) => Some(VariantScalarTypeId::DateTime),
            EdgeValue::String(_) => Some(VariantScalarTypeId::String),
            EdgeValue::ByteString(_) => Some(VariantScalarTypeId::ByteString),
            EdgeValue::XmlElement(_) => Some(VariantScalarTypeId::XmlElement),
            EdgeValue::Guid(_) => Some(VariantScalarTypeId::Guid),
            EdgeValue::LocalizedText { .. } => Some(VariantScalarTypeId::LocalizedText),
            EdgeValue::QualifiedName { .. } => Some(VariantScalarTypeId::QualifiedName),
            EdgeValue::NodeId(_) => Some(VariantScalarTypeId::NodeId),
            EdgeValue::Array(_) => None,
        }
    }

    /// Numeric view of the value, when it is numeric.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            EdgeValue::Boolean(v) => Some(if *v { 1.0 } else { 0.0 }),
            EdgeValue::SByte(v) => Some(*v as f64),
            EdgeValue::Byte(v) => Some(*v as f64),
            EdgeValue::Int16(v) => Some(*v as f64),
            EdgeValue::UInt16(v) => Some(*v as f64),
            EdgeValue::Int32(v) => Some(*v as f64),
            EdgeValue::UInt32(v) => Some(*v as f64),
            EdgeValue::Int64(v) => Some(*v as f64),
            EdgeValue::UInt64(v) => Some(*v as f64),
            EdgeValue::Float(v) => Some(*v as f64),
            EdgeValue::Double(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for EdgeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EdgeValue::Boolean(v) => write!(f, "{}", v),
            EdgeValue::SByte(v) => write!(f, "{}", v),
            EdgeValue::Byte(v) => write!(f, "{}", v),
            EdgeValue::Int16(v) => write!(f, "{}", v),
            EdgeValue::UInt16(v) => write!(f, "{}", v),
            EdgeValue::Int32(v) => write!(f, "{}", v),
            EdgeValue::UInt32(v) => write!(f, "{}", v),
            EdgeValue::Int64(v) => write!(f, "{}", v),
            EdgeValue::UInt64(v) => write!(f, "{}", v),
            EdgeValue::Float(v) => write!(f, "{:.4}", v),
            EdgeValue::Double(v) => write!(f, "{:.6}", v),
            EdgeValue::DateTime(v) => write!(f, "{}", v.to_rfc3339()),
            EdgeValue::String(v) => write!(f, "{}", v),
            EdgeValue::ByteString(v) => write!(f, "[{} bytes]", v.len()),
            EdgeValue::XmlElement(v) => write!(f, "{}", v),
            EdgeValue::Guid(v) => write!(f, "{}", v),
            EdgeValue::LocalizedText { text, .. } => write!(f, "{}", text),
            EdgeValue::QualifiedName { namespace_index, name } => {
                write!(f, "{}:{}", namespace_index, name)
            }
            EdgeValue::NodeId(v) => write!(f, "{}", v),
            EdgeValue::Array(values) => write!(f, "[{} elements]", values.len()),
        }
    }
}
