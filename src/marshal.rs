//! Conversion between Rust values and DynamoDB attribute maps.

use aws_sdk_dynamodb::types::AttributeValue;
use serde::{Serialize, de::DeserializeOwned};
use serde_dynamo::{from_item, to_attribute_value, to_item};

use crate::Error;
use crate::transport::Item;

/// Capability to move values in and out of the attribute-value model
///
/// [`crate::Db`] is generic over its marshaler, so an alternative
/// implementation is selected by naming it in the handle's type.
pub trait Marshaler: Send + Sync + 'static {
    /// Encode a whole value as an item
    fn encode<T: Serialize>(&self, value: &T) -> Result<Item, Error>;

    /// Decode an item into `T`
    fn decode<T: DeserializeOwned>(&self, item: Item) -> Result<T, Error>;

    /// Encode a single condition or update operand
    fn encode_value<V: Serialize>(&self, value: &V) -> Result<AttributeValue, Error>;

    /// Decode a batch of items, failing on the first bad one
    fn decode_all<T: DeserializeOwned>(&self, items: Vec<Item>) -> Result<Vec<T>, Error> {
        items.into_iter().map(|item| self.decode(item)).collect()
    }
}

/// `serde_dynamo` backed marshaler
#[derive(Clone, Copy, Debug, Default)]
pub struct SerdeMarshaler;

impl Marshaler for SerdeMarshaler {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Item, Error> {
        Ok(to_item(value)?)
    }

    fn decode<T: DeserializeOwned>(&self, item: Item) -> Result<T, Error> {
        Ok(from_item(item)?)
    }

    fn encode_value<V: Serialize>(&self, value: &V) -> Result<AttributeValue, Error> {
        Ok(to_attribute_value(value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Profile {
        id: String,
        age: u32,
        tags: Vec<String>,
    }

    #[test]
    fn test_encode_value_types() {
        let m = SerdeMarshaler;
        assert_eq!(m.encode_value(&"active").unwrap(), AttributeValue::S("active".into()));
        assert_eq!(m.encode_value(&18).unwrap(), AttributeValue::N("18".into()));
        assert_eq!(m.encode_value(&true).unwrap(), AttributeValue::Bool(true));
    }

    #[test]
    fn test_item_conversion() {
        let m = SerdeMarshaler;
        let profile = Profile {
            id: "p1".into(),
            age: 30,
            tags: vec!["a".into()],
        };
        let item = m.encode(&profile).unwrap();
        assert_eq!(item["id"], AttributeValue::S("p1".into()));
        assert_eq!(item["age"], AttributeValue::N("30".into()));

        let decoded: Profile = m.decode(item).unwrap();
        assert_eq!(decoded, profile);
    }

    #[test]
    fn test_decode_mismatch_is_marshal_error() {
        let m = SerdeMarshaler;
        let mut item = Item::new();
        let _ = item.insert("id".into(), AttributeValue::N("1".into()));
        let err = m.decode::<Profile>(item).unwrap_err();
        assert!(err.is_serialization_error());
    }
}
