//! Fat-entity codec: one domain object serialized to JSON and spread over a
//! fixed number of fixed-size string columns `E01`, `E02`, ...
//!
//! Decoding is lenient: an empty payload or a JSON `null` yields `T::default()`,
//! so rows written by older or newer shapes of a type still load.

use crate::edm::EdmValue;
use crate::entity::is_reserved_column;
use crate::settings::CodecSettings;
use crate::AppError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FatEntityCodec {
    max_slots: usize,
    slot_size: usize,
}

impl Default for FatEntityCodec {
    fn default() -> Self {
        Self::from_settings(&CodecSettings::default())
    }
}

impl FatEntityCodec {
    /// # Panics
    /// When `max_slots` is outside `1..=99` or `slot_size` is zero; [`FatbitSettings::validate`](crate::FatbitSettings::validate) checks both.
    pub fn new(max_slots: usize, slot_size: usize) -> Self {
        assert!(max_slots > 0 && max_slots <= 99, "max_slots must be within 1..=99");
        assert!(slot_size > 0, "slot_size must be > 0");
        Self { max_slots, slot_size }
    }

    pub fn from_settings(settings: &CodecSettings) -> Self {
        Self::new(settings.max_slots, settings.slot_size)
    }

    pub fn slot_name(index: usize) -> String {
        format!("E{:02}", index + 1)
    }

    pub fn max_slots(&self) -> usize {
        self.max_slots
    }

    /// Largest serialized form, in chars, that still fits.
    pub fn max_chars(&self) -> usize {
        self.max_slots * self.slot_size
    }

    pub fn encode<T: Serialize>(&self, obj: &T) -> Result<Vec<(String, String)>, AppError> {
        let json = serde_json::to_string(obj)?;
        let chars = json.chars().count();
        if chars > self.max_chars() {
            return Err(AppError::ObjectTooLargeForFatEntity {
                type_name: std::any::type_name::<T>().to_string(),
                chars,
                max_chars: self.max_chars(),
            });
        }
        Ok(split_chars(&json, self.slot_size)
            .into_iter()
            .enumerate()
            .map(|(i, slice)| (Self::slot_name(i), slice.to_string()))
            .collect())
    }

    pub fn decode<T: DeserializeOwned + Default>(&self, columns: &BTreeMap<String, EdmValue>) -> Result<T, AppError> {
        let json: String = columns
            .iter()
            .filter(|(name, _)| !is_reserved_column(name))
            .filter_map(|(_, value)| value.as_str())
            .collect();
        if json.trim().is_empty() {
            return Ok(T::default());
        }
        Ok(serde_json::from_str::<Option<T>>(&json)?.unwrap_or_default())
    }

    /// Indexed values live in one column and are cut at the slot size instead of spilling over.
    pub fn encode_indexed_value(&self, value: &serde_json::Value) -> Result<String, AppError> {
        let json = serde_json::to_string(value)?;
        Ok(match json.char_indices().nth(self.slot_size) {
            Some((cut, _)) => json[..cut].to_string(),
            None => json,
        })
    }

    /// A truncated value no longer parses and comes back as its raw text.
    pub fn decode_indexed_value(&self, raw: &str) -> Option<serde_json::Value> {
        if raw.is_empty() {
            return None;
        }
        Some(serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string())))
    }
}

fn split_chars(s: &str, chunk_chars: usize) -> Vec<&str> {
    let mut out = Vec::with_capacity(s.len() / chunk_chars + 1);
    let mut start = 0;
    let mut count = 0;
    for (idx, _) in s.char_indices() {
        if count == chunk_chars {
            out.push(&s[start..idx]);
            start = idx;
            count = 0;
        }
        count += 1;
    }
    if start < s.len() {
        out.push(&s[start..]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::Customer;
    use proptest::prelude::*;

    fn columns(pairs: Vec<(String, String)>) -> BTreeMap<String, EdmValue> {
        pairs.into_iter().map(|(k, v)| (k, EdmValue::String(v))).collect()
    }

    #[test]
    fn small_object_fits_one_slot() {
        let codec = FatEntityCodec::default();
        let c = Customer::sample("c1", "FL");
        let encoded = codec.encode(&c).unwrap();
        assert_eq!(encoded.len(), 1);
        assert_eq!(encoded[0].0, "E01");
        let back: Customer = codec.decode(&columns(encoded)).unwrap();
        assert_eq!(back, c);
    }

    #[test]
    fn large_object_spreads_over_ordered_slots() {
        let codec = FatEntityCodec::new(14, 16);
        let mut c = Customer::sample("c2", "GA");
        c.notes = "ß東🚀".repeat(20);
        let encoded = codec.encode(&c).unwrap();
        assert!(encoded.len() > 4);
        for (i, (name, slice)) in encoded.iter().enumerate() {
            assert_eq!(name, &FatEntityCodec::slot_name(i));
            assert!(slice.chars().count() <= 16);
        }
        let back: Customer = codec.decode(&columns(encoded)).unwrap();
        assert_eq!(back, c);
    }

    #[test]
    fn slot_names_sort_in_slot_order() {
        let names: Vec<String> = (0..14).map(FatEntityCodec::slot_name).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
        assert_eq!(names[13], "E14");
    }

    #[test]
    fn oversized_object_is_rejected() {
        let codec = FatEntityCodec::new(2, 8);
        let mut c = Customer::sample("c3", "NY");
        c.notes = "x".repeat(100);
        match codec.encode(&c) {
            Err(AppError::ObjectTooLargeForFatEntity { chars, max_chars, type_name }) => {
                assert!(chars > 16);
                assert_eq!(max_chars, 16);
                assert!(type_name.ends_with("Customer"));
            }
            other => panic!("expected ObjectTooLargeForFatEntity, got {:?}", other),
        }
    }

    #[test]
    fn exactly_full_budget_is_accepted() {
        let codec = FatEntityCodec::new(3, 4);
        // "\"abcdefghij\"" is 12 chars
        let encoded = codec.encode(&"abcdefghij").unwrap();
        assert_eq!(encoded.len(), 3);
        assert!(codec.encode(&"abcdefghijk").is_err());
    }

    #[test]
    fn reserved_and_non_string_columns_are_ignored() {
        let codec = FatEntityCodec::default();
        let c = Customer::sample("c4", "TX");
        let mut cols = columns(codec.encode(&c).unwrap());
        cols.insert("IndexedProperty".into(), EdmValue::from("\"TX\""));
        cols.insert("DomainObjectType".into(), EdmValue::from("Customer"));
        cols.insert("Z99".into(), EdmValue::from(42i32));
        let back: Customer = codec.decode(&cols).unwrap();
        assert_eq!(back, c);
    }

    #[test]
    fn empty_or_null_payload_falls_back_to_default() {
        let codec = FatEntityCodec::default();
        let empty: Customer = codec.decode(&BTreeMap::new()).unwrap();
        assert_eq!(empty, Customer::default());
        let null: Customer = codec.decode(&columns(vec![("E01".into(), "null".into())])).unwrap();
        assert_eq!(null, Customer::default());
    }

    #[test]
    fn indexed_value_is_truncated_not_split() {
        let codec = FatEntityCodec::new(14, 8);
        let short = codec.encode_indexed_value(&serde_json::json!("FL")).unwrap();
        assert_eq!(codec.decode_indexed_value(&short), Some(serde_json::json!("FL")));

        let long = codec.encode_indexed_value(&serde_json::json!("a very long indexed value")).unwrap();
        assert_eq!(long.chars().count(), 8);
        assert_eq!(codec.decode_indexed_value(&long), Some(serde_json::Value::String(long.clone())));
    }

    fn customers() -> impl Strategy<Value = Customer> {
        (any::<String>(), any::<String>(), "[A-Z]{2}", any::<u32>(), any::<String>())
            .prop_map(|(id, name, state, age, notes)| Customer { id, name, state, age, notes })
    }

    proptest! {
        #[test]
        fn any_object_round_trips_or_is_rejected_whole(c in customers(), max_slots in 1usize..=14, slot_size in 1usize..=64) {
            let codec = FatEntityCodec::new(max_slots, slot_size);
            let json = serde_json::to_string(&c).unwrap();
            let chars = json.chars().count();
            match codec.encode(&c) {
                Ok(slots) => {
                    prop_assert!(chars <= codec.max_chars());
                    prop_assert!(slots.len() <= max_slots);
                    prop_assert!(slots.iter().all(|(_, s)| !s.is_empty() && s.chars().count() <= slot_size));
                    prop_assert_eq!(slots.iter().map(|(_, s)| s.as_str()).collect::<String>(), json);
                    let back: Customer = codec.decode(&columns(slots)).unwrap();
                    prop_assert_eq!(back, c);
                }
                Err(AppError::ObjectTooLargeForFatEntity { chars: reported, max_chars, .. }) => {
                    prop_assert_eq!(reported, chars);
                    prop_assert!(chars > max_chars);
                }
                Err(other) => {
                    prop_assert!(false, "unexpected error {:?}", other);
                }
            }
        }
    }
}
