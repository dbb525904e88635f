//! Generic EEP bit-field decoder: turns a telegram payload into a map of
//! semantic values using the profile's field descriptors.

use serde_json::{Map, Number, Value};

use crate::eep::{EepProfile, FieldKind};
use crate::telegram::RadioTelegram;

/// Decodes a telegram against a profile. The result always carries
/// `sender_id` and `rssi`; profiles without field descriptors get the raw
/// payload as uppercase hex instead of decoded fields. Fields extending
/// past the end of the payload are skipped.
pub fn decode(telegram: &RadioTelegram, profile: &EepProfile) -> Map<String, Value> {
    let mut decoded = Map::new();
    decoded.insert(
        "sender_id".to_string(),
        Value::String(telegram.sender_hex()),
    );
    decoded.insert("rssi".to_string(), Value::from(telegram.dbm));

    if profile.fields.is_empty() {
        decoded.insert("raw".to_string(), Value::String(telegram.payload_hex()));
        return decoded;
    }

    for field in &profile.fields {
        let Some(raw) = extract_bits(
            &telegram.payload,
            field.offset as usize,
            field.size as usize,
        ) else {
            continue;
        };

        match &field.kind {
            FieldKind::Enum { items } => {
                decoded.insert(field.shortcut.clone(), Value::from(raw));
                let raw_text = raw.to_string();
                if let Some(item) = items.iter().find(|i| i.value == raw_text) {
                    decoded.insert(
                        format!("{}_text", field.shortcut),
                        Value::String(item.description.clone()),
                    );
                }
            }
            FieldKind::Value {
                range_min,
                range_max,
                scale_min,
                scale_max,
                ..
            } => {
                if range_max != range_min {
                    let scaled = scale_min
                        + (raw as f64 - range_min) * (scale_max - scale_min)
                            / (range_max - range_min);
                    let rounded = (scaled * 100.0).round() / 100.0;
                    let value = Number::from_f64(rounded)
                        .map(Value::Number)
                        .unwrap_or(Value::Null);
                    decoded.insert(field.shortcut.clone(), value);
                } else {
                    decoded.insert(field.shortcut.clone(), Value::from(raw));
                }
            }
            FieldKind::Status | FieldKind::Raw => {
                decoded.insert(field.shortcut.clone(), Value::from(raw));
            }
        }
    }

    decoded
}

/// Reads `size` bits starting `offset` bits from the MSB of `payload`.
/// Returns None when the window extends past the payload (or is wider than
/// 64 bits, which no published profile uses).
pub fn extract_bits(payload: &[u8], offset: usize, size: usize) -> Option<u64> {
    if size == 0 || size > 64 || offset + size > payload.len() * 8 {
        return None;
    }

    let mut value: u64 = 0;
    for bit_index in offset..offset + size {
        let bit = (payload[bit_index / 8] >> (7 - bit_index % 8)) & 1;
        value = (value << 1) | bit as u64;
    }
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eep::{EnumItem, FieldDescriptor};
    use crate::telegram::RORG_4BS;

    fn telegram(payload: Vec<u8>) -> RadioTelegram {
        RadioTelegram {
            rorg: RORG_4BS,
            payload,
            sender_id: 0x05834FA4,
            status: 0,
            dbm: -64,
        }
    }

    fn profile(fields: Vec<FieldDescriptor>) -> EepProfile {
        EepProfile {
            rorg: "A5".to_string(),
            func: "02".to_string(),
            typ: "05".to_string(),
            description: String::new(),
            fields,
            is_custom: false,
        }
    }

    fn temperature_field() -> FieldDescriptor {
        FieldDescriptor {
            shortcut: "TMP".to_string(),
            description: "Temperature".to_string(),
            offset: 16,
            size: 8,
            kind: FieldKind::Value {
                range_min: 0.0,
                range_max: 255.0,
                scale_min: 40.0,
                scale_max: 0.0,
                unit: Some("°C".to_string()),
            },
        }
    }

    #[test]
    fn test_extract_bits() {
        let payload = [0b1010_0000, 0b0000_0001];
        assert_eq!(extract_bits(&payload, 0, 1), Some(1));
        assert_eq!(extract_bits(&payload, 1, 1), Some(0));
        assert_eq!(extract_bits(&payload, 0, 4), Some(0b1010));
        assert_eq!(extract_bits(&payload, 8, 8), Some(1));
        assert_eq!(extract_bits(&payload, 4, 8), Some(0b0000_0000));
        assert_eq!(extract_bits(&payload, 15, 1), Some(1));
        assert_eq!(extract_bits(&payload, 9, 8), None);
        assert_eq!(extract_bits(&payload, 0, 0), None);
    }

    #[test]
    fn test_scaled_temperature() {
        let decoded = decode(
            &telegram(vec![0x00, 0x00, 0x55, 0x08]),
            &profile(vec![temperature_field()]),
        );
        // raw 0x55 = 85 → 40 + 85 * (0 - 40) / 255 ≈ 26.67
        assert_eq!(decoded["TMP"], Value::from(26.67));
        assert_eq!(decoded["sender_id"], Value::from("0x05834FA4"));
        assert_eq!(decoded["rssi"], Value::from(-64));
    }

    #[test]
    fn test_degenerate_range_emits_raw_integer() {
        let mut field = temperature_field();
        field.kind = FieldKind::Value {
            range_min: 0.0,
            range_max: 0.0,
            scale_min: 0.0,
            scale_max: 100.0,
            unit: None,
        };
        let decoded = decode(&telegram(vec![0x00, 0x00, 0x55, 0x08]), &profile(vec![field]));
        assert_eq!(decoded["TMP"], Value::from(0x55u64));
    }

    #[test]
    fn test_enum_with_text_companion() {
        let field = FieldDescriptor {
            shortcut: "PIR".to_string(),
            description: String::new(),
            offset: 0,
            size: 2,
            kind: FieldKind::Enum {
                items: vec![
                    EnumItem {
                        value: "0".to_string(),
                        description: "off".to_string(),
                    },
                    EnumItem {
                        value: "1".to_string(),
                        description: "motion".to_string(),
                    },
                ],
            },
        };
        let decoded = decode(&telegram(vec![0b0100_0000]), &profile(vec![field]));
        assert_eq!(decoded["PIR"], Value::from(1u64));
        assert_eq!(decoded["PIR_text"], Value::from("motion"));
    }

    #[test]
    fn test_enum_without_matching_item_omits_text() {
        let field = FieldDescriptor {
            shortcut: "PIR".to_string(),
            description: String::new(),
            offset: 0,
            size: 2,
            kind: FieldKind::Enum {
                items: vec![EnumItem {
                    value: "0".to_string(),
                    description: "off".to_string(),
                }],
            },
        };
        let decoded = decode(&telegram(vec![0b1000_0000]), &profile(vec![field]));
        assert_eq!(decoded["PIR"], Value::from(2u64));
        assert!(!decoded.contains_key("PIR_text"));
    }

    #[test]
    fn test_field_past_payload_end_is_skipped() {
        let decoded = decode(&telegram(vec![0x00]), &profile(vec![temperature_field()]));
        assert!(!decoded.contains_key("TMP"));
        assert!(decoded.contains_key("sender_id"));
    }

    #[test]
    fn test_profile_without_fields_yields_raw_hex() {
        let decoded = decode(&telegram(vec![0xDE, 0xAD, 0xBE, 0xEF]), &profile(Vec::new()));
        assert_eq!(decoded["raw"], Value::from("DEADBEEF"));
    }

    #[test]
    fn test_status_field_emits_integer() {
        let field = FieldDescriptor {
            shortcut: "T21".to_string(),
            description: String::new(),
            offset: 2,
            size: 1,
            kind: FieldKind::Status,
        };
        let decoded = decode(&telegram(vec![0b0010_0000]), &profile(vec![field]));
        assert_eq!(decoded["T21"], Value::from(1u64));
    }
}
