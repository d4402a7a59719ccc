//! Stable backup checksum: canonical JSON (recursively sorted object
//! keys), SHA-256, first 16 hex characters. Restore recomputes this
//! identically, so any re-serialization of the envelope must round-trip.

use sha2::{Digest, Sha256};

fn write_canonical(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

pub fn backup_checksum(data: &serde_json::Value) -> String {
    let mut canonical = String::new();
    write_canonical(data, &mut canonical);
    let digest = Sha256::digest(canonical.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_order_does_not_change_the_checksum() {
        let a = serde_json::json!({"b": 1, "a": {"y": [1, 2], "x": null}});
        let b: serde_json::Value =
            serde_json::from_str(r#"{"a": {"x": null, "y": [1, 2]}, "b": 1}"#).unwrap();
        assert_eq!(backup_checksum(&a), backup_checksum(&b));
        assert_eq!(backup_checksum(&a).len(), 16);
    }

    #[test]
    fn content_changes_change_the_checksum() {
        let a = serde_json::json!({"rows": [1, 2, 3]});
        let b = serde_json::json!({"rows": [1, 2, 4]});
        assert_ne!(backup_checksum(&a), backup_checksum(&b));
    }
}
