use crate::error::SyncError;
use serde_json::Value;
use std::collections::BTreeMap;

const TEMP_REF_SUFFIX: &str = "_temp_id";

/// Rewrite temp-id references in an offline payload to server-assigned ids.
///
/// Any top-level key ending in `_temp_id` whose value is a string is looked
/// up in `resolved`; on a hit the key is replaced by the matching `_id` key
/// carrying the real id (`"site_temp_id": "t1"` becomes `"site_id": 501`).
/// A miss means the client submitted records out of dependency order and
/// fails the record with `UnresolvedReferenceError`.
///
/// Non-object payloads are left untouched; their validity is the store's
/// concern, not the reference rewriter's.
pub fn rewrite_temp_refs(
    payload: &mut Value,
    resolved: &BTreeMap<String, i64>,
) -> Result<(), SyncError> {
    let Some(map) = payload.as_object_mut() else {
        return Ok(());
    };

    let ref_keys: Vec<String> = map
        .keys()
        .filter(|k| k.ends_with(TEMP_REF_SUFFIX) && k.len() > TEMP_REF_SUFFIX.len())
        .cloned()
        .collect();

    for key in ref_keys {
        let Some(temp_id) = map.get(&key).and_then(Value::as_str).map(str::to_owned) else {
            // Null or non-string reference: nothing to resolve.
            continue;
        };
        let real_id = resolved.get(&temp_id).copied().ok_or_else(|| {
            SyncError::UnresolvedReference {
                field: key.clone(),
                temp_id: temp_id.clone(),
            }
        })?;
        map.remove(&key);
        let id_key = format!("{}_id", &key[..key.len() - TEMP_REF_SUFFIX.len()]);
        map.insert(id_key, Value::from(real_id));
    }

    Ok(())
}
