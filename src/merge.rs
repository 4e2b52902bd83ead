use serde_json::Value;

/// Merges `patch` over `base`, the patch winning at every nesting level.
///
/// Objects merge key by key, recursively. Arrays and scalars from the patch
/// replace the base value wholesale. A `null` in the patch carries no opinion
/// and leaves the base value untouched.
pub fn deep_merge(base: &Value, patch: &Value) -> Value {
    let mut merged = base.clone();
    deep_merge_into(&mut merged, patch);
    merged
}

pub fn deep_merge_into(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (_, Value::Null) => {}
        (Value::Object(target), Value::Object(source)) => {
            for (key, value) in source {
                if value.is_null() {
                    continue;
                }
                let nested = value.is_object() && target.get(key).is_some_and(Value::is_object);
                match target.get_mut(key) {
                    Some(existing) if nested => deep_merge_into(existing, value),
                    _ => {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, source) => *target = source.clone(),
    }
}
