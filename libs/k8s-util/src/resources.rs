use k8s_openapi::api::core::v1::{Container, EnvVar};
use serde_json::{Map, Value};

/// Set `vars` in the container environment, matching by name.
///
/// Existing entries keep their position and are replaced, missing ones are appended, and any
/// further entry with the same name is dropped. Unrelated entries are never touched. Returns
/// `true` if the container was modified.
pub fn upsert_env_vars(container: &mut Container, vars: &[EnvVar]) -> bool {
    let env = container.env.get_or_insert_with(Vec::new);
    let mut changed = false;
    for var in vars {
        let mut seen = false;
        let before = env.len();
        env.retain_mut(|e| {
            if e.name != var.name {
                return true;
            }
            if seen {
                return false;
            }
            seen = true;
            if *e != *var {
                *e = var.clone();
                changed = true;
            }
            true
        });
        if env.len() != before {
            changed = true;
        }
        if !seen {
            env.push(var.clone());
            changed = true;
        }
    }
    changed
}

/// Compute a JSON merge patch (RFC 7386) that turns `current` into `desired`.
///
/// Only changed keys are present; keys missing from `desired` are set to `null`. Returns an
/// empty object when both values are equal.
pub fn merge_patch_diff(current: &Value, desired: &Value) -> Value {
    match (current, desired) {
        (Value::Object(current), Value::Object(desired)) => {
            let mut patch = Map::new();
            for (key, value) in desired {
                match current.get(key) {
                    Some(old) if old == value => {}
                    Some(old @ Value::Object(_)) if value.is_object() => {
                        let nested = merge_patch_diff(old, value);
                        if nested.as_object().is_some_and(|o| !o.is_empty()) {
                            patch.insert(key.clone(), nested);
                        }
                    }
                    _ => {
                        patch.insert(key.clone(), value.clone());
                    }
                }
            }
            for key in current.keys() {
                if !desired.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            Value::Object(patch)
        }
        (_, desired) => desired.clone(),
    }
}
