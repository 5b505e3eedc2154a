use std::any::type_name;
use std::collections::BTreeMap;
use std::str::FromStr;

#[inline]
pub fn short_type_name<K>() -> Option<&'static str> {
    let type_name = type_name::<K>();
    type_name.split("::").last()
}

/// Parse a label value, ignoring missing or malformed values.
pub fn parse_label<T: FromStr>(labels: Option<&BTreeMap<String, String>>, key: &str) -> Option<T> {
    labels
        .and_then(|l| l.get(key))
        .and_then(|v| v.parse::<T>().ok())
}
