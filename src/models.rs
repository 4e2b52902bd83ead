use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

/// A title as rendered in rails, grids and the overlay.
///
/// Upstream endpoints disagree on key names, so every field is read through a
/// list of fallbacks. The untouched upstream JSON is not kept here; detail
/// views work on the raw value instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TitleRecord {
    pub id: String,
    pub name: String,
    pub poster: Option<String>,
    pub backdrop: Option<String>,
    pub year: Option<i32>,
    pub rating_kp: Option<f64>,
    pub rating_imdb: Option<f64>,
    pub country: Option<String>,
    pub genre: Option<String>,
    pub duration: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cast: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seasons: Option<Vec<Value>>,
    /// Branding fields attached by overrides (logos, colors, franchise).
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl TitleRecord {
    pub fn from_value(value: &Value) -> Option<Self> {
        let id = item_id(value)?;
        let name = pick_str(value, &["name", "title", "details.name", "original_title"])
            .unwrap_or_default();

        Some(Self {
            id,
            name,
            poster: pick_str(value, &["poster", "details.poster", "cover"]),
            backdrop: pick_str(
                value,
                &["backdrop", "details.bg_poster.backdrop", "wide_poster"],
            ),
            year: pick_number(value, &["year", "details.released", "details.year"])
                .map(|y| y as i32),
            rating_kp: pick_number(
                value,
                &[
                    "rating_kp",
                    "rating",
                    "rating_imdb",
                    "details.rating_kp",
                    "details.rating",
                ],
            ),
            rating_imdb: pick_number(value, &["rating_imdb", "details.rating_imdb"]),
            country: pick_joined(value, &["country", "details.country"]),
            genre: pick_joined(value, &["genre", "details.genre"]),
            duration: pick_number(value, &["duration", "details.duration", "time"])
                .filter(|d| *d >= 0.0)
                .map(|d| d as u32),
            cast: pick(value, &["cast", "details.cast"])
                .map(person_names)
                .unwrap_or_default(),
            seasons: pick(value, &["seasons", "details.seasons"])
                .and_then(|s| s.as_array())
                .cloned(),
            extra: Map::new(),
        })
    }
}

/// Items of an upstream list response. Accepts `{type: "list", channels: [...]}`
/// and bare arrays; anything else is treated as no data.
pub fn list_items(value: &Value) -> &[Value] {
    match value {
        Value::Array(items) => items.as_slice(),
        Value::Object(obj) => obj
            .get("channels")
            .and_then(|c| c.as_array())
            .map(|c| c.as_slice())
            .unwrap_or(&[]),
        _ => &[],
    }
}

pub fn parse_list(value: &Value) -> Vec<TitleRecord> {
    list_items(value)
        .iter()
        .filter_map(TitleRecord::from_value)
        .collect()
}

/// Identifier of an upstream item: `id`, then `details.id`, then `ident`.
pub fn item_id(value: &Value) -> Option<String> {
    pick(value, &["id", "details.id", "ident"]).and_then(scalar_string)
}

/// Keeps the first occurrence of every key, preserving order. Items without a
/// key are always kept.
pub fn dedupe_by<T, F>(items: impl IntoIterator<Item = T>, key: F) -> Vec<T>
where
    F: Fn(&T) -> Option<String>,
{
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| match key(item) {
            Some(k) => seen.insert(k),
            None => true,
        })
        .collect()
}

pub(crate) fn pick<'a>(value: &'a Value, paths: &[&str]) -> Option<&'a Value> {
    paths.iter().find_map(|path| {
        let found = path
            .split('.')
            .try_fold(value, |current, key| current.get(key))?;
        (!found.is_null()).then_some(found)
    })
}

pub(crate) fn pick_str(value: &Value, paths: &[&str]) -> Option<String> {
    paths.iter().find_map(|path| {
        pick(value, &[*path])
            .and_then(scalar_string)
            .filter(|s| !s.trim().is_empty())
    })
}

fn pick_number(value: &Value, paths: &[&str]) -> Option<f64> {
    paths.iter().find_map(|path| {
        pick(value, &[*path]).and_then(|v| match v {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().replace(',', ".").parse().ok(),
            _ => None,
        })
    })
}

fn pick_joined(value: &Value, paths: &[&str]) -> Option<String> {
    paths.iter().find_map(|path| match pick(value, &[*path])? {
        Value::Array(parts) => {
            let joined = parts
                .iter()
                .filter_map(scalar_string)
                .collect::<Vec<_>>()
                .join(", ");
            (!joined.is_empty()).then_some(joined)
        }
        other => scalar_string(other).filter(|s| !s.is_empty()),
    })
}

pub(crate) fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Cast lists arrive either as plain names or as `{name: ...}` objects.
pub(crate) fn person_names(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|people| {
            people
                .iter()
                .filter_map(|p| match p {
                    Value::String(s) => Some(s.clone()),
                    Value::Object(_) => pick_str(p, &["name", "name_ru", "name_en"]),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reads_fallback_keys() {
        let raw = json!({
            "details": {
                "id": 77,
                "name": "Матрица",
                "poster": "https://img/77.jpg",
                "released": "1999",
                "rating": "8,5",
                "genre": ["фантастика", "боевик"]
            },
            "country": "США"
        });
        let record = TitleRecord::from_value(&raw).unwrap();
        assert_eq!(record.id, "77");
        assert_eq!(record.name, "Матрица");
        assert_eq!(record.poster.as_deref(), Some("https://img/77.jpg"));
        assert_eq!(record.year, Some(1999));
        assert_eq!(record.rating_kp, Some(8.5));
        assert_eq!(record.genre.as_deref(), Some("фантастика, боевик"));
        assert_eq!(record.country.as_deref(), Some("США"));
    }

    #[test]
    fn rating_prefers_kp_then_generic_then_imdb() {
        let only_imdb = json!({"id": "a", "rating_imdb": 7.1});
        assert_eq!(
            TitleRecord::from_value(&only_imdb).unwrap().rating_kp,
            Some(7.1)
        );
        let both = json!({"id": "a", "rating_kp": 6.0, "rating": 9.0});
        assert_eq!(TitleRecord::from_value(&both).unwrap().rating_kp, Some(6.0));
    }

    #[test]
    fn items_without_id_are_skipped() {
        let list = json!({"type": "list", "channels": [{"name": "no id"}, {"id": 1}]});
        let parsed = parse_list(&list);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].id, "1");
    }

    #[test]
    fn unexpected_shapes_are_empty() {
        assert!(parse_list(&json!({"error": "nope"})).is_empty());
        assert!(parse_list(&json!("text")).is_empty());
        assert_eq!(parse_list(&json!([{"id": 3}])).len(), 1);
    }

    #[test]
    fn dedupe_keeps_first_occurrence() {
        let items = vec![("a", 1), ("b", 2), ("a", 3), ("c", 4)];
        let unique = dedupe_by(items, |(k, _)| Some(k.to_string()));
        assert_eq!(unique, vec![("a", 1), ("b", 2), ("c", 4)]);
    }

    #[test]
    fn cast_accepts_objects_and_strings() {
        let raw = json!({"id": 1, "cast": ["Keanu Reeves", {"name": "Carrie-Anne Moss"}, 5]});
        let record = TitleRecord::from_value(&raw).unwrap();
        assert_eq!(record.cast, vec!["Keanu Reeves", "Carrie-Anne Moss"]);
    }
}
