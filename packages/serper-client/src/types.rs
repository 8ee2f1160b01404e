use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request body for `POST /places`.
#[derive(Debug, Clone, Serialize)]
pub struct PlacesRequest {
    pub q: String,
    pub page: i64,
    pub num: i64,
}

/// Deserialized `POST /places` response.
///
/// Individual places are kept as raw JSON objects: the payload schema drifts
/// over time and downstream ingestion wants every field, known or not.
#[derive(Debug, Clone, Deserialize)]
pub struct PlacesResponse {
    #[serde(default)]
    pub places: Vec<Value>,
    #[serde(default)]
    pub credits: i64,
    #[serde(rename = "searchParameters", default)]
    pub search_parameters: Option<Value>,
}

/// One completed places call, with transport metadata.
#[derive(Debug, Clone)]
pub struct PlacesPage {
    pub response: PlacesResponse,
    pub api_status: u16,
    pub elapsed_ms: i64,
}

/// Stable identifier for a place record: `placeId` when present, else `cid`.
///
/// Records carrying neither cannot be deduplicated and should be dropped by
/// the caller, not synthesized an id.
pub fn place_uid(place: &Value) -> Option<String> {
    for key in ["placeId", "cid"] {
        match place.get(key) {
            Some(Value::String(s)) if !s.is_empty() => return Some(s.clone()),
            Some(Value::Number(n)) => return Some(n.to_string()),
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn place_uid_prefers_place_id() {
        let place = json!({"placeId": "ChIJabc", "cid": "123456"});
        assert_eq!(place_uid(&place), Some("ChIJabc".into()));
    }

    #[test]
    fn place_uid_falls_back_to_cid() {
        let place = json!({"title": "Somewhere", "cid": "987654"});
        assert_eq!(place_uid(&place), Some("987654".into()));
    }

    #[test]
    fn numeric_cid_is_stringified() {
        let place = json!({"cid": 42});
        assert_eq!(place_uid(&place), Some("42".into()));
    }

    #[test]
    fn missing_both_ids_yields_none() {
        let place = json!({"title": "Anonymous"});
        assert_eq!(place_uid(&place), None);
    }

    #[test]
    fn empty_place_id_is_ignored() {
        let place = json!({"placeId": "", "cid": "77"});
        assert_eq!(place_uid(&place), Some("77".into()));
    }

    #[test]
    fn response_defaults_apply_to_sparse_bodies() {
        let resp: PlacesResponse = serde_json::from_str("{}").unwrap();
        assert!(resp.places.is_empty());
        assert_eq!(resp.credits, 0);
    }
}
