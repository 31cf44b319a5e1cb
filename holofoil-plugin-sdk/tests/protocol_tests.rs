use holofoil_plugin_sdk::protocol::{decode, encode};
use holofoil_plugin_sdk::{
    ApiRequest, CardSummary, ErrorTag, NotificationLevel, Reply, WorkerError, WorkerInMessage,
    WorkerOutMessage,
};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};

// ── Host → worker ─────────────────────────────────────────────────

#[test]
fn init_defaults_config_to_null() {
    let raw = r#"{"type":"init","plugin_id":"community.x","capabilities":["storage"]}"#;
    let msg: WorkerInMessage = decode(raw).unwrap();
    assert_eq!(
        msg,
        WorkerInMessage::Init {
            plugin_id: "community.x".into(),
            capabilities: vec!["storage".into()],
            config: Value::Null,
        }
    );
}

#[test]
fn api_response_wire_shape() {
    let msg = WorkerInMessage::ApiResponse {
        call_id: 3,
        reply: Reply::Err(WorkerError::new(ErrorTag::PermissionDenied, "network not granted")),
    };
    let value: Value = serde_json::from_str(&encode(&msg).unwrap()).unwrap();
    assert_eq!(
        value,
        json!({
            "type": "api_response",
            "call_id": 3,
            "reply": { "err": { "tag": "permission-denied", "message": "network not granted" } }
        })
    );
}

// ── Worker → host ─────────────────────────────────────────────────

#[test]
fn every_api_name_matches_its_wire_tag() {
    let requests = vec![
        ApiRequest::StorageGet { key: "k".into() },
        ApiRequest::StorageSet { key: "k".into(), value: json!(1) },
        ApiRequest::StorageRemove { key: "k".into() },
        ApiRequest::Notify {
            title: "t".into(),
            body: String::new(),
            level: NotificationLevel::Warning,
        },
        ApiRequest::SettingsGet { key: "k".into() },
        ApiRequest::SettingsSet { key: "k".into(), value: json!(true) },
        ApiRequest::Modal { title: "t".into(), body: String::new(), buttons: vec![] },
        ApiRequest::CollectionList { offset: 0, limit: Some(10) },
        ApiRequest::CollectionGet { card_id: "c".into() },
        ApiRequest::CollectionTag { card_id: "c".into(), tag: "foil".into() },
        ApiRequest::HttpGet { url: "https://example.test".into() },
    ];
    for request in requests {
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["api"], request.name());
        let back: ApiRequest = serde_json::from_value(value).unwrap();
        assert_eq!(back, request);
    }
}

#[test]
fn notify_level_defaults_to_info() {
    let req: ApiRequest = serde_json::from_value(json!({
        "api": "notify",
        "args": { "title": "Pack opened" }
    }))
    .unwrap();
    assert_eq!(
        req,
        ApiRequest::Notify {
            title: "Pack opened".into(),
            body: String::new(),
            level: NotificationLevel::Info,
        }
    );
}

#[test]
fn unknown_api_is_rejected() {
    let raw = r#"{"type":"api_call","call_id":1,"request":{"api":"fs.read","args":{"path":"/"}}}"#;
    assert!(decode::<WorkerOutMessage>(raw).is_err());
}

#[test]
fn card_summary_optional_fields() {
    let card: CardSummary = serde_json::from_value(json!({"id": "c1", "name": "Charizard"})).unwrap();
    assert!(card.tags.is_empty());
    assert_eq!(card.set, "");
}
