use super::*;

use serde_json::json;

#[test]
fn handler_reply_is_merged_with_the_frame_id() {
    let registry = ObserverRegistry::default();
    registry
        .register("ping", |_| Ok(Some(json!({"echo": 1}))))
        .unwrap();

    let reply = dispatch_frame(&registry, r#"{"id":"m1","type":"ping"}"#).unwrap();
    assert_eq!(reply, json!({"echo": 1, "response_to": "m1"}));
}

#[test]
fn unregistered_type_gets_an_error_reply_naming_the_type() {
    let registry = ObserverRegistry::default();
    let reply = dispatch_frame(&registry, r#"{"id":"m2","type":"foo"}"#).unwrap();

    assert_eq!(reply["type"], "error");
    assert_eq!(reply["response_to"], "m2");
    let data = reply["data"].as_str().unwrap();
    assert!(data.contains("foo"), "{data}");
}

#[test]
fn frames_without_an_id_are_dropped_silently() {
    let registry = ObserverRegistry::default();
    registry.register("ping", |_| Ok(None)).unwrap();

    assert!(dispatch_frame(&registry, r#"{"type":"ping"}"#).is_none());
    assert!(dispatch_frame(&registry, "not json at all").is_none());
    assert!(dispatch_frame(&registry, r#"["an","array"]"#).is_none());
}

#[test]
fn frames_without_a_type_get_an_error_reply() {
    let registry = ObserverRegistry::default();
    let reply = dispatch_frame(&registry, r#"{"id":"m3"}"#).unwrap();

    assert_eq!(reply["type"], "error");
    assert_eq!(reply["response_to"], "m3");
    assert!(reply["data"].as_str().unwrap().contains("type"));
}

#[test]
fn handlers_returning_nothing_get_a_success_reply() {
    let registry = ObserverRegistry::default();
    registry.register("ack", |_| Ok(None)).unwrap();

    let reply = dispatch_frame(&registry, r#"{"id":"m4","type":"ack"}"#).unwrap();
    assert_eq!(reply, json!({"type": "success", "response_to": "m4"}));
}

#[test]
fn handler_failures_become_error_replies() {
    let registry = ObserverRegistry::default();
    registry
        .register("boom", |_| Err(anyhow::anyhow!("handler exploded")))
        .unwrap();

    let reply = dispatch_frame(&registry, r#"{"id":"m5","type":"boom"}"#).unwrap();
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["response_to"], "m5");
    assert!(reply["data"].as_str().unwrap().contains("handler exploded"));
}

#[test]
fn handlers_see_the_frame_payload() {
    let registry = ObserverRegistry::default();
    registry
        .register("inspect", |frame| {
            let job_id = frame.field("job_id").cloned().unwrap_or_default();
            Ok(Some(json!({"seen": job_id})))
        })
        .unwrap();

    let reply =
        dispatch_frame(&registry, r#"{"id":"m6","type":"inspect","job_id":"j9"}"#).unwrap();
    assert_eq!(reply, json!({"seen": "j9", "response_to": "m6"}));
}

#[test]
fn every_well_identified_frame_gets_exactly_one_reply() {
    let registry = ObserverRegistry::default();
    registry.register("ok", |_| Ok(None)).unwrap();
    registry.register("err", |_| Err(anyhow::anyhow!("no"))).unwrap();

    for text in [
        r#"{"id":"a","type":"ok"}"#,
        r#"{"id":"b","type":"err"}"#,
        r#"{"id":"c","type":"unknown"}"#,
        r#"{"id":"d"}"#,
    ] {
        let reply = dispatch_frame(&registry, text).unwrap();
        let id = serde_json::from_str::<Value>(text).unwrap()["id"].clone();
        assert_eq!(reply["response_to"], id, "{text}");
    }
}

#[test]
fn non_object_handler_results_are_wrapped() {
    let registry = ObserverRegistry::default();
    registry
        .register("scalar", |_| Ok(Some(json!(42))))
        .unwrap();

    let reply = dispatch_frame(&registry, r#"{"id":"m8","type":"scalar"}"#).unwrap();
    assert_eq!(reply, json!({"type": "success", "response_to": "m8", "data": 42}));
}
