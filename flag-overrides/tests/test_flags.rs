use anyhow::Result;
use assert_json_diff::{assert_json_eq, assert_json_include};

use reqwest::StatusCode;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::common::*;
mod common;

#[tokio::test]
async fn it_resolves_defaults_and_overrides() -> Result<()> {
    let server = ServerHandle::for_config(DEFAULT_TEST_CONFIG.clone()).await;
    let actor = Uuid::now_v7();
    let org = Uuid::now_v7();
    let overridden_user = Uuid::now_v7();
    let other_user = Uuid::now_v7();

    let flag = server.create_flag(actor, "beta", org_owner(org)).await;
    let flag_id = flag["id"].as_str().unwrap().to_string();

    let res = server
        .put_as(
            actor,
            &format!("/flags/{flag_id}/overrides/{overridden_user}"),
            json!({"value": "true"}),
        )
        .await;
    assert_eq!(res.status(), StatusCode::OK);
    let body = res.json::<Value>().await?;
    assert_json_include!(
        actual: body,
        expected: json!({
            "data": {"flagId": flag_id, "userId": overridden_user, "value": "true"},
            "warnings": [],
        })
    );

    let res = server
        .get(&format!(
            "/effective?user_id={overridden_user}&organization_id={org}"
        ))
        .await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_json_eq!(
        res.json::<Value>().await?,
        json!({
            "beta": {
                "key": "beta",
                "type": "boolean",
                "value": "true",
                "isOverridden": true,
                "description": "test flag",
            }
        })
    );

    let res = server
        .get(&format!("/effective?user_id={other_user}&organization_id={org}"))
        .await;
    assert_json_include!(
        actual: res.json::<Value>().await?,
        expected: json!({"beta": {"value": "false", "isOverridden": false}})
    );

    Ok(())
}

#[tokio::test]
async fn it_rejects_duplicate_keys_per_owner() -> Result<()> {
    let server = ServerHandle::for_config(DEFAULT_TEST_CONFIG.clone()).await;
    let actor = Uuid::now_v7();
    let org = Uuid::now_v7();

    server.create_flag(actor, "beta", org_owner(org)).await;
    // Same key under a different owner is fine
    server.create_flag(actor, "beta", personal_owner(actor)).await;

    let res = server
        .post_as(
            actor,
            "/flags",
            json!({
                "key": "beta",
                "type": "string",
                "defaultValue": "on",
                "owner": org_owner(org),
            }),
        )
        .await;
    assert_eq!(res.status(), StatusCode::CONFLICT);
    assert_json_include!(
        actual: res.json::<Value>().await?,
        expected: json!({"type": "invalid_request", "code": "conflict"})
    );

    let res = server.get(&format!("/flags?organization_id={org}")).await;
    assert_eq!(res.json::<Vec<Value>>().await?.len(), 1);

    Ok(())
}

#[tokio::test]
async fn it_validates_flag_definitions() -> Result<()> {
    let server = ServerHandle::for_config(DEFAULT_TEST_CONFIG.clone()).await;
    let actor = Uuid::now_v7();

    for body in [
        json!({"key": "", "type": "boolean", "defaultValue": "false", "owner": personal_owner(actor)}),
        json!({"key": "beta", "type": "boolean", "defaultValue": "", "owner": personal_owner(actor)}),
        json!({"key": "beta", "type": "percentage", "defaultValue": "5", "owner": personal_owner(actor)}),
    ] {
        let res = server.post_as(actor, "/flags", body).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_json_include!(
            actual: res.json::<Value>().await?,
            expected: json!({"code": "validation_failed"})
        );
    }

    Ok(())
}

#[tokio::test]
async fn it_requires_an_actor_for_mutations() -> Result<()> {
    let server = ServerHandle::for_config(DEFAULT_TEST_CONFIG.clone()).await;

    let res = reqwest::Client::new()
        .post(server.url("/flags"))
        .json(&json!({
            "key": "beta",
            "type": "boolean",
            "defaultValue": "false",
            "owner": personal_owner(Uuid::now_v7()),
        }))
        .send()
        .await?;
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    Ok(())
}

#[tokio::test]
async fn it_records_and_cascades_audit_history() -> Result<()> {
    let server = ServerHandle::for_config(DEFAULT_TEST_CONFIG.clone()).await;
    let actor = Uuid::now_v7();
    let user = Uuid::now_v7();

    let flag = server.create_flag(actor, "beta", personal_owner(actor)).await;
    let flag_id = flag["id"].as_str().unwrap().to_string();

    let res = server
        .put_as(
            actor,
            &format!("/flags/{flag_id}"),
            json!({"key": "beta", "type": "boolean", "defaultValue": "true"}),
        )
        .await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_json_include!(
        actual: res.json::<Value>().await?,
        expected: json!({"data": {"defaultValue": "true", "description": null}})
    );

    let res = server
        .post_as(
            actor,
            &format!("/flags/{flag_id}/overrides"),
            json!({"userId": user, "value": "false"}),
        )
        .await;
    assert_eq!(res.status(), StatusCode::CREATED);

    let res = server
        .post_as(
            actor,
            &format!("/flags/{flag_id}/overrides"),
            json!({"userId": user, "value": "true"}),
        )
        .await;
    assert_eq!(res.status(), StatusCode::CONFLICT);

    let res = server
        .delete_as(actor, &format!("/flags/{flag_id}/overrides/{user}"))
        .await;
    assert_eq!(res.status(), StatusCode::OK);

    let res = server.get(&format!("/flags/{flag_id}/audit")).await;
    let entries = res.json::<Vec<Value>>().await?;
    let types: Vec<_> = entries
        .iter()
        .map(|entry| entry["type"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(
        types,
        vec!["created", "updated", "override_set", "override_removed"]
    );
    assert_json_include!(
        actual: entries[0].clone(),
        expected: json!({"flagId": flag_id, "userId": actor})
    );

    let res = server.delete_as(actor, &format!("/flags/{flag_id}")).await;
    assert_eq!(res.status(), StatusCode::NO_CONTENT);

    let res = server.get(&format!("/flags/{flag_id}")).await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let res = server.get(&format!("/flags/{flag_id}/audit")).await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let res = server.delete_as(actor, &format!("/flags/{flag_id}")).await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    Ok(())
}

#[tokio::test]
async fn it_finds_flags_by_key() -> Result<()> {
    let server = ServerHandle::for_config(DEFAULT_TEST_CONFIG.clone()).await;
    let actor = Uuid::now_v7();

    let flag = server.create_flag(actor, "beta", personal_owner(actor)).await;
    server.create_flag(actor, "gamma", personal_owner(actor)).await;

    let res = server.get(&format!("/flags?user_id={actor}&key=beta")).await;
    assert_json_eq!(res.json::<Value>().await?, json!([flag]));

    let res = server.get(&format!("/flags?user_id={actor}&key=delta")).await;
    assert_json_eq!(res.json::<Value>().await?, json!([]));

    let res = server.get("/flags").await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    Ok(())
}
