use anyhow::Result;
use reqwest::header::HeaderMap;

use test_helpers::spawn_app;

fn assert_no_store(headers: &HeaderMap) -> Result<()> {
    let cache_control = headers
        .get("cache-control")
        .expect("Cache-Control header should be present")
        .to_str()?;
    assert!(cache_control.contains("no-store"), "Should contain no-store");
    assert!(cache_control.contains("no-cache"), "Should contain no-cache");
    assert!(
        cache_control.contains("must-revalidate"),
        "Should contain must-revalidate"
    );
    assert!(cache_control.contains("private"), "Should contain private");

    let pragma = headers
        .get("pragma")
        .expect("Pragma header should be present")
        .to_str()?;
    assert_eq!(pragma, "no-cache");

    let expires = headers
        .get("expires")
        .expect("Expires header should be present")
        .to_str()?;
    assert_eq!(expires, "0");
    Ok(())
}

#[tokio::test]
async fn account_responses_are_not_cached() -> Result<()> {
    let app = spawn_app().await;
    let alice = app.create_alice_user().await?;

    let url = format!("{}/api/users/profile", app.client.address);
    let response = app
        .client
        .inner_client
        .get(&url)
        .bearer_auth(&alice.session.access_token)
        .send()
        .await?;
    assert!(response.status().is_success());
    assert_no_store(response.headers())?;

    // Error responses carry them too.
    let response = app.client.inner_client.get(&url).send().await?;
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
    assert_no_store(response.headers())?;

    Ok(())
}

#[tokio::test]
async fn ledger_responses_are_not_cached() -> Result<()> {
    let app = spawn_app().await;
    app.create_admin_user().await?;
    let alice = app.create_alice_user().await?;

    let url = format!("{}/api/transactions/process-withdrawal", app.client.address);
    let response = app
        .client
        .inner_client
        .post(&url)
        .bearer_auth(&alice.session.access_token)
        .json(&serde_json::json!({ "amount": "10" }))
        .send()
        .await?;
    assert!(response.status().is_success());
    assert_no_store(response.headers())?;

    let url = format!("{}/api/admin/pending-transactions", app.client.address);
    let response = app
        .client
        .inner_client
        .get(&url)
        .bearer_auth(&alice.session.access_token)
        .send()
        .await?;
    assert_eq!(response.status(), reqwest::StatusCode::FORBIDDEN);
    assert_no_store(response.headers())?;

    Ok(())
}
