use std::collections::HashMap;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use fixtures::{FixtureIdp, IdpSettings};
use serde_json::Value;
use sha2::{Digest, Sha256};

const REDIRECT_URI: &str = "http://localhost:3000/callback";
const VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}

fn challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// Run the authorize step and return the issued code
async fn authorize(idp: &FixtureIdp, verifier: &str) -> String {
    let challenge = challenge(verifier);
    let response = client()
        .get(format!("{}authorize", idp.issuer()))
        .query(&[
            ("response_type", "code"),
            ("client_id", "fixture-client"),
            ("redirect_uri", REDIRECT_URI),
            ("scope", "openid profile"),
            ("state", "xyz"),
            ("code_challenge", challenge.as_str()),
            ("code_challenge_method", "S256"),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::SEE_OTHER);

    let location = response.headers()["location"].to_str().unwrap().to_string();
    let (target, query) = location.split_once('?').unwrap();
    assert_eq!(target, REDIRECT_URI);
    let params: HashMap<String, String> = serde_urlencoded::from_str(query).unwrap();
    assert_eq!(params["state"], "xyz");
    params["code"].clone()
}

async fn redeem(idp: &FixtureIdp, code: &str, verifier: &str) -> reqwest::Response {
    client()
        .post(format!("{}oauth/token", idp.issuer()))
        .form(&[
            ("grant_type", "authorization_code"),
            ("client_id", "fixture-client"),
            ("client_secret", "fixture-secret"),
            ("code", code),
            ("code_verifier", verifier),
            ("redirect_uri", REDIRECT_URI),
        ])
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_discovery_document_points_at_own_endpoints() {
    let idp = FixtureIdp::start(IdpSettings::default()).await.unwrap();
    let doc: Value = client()
        .get(format!("{}.well-known/openid-configuration", idp.issuer()))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(doc["issuer"], idp.issuer());
    assert_eq!(
        doc["token_endpoint"],
        format!("http://{}/oauth/token", idp.addr())
    );
    assert_eq!(doc["code_challenge_methods_supported"][0], "S256");
}

#[tokio::test]
async fn test_jwks_publishes_signing_key() {
    let idp = FixtureIdp::start(IdpSettings::default()).await.unwrap();
    let jwks: Value = client()
        .get(format!("{}.well-known/jwks.json", idp.issuer()))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(jwks["keys"][0]["kid"], idp.state().signing_key().kid());
    assert_eq!(jwks["keys"][0]["alg"], "ES256");
}

#[tokio::test]
async fn test_authorize_rejects_plain_challenge() {
    let idp = FixtureIdp::start(IdpSettings::default()).await.unwrap();
    let response = client()
        .get(format!("{}authorize", idp.issuer()))
        .query(&[
            ("response_type", "code"),
            ("client_id", "fixture-client"),
            ("redirect_uri", REDIRECT_URI),
            ("code_challenge", VERIFIER),
            ("code_challenge_method", "plain"),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_code_exchange_returns_tokens() {
    let idp = FixtureIdp::start(IdpSettings::default()).await.unwrap();
    let code = authorize(&idp, VERIFIER).await;

    let response = redeem(&idp, &code, VERIFIER).await;
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    let tokens: Value = response.json().await.unwrap();
    assert_eq!(tokens["token_type"], "Bearer");
    assert_eq!(tokens["expires_in"], 3600);
    for field in ["access_token", "id_token", "refresh_token"] {
        assert!(tokens[field].is_string(), "missing {field}");
    }
}

#[tokio::test]
async fn test_code_is_single_use() {
    let idp = FixtureIdp::start(IdpSettings::default()).await.unwrap();
    let code = authorize(&idp, VERIFIER).await;

    assert!(redeem(&idp, &code, VERIFIER).await.status().is_success());
    let replay = redeem(&idp, &code, VERIFIER).await;
    assert_eq!(replay.status(), reqwest::StatusCode::FORBIDDEN);
    let body: Value = replay.json().await.unwrap();
    assert_eq!(body["error"], "invalid_grant");
}

#[tokio::test]
async fn test_wrong_verifier_is_rejected_and_burns_code() {
    let idp = FixtureIdp::start(IdpSettings::default()).await.unwrap();
    let code = authorize(&idp, VERIFIER).await;

    let wrong = redeem(&idp, &code, &"a".repeat(43)).await;
    assert_eq!(wrong.status(), reqwest::StatusCode::FORBIDDEN);

    let retry = redeem(&idp, &code, VERIFIER).await;
    assert_eq!(retry.status(), reqwest::StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_bad_client_secret_is_invalid_client() {
    let idp = FixtureIdp::start(IdpSettings::default()).await.unwrap();
    let code = authorize(&idp, VERIFIER).await;

    let response = client()
        .post(format!("{}oauth/token", idp.issuer()))
        .form(&[
            ("grant_type", "authorization_code"),
            ("client_id", "fixture-client"),
            ("client_secret", "guess"),
            ("code", code.as_str()),
            ("code_verifier", VERIFIER),
            ("redirect_uri", REDIRECT_URI),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_refresh_tokens_rotate() {
    let idp = FixtureIdp::start(IdpSettings::default()).await.unwrap();
    let code = authorize(&idp, VERIFIER).await;
    let tokens: Value = redeem(&idp, &code, VERIFIER).await.json().await.unwrap();
    let refresh_token = tokens["refresh_token"].as_str().unwrap().to_string();

    let refresh = |token: String| {
        let url = format!("{}oauth/token", idp.issuer());
        async move {
            client()
                .post(url)
                .form(&[
                    ("grant_type", "refresh_token"),
                    ("client_id", "fixture-client"),
                    ("client_secret", "fixture-secret"),
                    ("refresh_token", token.as_str()),
                ])
                .send()
                .await
                .unwrap()
        }
    };

    let first = refresh(refresh_token.clone()).await;
    assert_eq!(first.status(), reqwest::StatusCode::OK);
    let rotated: Value = first.json().await.unwrap();
    assert_ne!(rotated["refresh_token"], tokens["refresh_token"]);

    let reused = refresh(refresh_token).await;
    assert_eq!(reused.status(), reqwest::StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_logout_redirects_to_return_to() {
    let idp = FixtureIdp::start(IdpSettings::default()).await.unwrap();
    let response = client()
        .get(format!("{}v2/logout", idp.issuer()))
        .query(&[
            ("client_id", "fixture-client"),
            ("returnTo", "http://localhost:3000/"),
        ])
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::SEE_OTHER);
    assert_eq!(response.headers()["location"], "http://localhost:3000/");
}
