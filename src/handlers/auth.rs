//! `auth/handshake` and `auth/authenticate` (SPEC_FULL.md §4.4).

use crate::connection::ConnectionState;
use crate::context::EngineContext;
use crate::error::RtmError;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde_json::{json, Value};
use sha2::Sha256;
use std::sync::atomic::Ordering;
use subtle::ConstantTimeEq;

fn expected_mac(secret: &str, nonce: &[u8]) -> Vec<u8> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC accepts a key of any length");
    mac.update(nonce);
    mac.finalize().into_bytes().to_vec()
}

pub async fn handshake(body: &Value, conn: &ConnectionState, ctx: &EngineContext) -> Result<Value, RtmError> {
    let role = body
        .get("data")
        .and_then(|d| d.get("role"))
        .and_then(Value::as_str)
        .ok_or_else(|| RtmError::BadRequest("data.role".to_string()))?;

    if ctx.apps_config.role(&conn.appkey, role).is_none() {
        return Err(RtmError::AuthFailed);
    }

    let mut nonce = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    *conn.role.lock().await = Some(role.to_string());
    *conn.nonce.lock().await = Some(nonce.to_vec());

    let encoded = base64::engine::general_purpose::STANDARD.encode(nonce);
    Ok(json!({ "data": { "nonce": encoded } }))
}

pub async fn authenticate(body: &Value, conn: &ConnectionState, ctx: &EngineContext) -> Result<Value, RtmError> {
    let hash_hex = body
        .get("credentials")
        .and_then(|c| c.get("hash"))
        .and_then(Value::as_str)
        .ok_or_else(|| RtmError::BadRequest("credentials.hash".to_string()))?;

    // Cleared unconditionally below via `take()`, which is what makes a
    // second authenticate without a prior handshake fail: there is no nonce
    // left for it to compare against.
    let nonce = conn.nonce.lock().await.take().ok_or(RtmError::AuthFailed)?;
    let role_name = conn.role.lock().await.clone().ok_or(RtmError::AuthFailed)?;
    let role_cfg = ctx.apps_config.role(&conn.appkey, &role_name).ok_or(RtmError::AuthFailed)?;

    let given = hex::decode(hash_hex).map_err(|_| RtmError::AuthFailed)?;
    let expected = expected_mac(&role_cfg.secret, &nonce);

    if given.len() != expected.len() || !bool::from(given.ct_eq(&expected)) {
        return Err(RtmError::AuthFailed);
    }

    conn.authenticated.store(true, Ordering::Release);
    *conn.permissions.lock().await = role_cfg.permissions.clone();
    Ok(json!({}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apps_config::AppsConfig;
    use crate::backend::fake::FakeBackend;
    use crate::config::RtmConfig;
    use crate::connection::ConnectionState;
    use std::io::Write;
    use std::sync::Arc;

    fn ctx_with_role(appkey: &str, role: &str, secret: &str, permissions: &str) -> EngineContext {
        let json = format!(r#"{{"{appkey}": {{"roles": {{"{role}": {{"secret": "{secret}", "permissions": [{permissions}]}}}}}}}}"#);
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(json.as_bytes()).unwrap();
        let apps_config = Arc::new(AppsConfig::load(f.path()).unwrap());
        let backend: Arc<dyn crate::backend::Backend> = Arc::new(FakeBackend::new());
        let config = Arc::new(RtmConfig {
            host: "0.0.0.0".into(),
            port: 0,
            apps_config_path: "/dev/null".into(),
            backend_url: "redis://127.0.0.1".into(),
            backend_password: None,
            cluster: false,
            max_subscriptions: 10,
            idle_timeout: std::time::Duration::from_secs(1),
            handshake_timeout: std::time::Duration::from_secs(1),
            stream_max_len: 10,
            worker_reconnect_initial_delay: std::time::Duration::from_millis(1),
            log: "info".into(),
        });
        EngineContext::new(apps_config, backend, config)
    }

    #[tokio::test]
    async fn handshake_then_authenticate_round_trip() {
        let ctx = ctx_with_role("K", "pub", "s3cr3t", "\"publish\"");
        let (conn, _rx) = ConnectionState::new("K".to_string(), None, 10);

        let resp = handshake(&json!({"method": "role_secret", "data": {"role": "pub"}}), &conn, &ctx)
            .await
            .unwrap();
        let nonce_b64 = resp["data"]["nonce"].as_str().unwrap();
        let nonce = base64::engine::general_purpose::STANDARD.decode(nonce_b64).unwrap();
        let mac = expected_mac("s3cr3t", &nonce);

        let body = json!({"method": "role_secret", "credentials": {"hash": hex::encode(mac)}});
        authenticate(&body, &conn, &ctx).await.unwrap();
        assert!(conn.is_authenticated());
    }

    #[tokio::test]
    async fn authenticate_without_handshake_fails() {
        let ctx = ctx_with_role("K", "pub", "s3cr3t", "\"publish\"");
        let (conn, _rx) = ConnectionState::new("K".to_string(), None, 10);
        let body = json!({"credentials": {"hash": "00"}});
        assert!(authenticate(&body, &conn, &ctx).await.is_err());
        assert!(!conn.is_authenticated());
    }

    #[tokio::test]
    async fn second_authenticate_after_success_fails() {
        let ctx = ctx_with_role("K", "pub", "s3cr3t", "\"publish\"");
        let (conn, _rx) = ConnectionState::new("K".to_string(), None, 10);
        let resp = handshake(&json!({"data": {"role": "pub"}}), &conn, &ctx).await.unwrap();
        let nonce_b64 = resp["data"]["nonce"].as_str().unwrap();
        let nonce = base64::engine::general_purpose::STANDARD.decode(nonce_b64).unwrap();
        let mac = expected_mac("s3cr3t", &nonce);
        let body = json!({"credentials": {"hash": hex::encode(mac)}});
        authenticate(&body, &conn, &ctx).await.unwrap();

        // Nonce was consumed; a second attempt with the same MAC now fails.
        assert!(authenticate(&body, &conn, &ctx).await.is_err());
    }

    #[tokio::test]
    async fn wrong_mac_fails_and_keeps_unauthenticated() {
        let ctx = ctx_with_role("K", "pub", "s3cr3t", "\"publish\"");
        let (conn, _rx) = ConnectionState::new("K".to_string(), None, 10);
        handshake(&json!({"data": {"role": "pub"}}), &conn, &ctx).await.unwrap();
        let body = json!({"credentials": {"hash": hex::encode([0u8; 32])}});
        assert!(authenticate(&body, &conn, &ctx).await.is_err());
        assert!(!conn.is_authenticated());
    }

    #[tokio::test]
    async fn handshake_with_unknown_role_fails() {
        let ctx = ctx_with_role("K", "pub", "s3cr3t", "\"publish\"");
        let (conn, _rx) = ConnectionState::new("K".to_string(), None, 10);
        assert!(handshake(&json!({"data": {"role": "no-such-role"}}), &conn, &ctx).await.is_err());
    }
}
