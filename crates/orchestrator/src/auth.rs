use base64::{engine::general_purpose::URL_SAFE_NO_PAD as BASE64_URL, Engine};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::Config;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Static,
    Session,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Node,
    Operator,
    Admin,
}

impl Role {
    fn as_str(self) -> &'static str {
        match self {
            Role::Node => "node",
            Role::Operator => "operator",
            Role::Admin => "admin",
        }
    }

    fn parse(value: &str) -> Option<Role> {
        match value {
            "node" => Some(Role::Node),
            "operator" => Some(Role::Operator),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

/// Identity established by a successful upgrade-gate auth check. `subject`
/// is the node id for node-channel auth, or the operator id for subscriber
/// auth.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub kind: TokenKind,
    pub subject: String,
    pub roles: Vec<Role>,
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl AuthContext {
    pub fn has_role(&self, role: &Role) -> bool {
        self.roles.contains(role)
    }
}

/// Extracts a bearer token from the three permitted channels, in the order
/// the upgrade gate must try them (§4.1).
pub fn extract_token(
    authorization_header: Option<&str>,
    sec_websocket_protocol: Option<&str>,
    query: Option<&str>,
    allow_query_token: bool,
) -> Option<String> {
    if let Some(header) = authorization_header {
        if let Some(token) = header.strip_prefix("Bearer ") {
            return Some(token.to_string());
        }
    }

    if let Some(protocol) = sec_websocket_protocol {
        let trimmed = protocol.trim();
        if let Some(rest) = trimmed.strip_prefix("bearer, ") {
            return Some(rest.to_string());
        }
        if let Some(rest) = trimmed.strip_prefix("bearer.") {
            return Some(rest.to_string());
        }
    }

    if allow_query_token {
        if let Some(query) = query {
            for pair in query.split('&') {
                let mut parts = pair.splitn(2, '=');
                let key = parts.next().unwrap_or("");
                if key == "token" || key == "access_token" {
                    return parts.next().map(str::to_string);
                }
            }
        }
    }

    None
}

/// Validates a static bearer token with a constant-time, length-checked
/// compare so early mismatches don't leak timing information.
pub fn constant_time_token_match(candidate: &str, configured_tokens: &[String]) -> bool {
    configured_tokens.iter().any(|configured| constant_time_eq(candidate.as_bytes(), configured.as_bytes()))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Mints a session token for `subject` bound to the given role, the
/// configured issuer/audience, and a bounded lifetime. The role is part of
/// the signed payload, not an out-of-band claim, so a verifier can never
/// assign a role the issuer didn't grant.
pub fn mint_session_token(config: &Config, subject: &str, role: Role) -> anyhow::Result<String> {
    let secret = config
        .session_token_secrets
        .first()
        .ok_or_else(|| anyhow::anyhow!("no session token signing secret configured"))?;

    let expires_at = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() + config.session_token_ttl.as_secs();
    let payload =
        format!("{}|{}|{}|{}|{}", config.session_token_issuer, config.session_token_audience, subject, role.as_str(), expires_at);
    let signature = sign(secret.as_bytes(), payload.as_bytes())?;
    Ok(format!("{}.{}", BASE64_URL.encode(payload), BASE64_URL.encode(signature)))
}

/// Verifies a session token against every configured secret (supports
/// rotation), checking signature, issuer/audience, and expiry. The returned
/// `AuthContext`'s role comes from the signed payload itself.
pub fn verify_session_token(config: &Config, token: &str) -> Option<AuthContext> {
    let (payload_b64, signature_b64) = token.split_once('.')?;
    let payload_bytes = BASE64_URL.decode(payload_b64).ok()?;
    let signature = BASE64_URL.decode(signature_b64).ok()?;

    let verified = config
        .session_token_secrets
        .iter()
        .any(|secret| verify(secret.as_bytes(), &payload_bytes, &signature));
    if !verified {
        return None;
    }

    let payload = std::str::from_utf8(&payload_bytes).ok()?;
    let mut fields = payload.splitn(5, '|');
    let issuer = fields.next()?;
    let audience = fields.next()?;
    let subject = fields.next()?;
    let role = Role::parse(fields.next()?)?;
    let expires_at: u64 = fields.next()?.parse().ok()?;

    if issuer != config.session_token_issuer || audience != config.session_token_audience {
        return None;
    }

    let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_secs();
    if now >= expires_at {
        return None;
    }

    Some(AuthContext {
        kind: TokenKind::Session,
        subject: subject.to_string(),
        roles: vec![role],
        expires_at: chrono::DateTime::from_timestamp(expires_at as i64, 0),
    })
}

fn sign(secret: &[u8], payload: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(secret)?;
    mac.update(payload);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn verify(secret: &[u8], payload: &[u8], signature: &[u8]) -> bool {
    match HmacSha256::new_from_slice(secret) {
        Ok(mut mac) => {
            mac.update(payload);
            mac.verify_slice(signature).is_ok()
        }
        Err(_) => false,
    }
}

/// Upgrade-gate auth for the node channel: static token or session token,
/// both bound to a node subject. A session token must carry the node role.
pub fn authenticate_node_channel(config: &Config, token: &str) -> Option<AuthContext> {
    if constant_time_token_match(token, &config.node_auth_tokens) {
        return Some(AuthContext { kind: TokenKind::Static, subject: String::new(), roles: vec![Role::Node], expires_at: None });
    }
    let context = verify_session_token(config, token)?;
    context.has_role(&Role::Node).then_some(context)
}

/// Upgrade-gate auth for the subscriber channel: requires operator or
/// admin role (§4.4), taken from the token's own signed claims — never
/// assigned here. The static node tokens never satisfy this.
pub fn authenticate_subscriber_channel(config: &Config, token: &str) -> Option<AuthContext> {
    let context = verify_session_token(config, token)?;
    if !context.has_role(&Role::Operator) && !context.has_role(&Role::Admin) {
        return None;
    }
    Some(context)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> Config {
        Config {
            database_url: ":memory:".into(),
            database_auth_token: None,
            port: 3000,
            trust_proxy: false,
            cors_origins: crate::config::CorsOrigins::Any,
            command_timeout: std::time::Duration::from_secs(30),
            wake_verification_window: std::time::Duration::from_secs(120),
            wake_verification_poll_interval: std::time::Duration::from_secs(5),
            command_retention_days: 30,
            host_status_history_retention_days: 90,
            pruning_interval: std::time::Duration::from_secs(3600),
            schedule_worker_enabled: true,
            schedule_poll_interval: std::time::Duration::from_secs(60),
            schedule_batch_size: 50,
            ws_max_connections_per_ip: 8,
            ws_message_rate_limit_per_second: 100,
            ws_require_tls: false,
            ws_allow_query_token_auth: true,
            min_supported_protocol_version: 1,
            max_supported_protocol_version: 1,
            session_token_issuer: "cnc-core".into(),
            session_token_audience: "node-agent".into(),
            session_token_ttl: std::time::Duration::from_secs(3600),
            session_token_secrets: vec!["test-secret".into()],
            node_auth_tokens: vec!["static-token-abc".into()],
            port_scan_cache_ttl: std::time::Duration::from_secs(4 * 3600),
            webhook_max_attempts: 5,
            webhook_backoff_base: std::time::Duration::from_millis(500),
            mac_vendor_cache_ttl: std::time::Duration::from_secs(86400),
            mac_vendor_cache_capacity: 1000,
        }
    }

    #[test]
    fn extracts_authorization_header_first() {
        let token = extract_token(Some("Bearer abc123"), None, None, false);
        assert_eq!(token.as_deref(), Some("abc123"));
    }

    #[test]
    fn extracts_sec_websocket_protocol_forms() {
        assert_eq!(extract_token(None, Some("bearer, xyz"), None, false).as_deref(), Some("xyz"));
        assert_eq!(extract_token(None, Some("bearer.xyz"), None, false).as_deref(), Some("xyz"));
    }

    #[test]
    fn query_token_requires_opt_in() {
        assert_eq!(extract_token(None, None, Some("token=q1"), false), None);
        assert_eq!(extract_token(None, None, Some("access_token=q1"), true).as_deref(), Some("q1"));
    }

    #[test]
    fn static_token_matches_constant_time() {
        let config = sample_config();
        assert!(constant_time_token_match("static-token-abc", &config.node_auth_tokens));
        assert!(!constant_time_token_match("wrong", &config.node_auth_tokens));
    }

    #[test]
    fn session_token_round_trips_and_expires() {
        let config = sample_config();
        let token = mint_session_token(&config, "node-1", Role::Node).unwrap();
        let context = verify_session_token(&config, &token).unwrap();
        assert_eq!(context.subject, "node-1");
        assert!(context.has_role(&Role::Node));

        let mut expired_config = sample_config();
        expired_config.session_token_ttl = std::time::Duration::from_secs(0);
        let expired_token = mint_session_token(&expired_config, "node-1", Role::Node).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(1100));
        assert!(verify_session_token(&expired_config, &expired_token).is_none());
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let config = sample_config();
        let token = mint_session_token(&config, "node-1", Role::Node).unwrap();
        let mut tampered = token.clone();
        tampered.push('x');
        assert!(verify_session_token(&config, &tampered).is_none());
    }

    #[test]
    fn subscriber_channel_requires_operator_or_admin_role() {
        let config = sample_config();
        let operator_token = mint_session_token(&config, "alice", Role::Operator).unwrap();
        assert!(authenticate_subscriber_channel(&config, &operator_token).is_some());

        let admin_token = mint_session_token(&config, "root", Role::Admin).unwrap();
        assert!(authenticate_subscriber_channel(&config, &admin_token).is_some());
    }

    #[test]
    fn subscriber_channel_rejects_a_valid_node_token() {
        let config = sample_config();
        let node_token = mint_session_token(&config, "node-1", Role::Node).unwrap();
        assert!(authenticate_subscriber_channel(&config, &node_token).is_none());
    }

    #[test]
    fn node_channel_rejects_a_valid_operator_token() {
        let config = sample_config();
        let operator_token = mint_session_token(&config, "alice", Role::Operator).unwrap();
        assert!(authenticate_node_channel(&config, &operator_token).is_none());
    }
}
