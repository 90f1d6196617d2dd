//! Gateway login (§4.I): a single shared username/password protects the
//! whole tunnel-backed surface. Sessions are plain HMAC-signed cookies
//! rather than axum-extra's `SignedCookieJar` so the signing key can be a
//! fresh random value minted once per process (restarting the gateway logs
//! everyone out) instead of something that has to be configured and kept
//! secret across restarts.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::Deserialize;
use sha2::Sha256;

use super::server::GatewayState;

const COOKIE_NAME: &str = "sp_session";
const CSRF_COOKIE_NAME: &str = "sp_csrf";
const SESSION_TTL_SECS: u64 = 7 * 24 * 60 * 60;

/// Paths reachable without a session cookie: the login flow itself, the
/// unauthenticated health probes (both the gateway's own and the
/// superposition server's, proxied through), and the tunnel's own upgrade
/// endpoint (which authenticates via the separate pre-shared tunnel
/// secret, §4.H).
fn is_exempt(path: &str) -> bool {
    path == "/auth/login"
        || path == "/auth/logout"
        || path == "/gateway/health"
        || path == "/api/health"
        || path == "/tunnel"
}

fn generate_csrf_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs()
}

fn sign(key: &[u8; 32], username: &str, expiry: u64) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(username.as_bytes());
    mac.update(b"|");
    mac.update(expiry.to_string().as_bytes());
    let sig = mac.finalize().into_bytes();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(sig)
}

fn make_cookie_value(key: &[u8; 32], username: &str) -> String {
    let expiry = now_unix() + SESSION_TTL_SECS;
    let sig = sign(key, username, expiry);
    format!("{username}|{expiry}|{sig}")
}

/// Verifies a cookie value produced by [`make_cookie_value`], returning the
/// username on success. Rejects tampered or expired cookies; uses
/// `Mac::verify_slice` so the signature comparison is constant-time.
fn verify_cookie_value(key: &[u8; 32], value: &str) -> Option<String> {
    let mut parts = value.splitn(3, '|');
    let username = parts.next()?;
    let expiry: u64 = parts.next()?.parse().ok()?;
    let sig_b64 = parts.next()?;
    if now_unix() >= expiry {
        return None;
    }
    let given_sig = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(sig_b64)
        .ok()?;
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(username.as_bytes());
    mac.update(b"|");
    mac.update(expiry.to_string().as_bytes());
    mac.verify_slice(&given_sig).ok()?;
    Some(username.to_string())
}

pub async fn require_auth(
    State(state): State<Arc<GatewayState>>,
    jar: CookieJar,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let path = request.uri().path();
    if is_exempt(path) {
        return next.run(request).await;
    }

    let authed = jar
        .get(COOKIE_NAME)
        .and_then(|c| verify_cookie_value(&state.session_key, c.value()));

    match authed {
        Some(_username) => next.run(request).await,
        None => Redirect::to("/auth/login").into_response(),
    }
}

fn csrf_cookie(value: String) -> Cookie<'static> {
    Cookie::build((CSRF_COOKIE_NAME, value))
        .path("/auth/")
        .http_only(true)
        .same_site(SameSite::Strict)
        .secure(true)
        .build()
}

fn render_login_page(csrf_token: &str) -> String {
    format!(
        r#"<!doctype html>
<html lang="en">
<head><meta charset="utf-8" /><title>superposition gateway</title></head>
<body>
<form method="post" action="/auth/login">
  <input type="hidden" name="csrf_token" value="{csrf_token}" />
  <label>Username <input type="text" name="username" autocomplete="username" /></label>
  <label>Password <input type="password" name="password" autocomplete="current-password" /></label>
  <button type="submit">Log in</button>
</form>
</body>
</html>"#
    )
}

pub async fn login_page(jar: CookieJar) -> impl IntoResponse {
    let token = generate_csrf_token();
    let page = render_login_page(&token);
    (jar.add(csrf_cookie(token)), Html(page))
}

#[derive(Deserialize)]
pub struct LoginForm {
    username: String,
    password: String,
    csrf_token: String,
}

pub async fn login_submit(
    State(state): State<Arc<GatewayState>>,
    jar: CookieJar,
    axum::Form(form): axum::Form<LoginForm>,
) -> Response {
    let csrf_valid = jar
        .get(CSRF_COOKIE_NAME)
        .map(|c| c.value() == form.csrf_token)
        .unwrap_or(false);
    if !csrf_valid {
        return (StatusCode::FORBIDDEN, "csrf token mismatch").into_response();
    }

    if form.username != state.username || form.password != state.password {
        let token = generate_csrf_token();
        let page = render_login_page(&token);
        return (
            jar.add(csrf_cookie(token)),
            StatusCode::UNAUTHORIZED,
            Html(page),
        )
            .into_response();
    }

    let value = make_cookie_value(&state.session_key, &form.username);
    let cookie = Cookie::build((COOKIE_NAME, value))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .secure(true)
        .build();
    let expired_csrf = Cookie::build((CSRF_COOKIE_NAME, "")).path("/auth/").build();
    (jar.add(cookie).remove(expired_csrf), Redirect::to("/")).into_response()
}

pub async fn logout(jar: CookieJar) -> impl IntoResponse {
    (jar.remove(Cookie::from(COOKIE_NAME)), Redirect::to("/auth/login"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_valid_cookie() {
        let key = [7u8; 32];
        let value = make_cookie_value(&key, "alice");
        assert_eq!(verify_cookie_value(&key, &value), Some("alice".to_string()));
    }

    #[test]
    fn rejects_tampered_signature() {
        let key = [7u8; 32];
        let value = make_cookie_value(&key, "alice");
        let mut tampered = value.clone();
        tampered.push('x');
        assert_eq!(verify_cookie_value(&key, &tampered), None);
    }

    #[test]
    fn rejects_wrong_key() {
        let value = make_cookie_value(&[1u8; 32], "alice");
        assert_eq!(verify_cookie_value(&[2u8; 32], &value), None);
    }

    #[test]
    fn rejects_expired_cookie() {
        let key = [7u8; 32];
        let expiry = now_unix() - 1;
        let sig = sign(&key, "alice", expiry);
        let value = format!("alice|{expiry}|{sig}");
        assert_eq!(verify_cookie_value(&key, &value), None);
    }

    #[test]
    fn exempt_paths_match_router_table() {
        assert!(is_exempt("/auth/login"));
        assert!(is_exempt("/tunnel"));
        assert!(is_exempt("/gateway/health"));
        assert!(is_exempt("/api/health"));
        assert!(!is_exempt("/"));
        assert!(!is_exempt("/anything"));
    }

    #[test]
    fn csrf_cookie_value_round_trips_into_the_page() {
        let token = generate_csrf_token();
        let page = render_login_page(&token);
        assert!(page.contains(&format!(r#"value="{token}""#)));
    }
}
