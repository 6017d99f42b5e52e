//! Unauthenticated status routes served on the HTTP listener.
//!
//! These exist for external keep-warm pingers and the subscription
//! generator. Only `GET` is answered; CONNECT never reaches this module.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::credential::CredentialStore;
use crate::http::{response, RequestHead};

const JSON: &str = "application/json";
const TEXT: &str = "text/plain; charset=utf-8";

/// Advertised service tuple for subscription generators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceInfo {
    pub server_domain: String,
    pub external_port: u16,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerInfo {
    pub server: String,
    pub port: u16,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub access_count: u64,
}

/// Body of `GET /status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub status: &'static str,
    pub uptime: String,
    pub uptime_secs: i64,
    pub access_count: u64,
    pub last_accessed: DateTime<Utc>,
    pub server_info: ServerInfo,
}

/// Body of `GET /api/credentials`.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialsDocument {
    pub server: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub protocols: Vec<&'static str>,
}

/// Process-wide access counters behind the status routes.
#[derive(Debug)]
pub struct StatusTracker {
    server_domain: String,
    external_port: u16,
    created_at: DateTime<Utc>,
    access_count: AtomicU64,
    last_accessed: Mutex<DateTime<Utc>>,
}

impl StatusTracker {
    pub fn new(server_domain: impl Into<String>, external_port: u16) -> Self {
        let now = Utc::now();
        Self {
            server_domain: server_domain.into(),
            external_port,
            created_at: now,
            access_count: AtomicU64::new(0),
            last_accessed: Mutex::new(now),
        }
    }

    /// Count one access and stamp the time.
    pub fn record_access(&self) {
        self.access_count.fetch_add(1, Ordering::Relaxed);
        *self.last_accessed.lock() = Utc::now();
    }

    pub fn access_count(&self) -> u64 {
        self.access_count.load(Ordering::Relaxed)
    }

    pub fn report(&self) -> StatusReport {
        let now = Utc::now();
        let access_count = self.access_count();
        let last_accessed = *self.last_accessed.lock();
        let uptime = now.signed_duration_since(self.created_at);

        StatusReport {
            status: "running",
            uptime: format_uptime(uptime.num_seconds()),
            uptime_secs: uptime.num_seconds(),
            access_count,
            last_accessed,
            server_info: ServerInfo {
                server: self.server_domain.clone(),
                port: self.external_port,
                created_at: self.created_at,
                last_accessed,
                access_count,
            },
        }
    }

    pub fn service_info(&self, credentials: &CredentialStore) -> ServiceInfo {
        let credential = credentials.get();
        ServiceInfo {
            server_domain: self.server_domain.clone(),
            external_port: self.external_port,
            username: credential.username.clone(),
            password: credential.password.clone(),
        }
    }

    fn credentials_document(&self, credentials: &CredentialStore) -> CredentialsDocument {
        let info = self.service_info(credentials);
        CredentialsDocument {
            server: info.server_domain,
            port: info.external_port,
            username: info.username,
            password: info.password,
            protocols: vec!["HTTP", "SOCKS5"],
        }
    }

    fn banner(&self) -> String {
        format!(
            "gated-tunnel {}\nserver: {}:{}\nprotocols: HTTP CONNECT, SOCKS5\naccess count: {}\n",
            env!("CARGO_PKG_VERSION"),
            self.server_domain,
            self.external_port,
            self.access_count()
        )
    }

    /// Answer a non-CONNECT request with a complete HTTP response.
    pub fn respond(
        &self,
        head: &RequestHead,
        credentials: &CredentialStore,
        expose_credentials: bool,
    ) -> Vec<u8> {
        if !head.method.eq_ignore_ascii_case("GET") {
            return response(
                405,
                "Method Not Allowed",
                TEXT,
                &[("Allow", "GET, CONNECT")],
                "Method not allowed",
            );
        }

        match head.path() {
            "/" => {
                self.record_access();
                response(200, "OK", TEXT, &[], &self.banner())
            }
            "/status" => json_response(&self.report()),
            "/api/credentials" if expose_credentials => {
                self.record_access();
                json_response(&self.credentials_document(credentials))
            }
            _ => not_found(),
        }
    }
}

fn json_response<T: Serialize>(body: &T) -> Vec<u8> {
    match serde_json::to_string(body) {
        Ok(json) => response(200, "OK", JSON, &[], &json),
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize status document");
            response(500, "Internal Server Error", TEXT, &[], "Internal error")
        }
    }
}

fn not_found() -> Vec<u8> {
    response(404, "Not Found", TEXT, &[], "Not found")
}

fn format_uptime(total_secs: i64) -> String {
    let total = total_secs.max(0);
    let days = total / 86_400;
    let hours = (total % 86_400) / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    if days > 0 {
        format!("{}d {:02}:{:02}:{:02}", days, hours, minutes, seconds)
    } else {
        format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::Credential;

    fn get(path: &str) -> RequestHead {
        RequestHead {
            method: "GET".into(),
            target: path.into(),
            version: "HTTP/1.1".into(),
            headers: vec![],
        }
    }

    fn body_of(raw: &[u8]) -> (String, String) {
        let text = String::from_utf8(raw.to_vec()).unwrap();
        let (head, body) = text.split_once("\r\n\r\n").unwrap();
        (head.to_string(), body.to_string())
    }

    fn store() -> CredentialStore {
        CredentialStore::new(Credential::fixed("user", "pass"))
    }

    #[test]
    fn test_banner_counts_access() {
        let tracker = StatusTracker::new("proxy.example.com", 443);
        let (head, body) = body_of(&tracker.respond(&get("/"), &store(), false));
        assert!(head.starts_with("HTTP/1.1 200 OK"));
        assert!(body.contains("proxy.example.com:443"));
        assert_eq!(tracker.access_count(), 1);
    }

    #[test]
    fn test_status_json() {
        let tracker = StatusTracker::new("proxy.example.com", 443);
        tracker.record_access();
        let (head, body) = body_of(&tracker.respond(&get("/status?x=1"), &store(), false));
        assert!(head.contains("Content-Type: application/json"));

        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["status"], "running");
        assert_eq!(json["access_count"], 1);
        assert_eq!(json["server_info"]["server"], "proxy.example.com");
        assert_eq!(json["server_info"]["port"], 443);
        assert!(json["uptime"].is_string());
        // Status polls do not count as accesses.
        assert_eq!(tracker.access_count(), 1);
    }

    #[test]
    fn test_credentials_route_gated() {
        let tracker = StatusTracker::new("proxy.example.com", 443);
        let (head, _) = body_of(&tracker.respond(&get("/api/credentials"), &store(), false));
        assert!(head.starts_with("HTTP/1.1 404"));

        let (head, body) = body_of(&tracker.respond(&get("/api/credentials"), &store(), true));
        assert!(head.starts_with("HTTP/1.1 200"));
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["username"], "user");
        assert_eq!(json["password"], "pass");
        assert_eq!(json["protocols"][1], "SOCKS5");
    }

    #[test]
    fn test_unknown_path_and_method() {
        let tracker = StatusTracker::new("localhost", 8080);
        let (head, _) = body_of(&tracker.respond(&get("/nope"), &store(), true));
        assert!(head.starts_with("HTTP/1.1 404"));

        let mut post = get("/status");
        post.method = "POST".into();
        let (head, _) = body_of(&tracker.respond(&post, &store(), true));
        assert!(head.starts_with("HTTP/1.1 405"));
        assert!(head.contains("Allow: GET, CONNECT"));
    }

    #[test]
    fn test_service_info() {
        let tracker = StatusTracker::new("proxy.example.com", 443);
        let info = tracker.service_info(&store());
        assert_eq!(
            info,
            ServiceInfo {
                server_domain: "proxy.example.com".into(),
                external_port: 443,
                username: "user".into(),
                password: "pass".into(),
            }
        );
    }

    #[test]
    fn test_format_uptime() {
        assert_eq!(format_uptime(0), "00:00:00");
        assert_eq!(format_uptime(3_661), "01:01:01");
        assert_eq!(format_uptime(90_061), "1d 01:01:01");
        assert_eq!(format_uptime(-5), "00:00:00");
    }
}
