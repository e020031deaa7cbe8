//! NIP-11 relay information documents.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use url::Url;

use crate::domain::Relay;

/// Parsed NIP-11 information document.
///
/// Parsing is permissive: every field is optional and `supported_nips`
/// accepts integers or float literals. Non-numeric NIP entries are a hard
/// parse error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelayInformation {
    pub name: Option<String>,
    pub description: Option<String>,
    pub pubkey: Option<String>,
    pub contact: Option<String>,
    #[serde(default, deserialize_with = "numbers_as_ints")]
    pub supported_nips: Vec<i32>,
    pub software: Option<String>,
    pub version: Option<String>,
    pub icon: Option<String>,
    pub banner: Option<String>,
    pub privacy_policy: Option<String>,
    pub terms_of_service: Option<String>,
    pub posting_policy: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub language_tags: Vec<String>,
    #[serde(default)]
    pub relay_countries: Vec<String>,
    pub limitation: Option<Limitation>,
}

/// Server limitations advertised in the information document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Limitation {
    pub payment_required: Option<bool>,
    pub auth_required: Option<bool>,
}

/// Coerce a JSON array of integers and float literals into integers.
fn numbers_as_ints<'de, D>(deserializer: D) -> Result<Vec<i32>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Vec<serde_json::Value> = Vec::deserialize(deserializer)?;
    raw.iter()
        .enumerate()
        .map(|(i, v)| {
            if let Some(n) = v.as_i64() {
                Ok(n as i32)
            } else if let Some(f) = v.as_f64() {
                Ok(f as i32)
            } else {
                Err(serde::de::Error::custom(format!(
                    "supported_nips element at index {i} is not numeric"
                )))
            }
        })
        .collect()
}

impl RelayInformation {
    /// Parse an information document from raw JSON text.
    pub fn parse(data: &str) -> Result<Self> {
        serde_json::from_str(data).context("parsing NIP-11 document")
    }

    /// Convert the document into a catalog relay record for `url`.
    ///
    /// Empty strings are treated as absent so they persist as NULL.
    pub fn into_relay(self, url: &str) -> Relay {
        Relay {
            url: url.to_string(),
            name: non_empty(self.name),
            description: non_empty(self.description),
            pubkey: non_empty(self.pubkey),
            contact: non_empty(self.contact),
            supported_nips: self.supported_nips,
            software: non_empty(self.software),
            version: non_empty(self.version),
            icon: non_empty(self.icon),
            banner: non_empty(self.banner),
            privacy_policy: non_empty(self.privacy_policy),
            terms_of_service: non_empty(self.terms_of_service),
            posting_policy: non_empty(self.posting_policy),
            tags: self.tags,
            language_tags: self.language_tags,
            relay_countries: self.relay_countries,
            created_at: None,
            updated_at: None,
        }
    }
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.filter(|v| !v.is_empty())
}

/// Translate a `ws(s)://` relay URL into its `http(s)://` counterpart.
pub fn http_url(relay_url: &str) -> Result<String> {
    let mut url = Url::parse(relay_url)?;
    let scheme = match url.scheme() {
        "ws" => "http",
        "wss" => "https",
        other => return Err(anyhow!("unsupported relay URL scheme: {other}")),
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow!("failed to set scheme on {relay_url}"))?;
    Ok(url.to_string())
}

/// Fetch and parse the information document served at `relay_url`.
pub async fn fetch(relay_url: &str, timeout: Duration) -> Result<RelayInformation> {
    let target = http_url(relay_url)?;
    let client = reqwest::Client::builder().timeout(timeout).build()?;
    let body = client
        .get(&target)
        .header(reqwest::header::ACCEPT, "application/nostr+json")
        .send()
        .await
        .with_context(|| format!("requesting NIP-11 document from {target}"))?
        .error_for_status()?
        .text()
        .await?;
    RelayInformation::parse(&body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::get, Router};

    #[test]
    fn parses_full_document() {
        let doc = r#"{
            "name": "Test Relay",
            "description": "A relay",
            "pubkey": "abcd",
            "contact": "ops@example.com",
            "supported_nips": [1, 11, 66],
            "software": "strfry",
            "version": "0.9.6",
            "tags": ["sfw-only"],
            "language_tags": ["en", "es"],
            "relay_countries": ["US"],
            "limitation": {"payment_required": true, "auth_required": false}
        }"#;
        let info = RelayInformation::parse(doc).unwrap();
        assert_eq!(info.name.as_deref(), Some("Test Relay"));
        assert_eq!(info.supported_nips, vec![1, 11, 66]);
        assert_eq!(info.tags, vec!["sfw-only"]);
        assert_eq!(info.language_tags, vec!["en", "es"]);
        let lim = info.limitation.unwrap();
        assert_eq!(lim.payment_required, Some(true));
        assert_eq!(lim.auth_required, Some(false));
    }

    #[test]
    fn mixed_numeric_nips_coerce_to_integers() {
        let doc = r#"{"supported_nips": [1, 2.0, 11]}"#;
        let info = RelayInformation::parse(doc).unwrap();
        assert_eq!(info.supported_nips, vec![1, 2, 11]);
    }

    #[test]
    fn non_numeric_nip_is_a_parse_error() {
        let doc = r#"{"supported_nips": [1, "eleven"]}"#;
        assert!(RelayInformation::parse(doc).is_err());
    }

    #[test]
    fn absent_fields_default() {
        let info = RelayInformation::parse("{}").unwrap();
        assert!(info.name.is_none());
        assert!(info.supported_nips.is_empty());
        assert!(info.tags.is_empty());
        assert!(info.limitation.is_none());
    }

    #[test]
    fn empty_strings_become_null_on_conversion() {
        let doc = r#"{"name": "X", "description": "", "contact": ""}"#;
        let relay = RelayInformation::parse(doc)
            .unwrap()
            .into_relay("wss://r.example/");
        assert_eq!(relay.url, "wss://r.example/");
        assert_eq!(relay.name.as_deref(), Some("X"));
        assert!(relay.description.is_none());
        assert!(relay.contact.is_none());
    }

    #[test]
    fn scheme_translation() {
        assert_eq!(http_url("ws://relay.example/").unwrap(), "http://relay.example/");
        assert_eq!(
            http_url("wss://relay.example:7443/path").unwrap(),
            "https://relay.example:7443/path"
        );
        assert!(http_url("ftp://relay.example/").is_err());
    }

    #[tokio::test]
    async fn fetch_sends_nostr_json_accept_header() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route(
            "/",
            get(|headers: axum::http::HeaderMap| async move {
                assert_eq!(
                    headers.get("accept").unwrap().to_str().unwrap(),
                    "application/nostr+json"
                );
                r#"{"name": "mock", "supported_nips": [1, 11]}"#
            }),
        );
        let handle = tokio::spawn(async move {
            axum::serve(listener, app.into_make_service()).await.unwrap();
        });
        let info = fetch(&format!("ws://{}/", addr), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(info.name.as_deref(), Some("mock"));
        assert_eq!(info.supported_nips, vec![1, 11]);
        handle.abort();
    }

    #[tokio::test]
    async fn fetch_error_status_is_an_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route(
            "/",
            get(|| async { (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
        );
        let handle = tokio::spawn(async move {
            axum::serve(listener, app.into_make_service()).await.unwrap();
        });
        let res = fetch(&format!("ws://{}/", addr), Duration::from_secs(5)).await;
        assert!(res.is_err());
        handle.abort();
    }

    #[tokio::test]
    async fn fetch_unreachable_host_errors() {
        let res = fetch("ws://127.0.0.1:1/", Duration::from_secs(1)).await;
        assert!(res.is_err());
    }
}
