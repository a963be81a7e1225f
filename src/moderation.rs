//! Peer-name moderation: a pluggable classifier, with a local regex-based
//! sanitizer as the zero-dependency default and an optional HTTP-backed
//! classifier for deployments that want a real moderation service in front
//! of user-chosen names. A moderator failure degrades to the local
//! sanitizer rather than rejecting the attempt outright.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

fn disallowed_chars() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[^\w\s\-_.!/]").expect("valid regex"))
}

const LOCAL_MAX_LEN: usize = 20;
const EXTERNAL_MAX_LEN: usize = 30;

/// Outcome of a naming attempt, carrying the sanitized name on success or a
/// short machine-stable reason code on rejection. The session layer maps
/// known reason codes to a friendlier message for the client.
#[derive(Debug, Clone, PartialEq)]
pub enum NameVerdict {
    Allowed(String),
    Rejected(String),
}

/// A pluggable peer-name classifier. Using a native `async fn` in the trait
/// keeps this free of an `async_trait` dependency; since that makes the
/// trait non-object-safe, callers dispatch through the [`Classifier`] enum
/// below rather than a trait object.
pub trait NameClassifier: Send + Sync {
    fn classify(&self, name: &str) -> impl std::future::Future<Output = NameVerdict> + Send;
}

/// Trims, rejects empty names, strips anything outside the permitted
/// character set, and truncates. No external dependency: the sensible
/// default when no moderation endpoint is configured.
pub struct LocalClassifier;

impl NameClassifier for LocalClassifier {
    async fn classify(&self, name: &str) -> NameVerdict {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return NameVerdict::Rejected("empty".to_owned());
        }
        let sanitized: String = disallowed_chars().replace_all(trimmed, "").to_string();
        let sanitized = sanitized.trim();
        if sanitized.is_empty() {
            return NameVerdict::Rejected("offensive".to_owned());
        }
        let truncated: String = sanitized.chars().take(LOCAL_MAX_LEN).collect();
        NameVerdict::Allowed(truncated)
    }
}

#[derive(Debug, Serialize)]
struct ClassifyRequest<'a> {
    name: &'a str,
}

#[derive(Debug, Deserialize)]
struct ClassifyResponse {
    allowed: bool,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    sanitized: Option<String>,
}

/// Delegates the allow/reject decision to an HTTP moderation service. Falls
/// back to rejecting on any transport or protocol error: a moderator that
/// can't be reached is treated the same as "no", never as "yes".
pub struct HttpClassifier {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpClassifier {
    pub fn new(endpoint: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }
}

impl NameClassifier for HttpClassifier {
    async fn classify(&self, name: &str) -> NameVerdict {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return NameVerdict::Rejected("empty".to_owned());
        }
        let response = self
            .client
            .post(&self.endpoint)
            .json(&ClassifyRequest { name: trimmed })
            .send()
            .await;
        let Ok(response) = response else {
            warn!("moderator unreachable, falling back to local sanitizer");
            return LocalClassifier.classify(trimmed).await;
        };
        let Ok(body) = response.json::<ClassifyResponse>().await else {
            warn!("moderator returned an unparseable response, falling back to local sanitizer");
            return LocalClassifier.classify(trimmed).await;
        };
        if !body.allowed {
            return NameVerdict::Rejected(body.reason.unwrap_or_else(|| "rejected".to_owned()));
        }
        let sanitized = body.sanitized.unwrap_or_else(|| trimmed.to_owned());
        let truncated: String = sanitized.chars().take(EXTERNAL_MAX_LEN).collect();
        NameVerdict::Allowed(truncated)
    }
}

/// Dispatches to whichever classifier the deployment configured. An enum
/// rather than `Arc<dyn NameClassifier>`: native `async fn` in traits isn't
/// object-safe, and boxing every future just to get dynamic dispatch over a
/// two-member set buys nothing here.
pub enum Classifier {
    Local(LocalClassifier),
    Http(HttpClassifier),
}

impl Classifier {
    pub async fn classify(&self, name: &str) -> NameVerdict {
        match self {
            Classifier::Local(c) => c.classify(name).await,
            Classifier::Http(c) => c.classify(name).await,
        }
    }
}

/// Maps a rejection reason code to the stable client-facing message.
/// `spec.md` §4.6 names `political`, `offensive`, and `religious` as the
/// three known moderation categories; anything else falls back to a
/// generic message rather than leaking classifier internals.
pub fn rejection_message(reason: &str) -> &'static str {
    match reason {
        "political" => "name rejected: political content",
        "offensive" => "name rejected: offensive content",
        "religious" => "name rejected: religious content",
        _ => "name rejected",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_classifier_rejects_empty_and_whitespace() {
        assert_eq!(
            LocalClassifier.classify("   ").await,
            NameVerdict::Rejected("empty".to_owned())
        );
    }

    #[tokio::test]
    async fn local_classifier_strips_disallowed_characters() {
        match LocalClassifier.classify("gard<ener>!!").await {
            NameVerdict::Allowed(name) => assert_eq!(name, "gardener!!"),
            NameVerdict::Rejected(_) => panic!("expected allowed"),
        }
    }

    #[tokio::test]
    async fn local_classifier_truncates_long_names() {
        let long_name = "x".repeat(50);
        match LocalClassifier.classify(&long_name).await {
            NameVerdict::Allowed(name) => assert_eq!(name.len(), LOCAL_MAX_LEN),
            NameVerdict::Rejected(_) => panic!("expected allowed"),
        }
    }

    #[test]
    fn rejection_message_maps_known_categories() {
        assert!(rejection_message("political").contains("political"));
        assert_eq!(rejection_message("unknown_code"), "name rejected");
    }

    #[tokio::test]
    async fn http_classifier_falls_back_to_local_sanitizer_when_unreachable() {
        let classifier = HttpClassifier::new("http://127.0.0.1:1/unreachable".to_owned());
        match classifier.classify("gard<ener>!!").await {
            NameVerdict::Allowed(name) => assert_eq!(name, "gardener!!"),
            NameVerdict::Rejected(reason) => panic!("expected local fallback, got rejected: {reason}"),
        }
    }
}
