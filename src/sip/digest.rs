/// SIP Digest Authentication (RFC 2617)
/// Computes MD5 digest credentials for 401 Unauthorized challenges.
///
/// Only algorithm=MD5 (or absent) is supported, and the response is always
/// the qop-less `MD5(HA1:nonce:HA2)` form; a challenge carrying qop still
/// gets that computation. Registrars in the wild parse the emitted
/// Authorization against its exact comma-packed byte layout.

use digest::Digest;
use md5::Md5;
use std::collections::HashMap;
use tracing::debug;

/// Parsed digest challenge from a WWW-Authenticate header
#[derive(Debug, Clone)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub qop: Option<String>,
    pub opaque: Option<String>,
    pub stale: bool,
}

impl DigestChallenge {
    /// Parse a digest challenge from an authenticate header value
    /// Example: Digest realm="asterisk", nonce="1234", algorithm=MD5
    pub fn parse(header_value: &str) -> Option<Self> {
        let params_str = header_value.strip_prefix("Digest ").unwrap_or(header_value);
        Self::from_params(&parse_params(params_str))
    }

    /// Build a challenge from an already-parsed authentication parameter
    /// map, as cached on a parsed 401 response.
    pub fn from_params(params: &HashMap<String, String>) -> Option<Self> {
        match params.get("algorithm") {
            Some(a) if !a.eq_ignore_ascii_case("MD5") => {
                debug!("Unsupported digest algorithm: {}", a);
                return None;
            }
            _ => {}
        }

        Some(DigestChallenge {
            realm: params.get("realm")?.clone(),
            nonce: params.get("nonce")?.clone(),
            qop: params.get("qop").cloned(),
            opaque: params.get("opaque").cloned(),
            stale: params
                .get("stale")
                .is_some_and(|s| s.eq_ignore_ascii_case("true")),
        })
    }
}

/// Digest credentials for an Authorization header
#[derive(Debug)]
pub struct DigestResponse {
    pub username: String,
    pub realm: String,
    pub nonce: String,
    pub uri: String,
    pub response: String,
    pub opaque: Option<String>,
}

impl DigestResponse {
    /// Compute the digest response for a challenge:
    /// MD5(MD5(user:realm:password) ":" nonce ":" MD5(method:uri))
    pub fn compute(
        challenge: &DigestChallenge,
        username: &str,
        password: &str,
        method: &str,
        uri: &str,
    ) -> Self {
        let ha1 = md5_hex(&format!("{}:{}:{}", username, challenge.realm, password));
        let ha2 = md5_hex(&format!("{}:{}", method, uri));
        let response = md5_hex(&format!("{}:{}:{}", ha1, challenge.nonce, ha2));

        DigestResponse {
            username: username.to_string(),
            realm: challenge.realm.clone(),
            nonce: challenge.nonce.clone(),
            uri: uri.to_string(),
            response,
            opaque: challenge.opaque.clone(),
        }
    }

    /// Format as an Authorization header value, comma-packed with no
    /// spaces after the separators.
    pub fn to_header(&self) -> String {
        let mut header = format!(
            "Digest username=\"{}\",realm=\"{}\",nonce=\"{}\",uri=\"{}\",response=\"{}\",algorithm=MD5",
            self.username, self.realm, self.nonce, self.uri, self.response
        );
        if let Some(ref opaque) = self.opaque {
            header.push_str(&format!(",opaque=\"{}\"", opaque));
        }
        header
    }
}

/// Compute MD5 and return lowercase hex
fn md5_hex(input: &str) -> String {
    Md5::digest(input.as_bytes())
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Parse `key=value` / `key="quoted value"` pairs from a challenge body.
/// Tolerant of spacing and unterminated quotes; first occurrence of a key
/// does not win, the last does, matching what permissive registrar stacks
/// emit.
fn parse_params(s: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut rest = s;

    while let Some(eq) = rest.find('=') {
        let key = rest[..eq]
            .trim_matches(|c: char| c.is_whitespace() || c == ',')
            .to_lowercase();
        rest = rest[eq + 1..].trim_start();

        let value = if let Some(quoted) = rest.strip_prefix('"') {
            match quoted.find('"') {
                Some(end) => {
                    let value = &quoted[..end];
                    rest = &quoted[end + 1..];
                    value
                }
                None => {
                    // Unterminated quote: take everything that is left
                    let value = quoted;
                    rest = "";
                    value
                }
            }
        } else {
            let end = rest
                .find(|c: char| c == ',' || c.is_whitespace())
                .unwrap_or(rest.len());
            let value = &rest[..end];
            rest = &rest[end..];
            value
        };

        if !key.is_empty() {
            params.insert(key, value.to_string());
        }
    }

    params
}
