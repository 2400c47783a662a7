//! RTSP authentication (RFC 2326 §D, RFC 2617).
//!
//! Digest with MD5 is checked against a per-connection nonce:
//!
//! ```text
//! HA1      = MD5(username:realm:password)
//! HA2      = MD5(method:uri)
//! response = MD5(HA1:nonce:HA2)
//! ```
//!
//! Basic credentials are accepted as well. When credentials are
//! configured, every method except OPTIONS must be authorized.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::config::Credential;
use crate::protocol::request::{Method, RtspRequest};

/// Username/password store with the realm announced in challenges.
#[derive(Debug, Clone)]
pub struct Authenticator {
    realm: String,
    credentials: Vec<Credential>,
}

impl Authenticator {
    pub fn new(realm: &str) -> Self {
        Self {
            realm: realm.to_string(),
            credentials: Vec::new(),
        }
    }

    pub fn add_credential(&mut self, username: &str, password: &str) {
        self.credentials.push(Credential {
            username: username.to_string(),
            password: password.to_string(),
        });
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    /// A fresh nonce for one connection.
    pub fn new_nonce() -> String {
        format!("{:08x}{:08x}", rand::random::<u32>(), rand::random::<u32>())
    }

    /// Whether `request` carries valid credentials for `nonce`.
    pub fn authorize(&self, request: &RtspRequest, nonce: &str) -> bool {
        if request.method == Method::Options || self.credentials.is_empty() {
            return true;
        }
        let Some(header) = request.get_header("Authorization") else {
            return false;
        };
        let (scheme, params) = header.split_once(' ').unwrap_or((header, ""));
        if scheme.eq_ignore_ascii_case("Digest") {
            self.check_digest(request.method.as_str(), params, nonce)
        } else if scheme.eq_ignore_ascii_case("Basic") {
            self.check_basic(params.trim())
        } else {
            false
        }
    }

    fn check_digest(&self, method: &str, params: &str, nonce: &str) -> bool {
        let fields = parse_auth_params(params);
        let field = |name: &str| {
            fields
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        };
        let (Some(username), Some(uri), Some(response)) =
            (field("username"), field("uri"), field("response"))
        else {
            return false;
        };
        if field("nonce") != Some(nonce) || field("realm").is_some_and(|r| r != self.realm) {
            tracing::debug!(username, "digest nonce or realm mismatch");
            return false;
        }
        self.credentials
            .iter()
            .filter(|c| c.username == username)
            .any(|c| digest_response(c, &self.realm, nonce, method, uri).eq_ignore_ascii_case(response))
    }

    fn check_basic(&self, encoded: &str) -> bool {
        let Ok(decoded) = STANDARD.decode(encoded) else {
            return false;
        };
        let Ok(decoded) = String::from_utf8(decoded) else {
            return false;
        };
        let Some((username, password)) = decoded.split_once(':') else {
            return false;
        };
        self.credentials
            .iter()
            .any(|c| c.username == username && c.password == password)
    }

    /// `WWW-Authenticate` challenges for a 401 response.
    pub fn challenges(&self, nonce: &str) -> [String; 2] {
        [
            format!("Digest realm=\"{}\", nonce=\"{}\"", self.realm, nonce),
            format!("Basic realm=\"{}\"", self.realm),
        ]
    }
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}

/// Expected Digest `response` value for `credential`.
pub fn digest_response(credential: &Credential, realm: &str, nonce: &str, method: &str, uri: &str) -> String {
    let ha1 = md5_hex(&format!("{}:{}:{}", credential.username, realm, credential.password));
    let ha2 = md5_hex(&format!("{method}:{uri}"));
    md5_hex(&format!("{ha1}:{nonce}:{ha2}"))
}

/// Split `k1="v1", k2=v2` into pairs. Quoted values may contain commas.
fn parse_auth_params(params: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut rest = params.trim();
    while !rest.is_empty() {
        let Some((key, after)) = rest.split_once('=') else {
            break;
        };
        let key = key.trim().trim_start_matches(',').trim().to_string();
        let after = after.trim_start();
        let (value, remainder) = if let Some(quoted) = after.strip_prefix('"') {
            match quoted.find('"') {
                Some(end) => (&quoted[..end], &quoted[end + 1..]),
                None => (quoted, ""),
            }
        } else {
            match after.find(',') {
                Some(end) => (&after[..end], &after[end..]),
                None => (after, ""),
            }
        };
        out.push((key, value.trim().to_string()));
        rest = remainder.trim_start().trim_start_matches(',').trim_start();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authenticator() -> Authenticator {
        let mut auth = Authenticator::new("Streaming Server");
        auth.add_credential("admin", "secret");
        auth
    }

    fn request(method: &str, authorization: Option<&str>) -> RtspRequest {
        let mut raw = format!("{method} rtsp://h:5554/live RTSP/1.0\r\nCSeq: 2\r\n");
        if let Some(value) = authorization {
            raw.push_str(&format!("Authorization: {value}\r\n"));
        }
        raw.push_str("\r\n");
        RtspRequest::parse(&raw).unwrap()
    }

    #[test]
    fn options_needs_no_credentials() {
        assert!(authenticator().authorize(&request("OPTIONS", None), "n"));
    }

    #[test]
    fn missing_credentials_rejected() {
        assert!(!authenticator().authorize(&request("DESCRIBE", None), "n"));
    }

    #[test]
    fn digest_accepted_with_matching_nonce() {
        let auth = authenticator();
        let cred = Credential {
            username: "admin".into(),
            password: "secret".into(),
        };
        let response = digest_response(&cred, "Streaming Server", "abc123", "DESCRIBE", "rtsp://h:5554/live");
        let header = format!(
            "Digest username=\"admin\", realm=\"Streaming Server\", nonce=\"abc123\", uri=\"rtsp://h:5554/live\", response=\"{response}\""
        );
        assert!(auth.authorize(&request("DESCRIBE", Some(&header)), "abc123"));
        // Replayed against another connection's nonce.
        assert!(!auth.authorize(&request("DESCRIBE", Some(&header)), "other"));
        // Signed for another method.
        assert!(!auth.authorize(&request("PLAY", Some(&header)), "abc123"));
    }

    #[test]
    fn known_digest_vector() {
        // RFC 2617 §3.5 HA1/HA2 construction with simple inputs.
        let cred = Credential {
            username: "u".into(),
            password: "p".into(),
        };
        let ha1 = md5_hex("u:r:p");
        let ha2 = md5_hex("DESCRIBE:rtsp://x/");
        assert_eq!(
            digest_response(&cred, "r", "n", "DESCRIBE", "rtsp://x/"),
            md5_hex(&format!("{ha1}:n:{ha2}"))
        );
        assert_eq!(md5_hex(""), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn basic_credentials() {
        let auth = authenticator();
        let good = format!("Basic {}", STANDARD.encode("admin:secret"));
        let bad = format!("Basic {}", STANDARD.encode("admin:wrong"));
        assert!(auth.authorize(&request("SETUP", Some(&good)), "n"));
        assert!(!auth.authorize(&request("SETUP", Some(&bad)), "n"));
        assert!(!auth.authorize(&request("SETUP", Some("Basic !!!")), "n"));
    }

    #[test]
    fn params_with_commas_in_quotes() {
        let fields = parse_auth_params("a=\"x, y\", b=plain, c=\"z\"");
        assert_eq!(
            fields,
            vec![
                ("a".to_string(), "x, y".to_string()),
                ("b".to_string(), "plain".to_string()),
                ("c".to_string(), "z".to_string()),
            ]
        );
    }

    #[test]
    fn nonces_differ() {
        assert_ne!(Authenticator::new_nonce(), Authenticator::new_nonce());
    }
}
