// Copyright (C) 2024 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTSP authentication: `Basic` and `Digest` (MD5, [RFC
//! 2617](https://datatracker.ietf.org/doc/html/rfc2617) as reused by RTSP).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use md5::{Digest as _, Md5};
use rand::Rng as _;

use crate::client::Credentials;
use crate::message::Method;

/// The negotiated authentication strategy for a connection.
///
/// Replaced whenever a fresh `WWW-Authenticate` challenge arrives.
#[derive(Debug)]
pub(crate) enum Authenticator {
    None,
    Basic,
    Digest(DigestChallenge),
}

#[derive(Debug)]
pub(crate) struct DigestChallenge {
    realm: String,
    nonce: String,
    opaque: Option<String>,
    qop: Option<Qop>,

    /// Fixed for the lifetime of the challenge.
    cnonce: String,

    /// Count of uses of `nonce`, starting at 1. Reset by a new challenge.
    nonce_count: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Qop {
    Auth,
    AuthInt,
}

impl Qop {
    fn as_str(self) -> &'static str {
        match self {
            Qop::Auth => "auth",
            Qop::AuthInt => "auth-int",
        }
    }
}

impl Authenticator {
    /// Builds a strategy from a `WWW-Authenticate` header value.
    pub(crate) fn from_challenge(header: &str) -> Result<Self, String> {
        if let Some(rest) = header.strip_prefix("Digest ") {
            return Ok(Authenticator::Digest(DigestChallenge::parse(rest)?));
        }
        if header.starts_with("Basic ") || header == "Basic" {
            return Ok(Authenticator::Basic);
        }
        Err(format!("unsupported authentication scheme in {header:?}"))
    }

    /// Computes the `Authorization` header value for a request, or `None`
    /// when no challenge has been received yet.
    pub(crate) fn authorization(
        &mut self,
        creds: &Credentials,
        method: Method,
        uri: &str,
        body: &[u8],
    ) -> Option<String> {
        match self {
            Authenticator::None => None,
            Authenticator::Basic => Some(format!(
                "Basic {}",
                BASE64.encode(format!("{}:{}", creds.username, creds.password))
            )),
            Authenticator::Digest(c) => Some(c.respond(creds, method, uri, body)),
        }
    }
}

impl DigestChallenge {
    fn parse(params: &str) -> Result<Self, String> {
        let mut realm = None;
        let mut nonce = None;
        let mut opaque = None;
        let mut qop = None;
        let mut algorithm = None;
        for (key, value) in ParamIter(params) {
            match key.to_ascii_lowercase().as_str() {
                "realm" => realm = Some(value),
                "nonce" => nonce = Some(value),
                "opaque" => opaque = Some(value),
                "algorithm" => algorithm = Some(value),
                // Take the first token of the offered comma list.
                "qop" => {
                    qop = Some(
                        match value
                            .split(',')
                            .next()
                            .expect("split is non-empty")
                            .trim()
                        {
                            "auth" => Qop::Auth,
                            "auth-int" => Qop::AuthInt,
                            o => return Err(format!("unsupported qop {o:?}")),
                        },
                    )
                }
                _ => {}
            }
        }
        if let Some(a) = algorithm {
            if !a.eq_ignore_ascii_case("MD5") {
                return Err(format!("unsupported digest algorithm {a:?}"));
            }
        }
        let mut rng = rand::thread_rng();
        Ok(DigestChallenge {
            realm: realm.ok_or_else(|| "digest challenge without realm".to_owned())?,
            nonce: nonce.ok_or_else(|| "digest challenge without nonce".to_owned())?,
            opaque,
            qop,
            cnonce: format!("{:08x}", rng.gen::<u32>()),
            nonce_count: 0,
        })
    }

    fn respond(&mut self, creds: &Credentials, method: Method, uri: &str, body: &[u8]) -> String {
        let ha1 = md5_hex([
            creds.username.as_bytes(),
            b":",
            self.realm.as_bytes(),
            b":",
            creds.password.as_bytes(),
        ]);
        let ha2 = match self.qop {
            Some(Qop::AuthInt) => {
                let hbody = md5_hex([body]);
                md5_hex([
                    method.as_str().as_bytes(),
                    b":",
                    uri.as_bytes(),
                    b":",
                    hbody.as_bytes(),
                ])
            }
            _ => md5_hex([method.as_str().as_bytes(), b":", uri.as_bytes()]),
        };
        let mut header;
        match self.qop {
            Some(qop) => {
                self.nonce_count += 1;
                let nc = format!("{:08x}", self.nonce_count);
                let response = md5_hex([
                    ha1.as_bytes(),
                    b":",
                    self.nonce.as_bytes(),
                    b":",
                    nc.as_bytes(),
                    b":",
                    self.cnonce.as_bytes(),
                    b":",
                    qop.as_str().as_bytes(),
                    b":",
                    ha2.as_bytes(),
                ]);
                header = format!(
                    "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", \
                     response=\"{}\", qop={}, nc={}, cnonce=\"{}\"",
                    creds.username,
                    self.realm,
                    self.nonce,
                    uri,
                    response,
                    qop.as_str(),
                    nc,
                    self.cnonce,
                );
            }
            None => {
                let response = md5_hex([
                    ha1.as_bytes(),
                    b":",
                    self.nonce.as_bytes(),
                    b":",
                    ha2.as_bytes(),
                ]);
                header = format!(
                    "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", \
                     response=\"{}\"",
                    creds.username, self.realm, self.nonce, uri, response,
                );
            }
        }
        if let Some(o) = &self.opaque {
            header.push_str(", opaque=\"");
            header.push_str(o);
            header.push('"');
        }
        header
    }
}

/// Iterates over `key=value` parameters, unquoting quoted strings.
struct ParamIter<'a>(&'a str);

impl Iterator for ParamIter<'_> {
    type Item = (String, String);

    fn next(&mut self) -> Option<Self::Item> {
        let rest = self.0.trim_start_matches(|c: char| c == ',' || c.is_ascii_whitespace());
        if rest.is_empty() {
            self.0 = rest;
            return None;
        }
        let eq = rest.find('=')?;
        let key = rest[..eq].trim().to_owned();
        let after = &rest[eq + 1..];
        let (value, remaining) = if let Some(quoted) = after.strip_prefix('"') {
            match quoted.find('"') {
                Some(end) => (quoted[..end].to_owned(), &quoted[end + 1..]),
                None => (quoted.to_owned(), ""),
            }
        } else {
            match after.find(',') {
                Some(end) => (after[..end].trim().to_owned(), &after[end..]),
                None => (after.trim().to_owned(), ""),
            }
        };
        self.0 = remaining;
        Some((key, value))
    }
}

fn md5_hex<const N: usize>(parts: [&[u8]; N]) -> String {
    let mut h = Md5::new();
    for p in parts {
        h.update(p);
    }
    let digest = h.finalize();
    let mut out = String::with_capacity(32);
    for b in digest {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> Credentials {
        Credentials {
            username: "admin".to_owned(),
            password: "1234".to_owned(),
        }
    }

    #[test]
    fn digest_without_qop() {
        // Reference vector: HA1 = MD5("admin:IP Camera(21388):1234"),
        // HA2 = MD5("DESCRIBE:rtsp://cam/axis-media/media.amp"),
        // response = MD5(HA1:nonce:HA2).
        let mut a = Authenticator::from_challenge(
            "Digest realm=\"IP Camera(21388)\", \
             nonce=\"534407f373af1bdff561b7b4da295354\", stale=\"FALSE\"",
        )
        .unwrap();
        let header = a
            .authorization(
                &creds(),
                Method::Describe,
                "rtsp://cam/axis-media/media.amp",
                b"",
            )
            .unwrap();
        let expected_response = md5_hex([
            md5_hex([b"admin:IP Camera(21388):1234"]).as_bytes(),
            b":534407f373af1bdff561b7b4da295354:",
            md5_hex([b"DESCRIBE:rtsp://cam/axis-media/media.amp"]).as_bytes(),
        ]);
        assert!(
            header.contains(&format!("response=\"{expected_response}\"")),
            "{header}"
        );
        assert!(header.starts_with("Digest username=\"admin\""));
        assert!(!header.contains("qop"));
    }

    #[test]
    fn digest_with_qop_auth() {
        let mut a = Authenticator::from_challenge(
            "Digest realm=\"R\", nonce=\"N\", qop=\"auth,auth-int\", opaque=\"OP\"",
        )
        .unwrap();
        let h1 = a
            .authorization(&creds(), Method::Describe, "rtsp://cam/", b"")
            .unwrap();
        assert!(h1.contains("qop=auth"), "{h1}");
        assert!(h1.contains("nc=00000001"), "{h1}");
        assert!(h1.contains("opaque=\"OP\""), "{h1}");
        // The nonce counter advances per use of the same nonce; the cnonce
        // stays fixed.
        let cnonce1 = h1.split("cnonce=\"").nth(1).unwrap().split('"').next().unwrap().to_owned();
        let h2 = a
            .authorization(&creds(), Method::Describe, "rtsp://cam/", b"")
            .unwrap();
        assert!(h2.contains("nc=00000002"), "{h2}");
        assert!(h2.contains(&cnonce1), "{h2}");
    }

    #[test]
    fn fresh_challenge_resets_nonce_count() {
        let mut a = Authenticator::from_challenge("Digest realm=\"R\", nonce=\"N\", qop=\"auth\"")
            .unwrap();
        a.authorization(&creds(), Method::Describe, "rtsp://cam/", b"")
            .unwrap();
        a = Authenticator::from_challenge("Digest realm=\"R\", nonce=\"N2\", qop=\"auth\"")
            .unwrap();
        let h = a
            .authorization(&creds(), Method::Describe, "rtsp://cam/", b"")
            .unwrap();
        assert!(h.contains("nc=00000001"), "{h}");
        assert!(h.contains("nonce=\"N2\""), "{h}");
    }

    #[test]
    fn basic() {
        let mut a = Authenticator::from_challenge("Basic realm=\"R\"").unwrap();
        let h = a
            .authorization(&creds(), Method::Describe, "rtsp://cam/", b"")
            .unwrap();
        // base64("admin:1234")
        assert_eq!(h, "Basic YWRtaW46MTIzNA==");
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!(Authenticator::from_challenge("Bearer xyz").is_err());
    }
}
