//! Shared Key request signing for the blob service.

use std::collections::BTreeMap;

use base64::{Engine, engine::general_purpose::STANDARD};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use url::Url;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// Standard headers that take part in the signature, in order.
const SIGNED_HEADERS: [&str; 11] = [
    "content-encoding",
    "content-language",
    "content-length",
    "content-md5",
    "content-type",
    "date",
    "if-modified-since",
    "if-match",
    "if-none-match",
    "if-unmodified-since",
    "range",
];

pub struct SharedKeyCredential {
    account: String,
    key: Zeroizing<Vec<u8>>,
}

impl SharedKeyCredential {
    pub fn new(account: impl Into<String>, key: Zeroizing<Vec<u8>>) -> Self {
        Self {
            account: account.into(),
            key,
        }
    }

    /// Value for the `Authorization` header of a request with these
    /// headers (every header that will be sent, including `x-ms-date`
    /// and `Content-Length`).
    pub fn authorization(
        &self,
        method: &str,
        url: &Url,
        headers: &[(&str, &str)],
    ) -> anyhow::Result<String> {
        let string_to_sign = self.string_to_sign(method, url, headers);
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| anyhow::anyhow!("invalid account key: {e}"))?;
        mac.update(string_to_sign.as_bytes());
        let signature = STANDARD.encode(mac.finalize().into_bytes());
        Ok(format!("SharedKey {}:{signature}", self.account))
    }

    pub fn string_to_sign(&self, method: &str, url: &Url, headers: &[(&str, &str)]) -> String {
        let lookup = |name: &str| {
            headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| *v)
                .unwrap_or("")
        };

        let mut out = String::new();
        out.push_str(&method.to_ascii_uppercase());
        out.push('\n');
        for name in SIGNED_HEADERS {
            let value = lookup(name);
            // Zero length is signed as empty since version 2015-02-21.
            let value = if name == "content-length" && value == "0" {
                ""
            } else {
                value
            };
            out.push_str(value);
            out.push('\n');
        }

        let mut ms_headers: BTreeMap<String, &str> = BTreeMap::new();
        for (name, value) in headers {
            let name = name.to_ascii_lowercase();
            if name.starts_with("x-ms-") {
                ms_headers.insert(name, value.trim());
            }
        }
        for (name, value) in &ms_headers {
            out.push_str(name);
            out.push(':');
            out.push_str(value);
            out.push('\n');
        }

        out.push_str(&self.canonicalized_resource(url));
        out
    }

    fn canonicalized_resource(&self, url: &Url) -> String {
        let mut out = format!("/{}{}", self.account, url.path());
        let mut params: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in url.query_pairs() {
            params
                .entry(name.to_ascii_lowercase())
                .or_default()
                .push(value.into_owned());
        }
        for (name, mut values) in params {
            values.sort();
            out.push('\n');
            out.push_str(&name);
            out.push(':');
            out.push_str(&values.join(","));
        }
        out
    }
}
