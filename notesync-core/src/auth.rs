use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use url::Url;

type HmacSha1 = Hmac<Sha1>;

/// Access key, secret key and bucket for the object store.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
}

impl Credentials {
    pub fn new(
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
        bucket: impl Into<String>,
    ) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            bucket: bucket.into(),
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.access_key.is_empty() && !self.secret_key.is_empty() && !self.bucket.is_empty()
    }

    /// Builds a single-use upload token whose scope is limited to `bucket:key`.
    pub fn upload_token(&self, key: &str, deadline: i64) -> String {
        let policy = serde_json::json!({
            "scope": format!("{}:{}", self.bucket, key),
            "deadline": deadline,
        });
        let encoded = URL_SAFE.encode(policy.to_string().as_bytes());
        let signature = self.sign(encoded.as_bytes());
        format!("{}:{}:{}", self.access_key, signature, encoded)
    }

    /// `Authorization` header value for resource-management requests.
    pub fn management_token(&self, path_and_query: &str, body: Option<&[u8]>) -> String {
        let mut data = Vec::with_capacity(path_and_query.len() + 1);
        data.extend_from_slice(path_and_query.as_bytes());
        data.push(b'\n');
        if let Some(body) = body {
            data.extend_from_slice(body);
        }
        format!("QBox {}:{}", self.access_key, self.sign(&data))
    }

    /// Appends `e=<deadline>` and a matching `token` to a download URL.
    pub fn sign_download_url(&self, url: &mut Url, deadline: i64) {
        url.query_pairs_mut()
            .append_pair("e", &deadline.to_string());
        let token = format!(
            "{}:{}",
            self.access_key,
            self.sign(url.as_str().as_bytes())
        );
        url.query_pairs_mut().append_pair("token", &token);
    }

    fn sign(&self, data: &[u8]) -> String {
        let mut mac = HmacSha1::new_from_slice(self.secret_key.as_bytes())
            .expect("hmac accepts keys of any length");
        mac.update(data);
        URL_SAFE.encode(mac.finalize().into_bytes())
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("bucket", &self.bucket)
            .finish()
    }
}

/// URL-safe base64 of `bucket:key`, the path segment used by stat and delete.
pub fn encoded_entry(bucket: &str, key: &str) -> String {
    URL_SAFE.encode(format!("{bucket}:{key}").as_bytes())
}
