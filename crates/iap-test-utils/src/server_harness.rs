//! Mock servers for the identity provider and the metadata server
//!
//! Both wrap a `wiremock::MockServer`. Expectations set through `.expect(n)`
//! are verified when the harness is dropped, which is how tests assert how
//! many fetches the caches made.

use crate::crypto_fixtures::{jwk_key_set, pem_key_set, TestSigningKey};
use std::time::Duration;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Path the mock identity provider serves keys on.
pub const PUBLIC_KEY_PATH: &str = "/iap/verify/public_key";

/// Project metadata directory on the mock metadata server.
pub const METADATA_PROJECT_PATH: &str = "/computeMetadata/v1/project";

/// Mock of the IAP public key endpoint.
pub struct MockIdentityProvider {
    server: MockServer,
}

impl MockIdentityProvider {
    pub async fn start() -> Self {
        Self {
            server: MockServer::start().await,
        }
    }

    /// URL to configure as the public key URL.
    pub fn public_key_url(&self) -> String {
        format!("{}{}", self.server.uri(), PUBLIC_KEY_PATH)
    }

    /// Serve `keys` in the PEM map format on every request.
    pub async fn serve_keys(&self, keys: &[&TestSigningKey]) {
        self.mount_keys(ResponseTemplate::new(200).set_body_json(pem_key_set(keys)), None, None)
            .await;
    }

    /// Serve `keys` in the JWK Set format on every request.
    pub async fn serve_jwk_keys(&self, keys: &[&TestSigningKey]) {
        self.mount_keys(ResponseTemplate::new(200).set_body_json(jwk_key_set(keys)), None, None)
            .await;
    }

    /// Serve `keys` and expect exactly `times` fetches.
    pub async fn serve_keys_expecting(&self, keys: &[&TestSigningKey], times: u64) {
        self.mount_keys(
            ResponseTemplate::new(200).set_body_json(pem_key_set(keys)),
            None,
            Some(times),
        )
        .await;
    }

    /// Serve `keys` with a response delay, expecting exactly `times` fetches.
    pub async fn serve_keys_slowly(&self, keys: &[&TestSigningKey], delay: Duration, times: u64) {
        self.mount_keys(
            ResponseTemplate::new(200)
                .set_body_json(pem_key_set(keys))
                .set_delay(delay),
            None,
            Some(times),
        )
        .await;
    }

    /// Serve `keys` for the next `times` requests only.
    ///
    /// Mount the follow-up key set afterwards; wiremock falls through to it
    /// once this mock is exhausted.
    pub async fn serve_keys_times(&self, keys: &[&TestSigningKey], times: u64) {
        self.mount_keys(
            ResponseTemplate::new(200).set_body_json(pem_key_set(keys)),
            Some(times),
            Some(times),
        )
        .await;
    }

    /// Answer every request with `status` and `body`.
    pub async fn fail_with(&self, status: u16, body: &str) {
        self.mount_keys(ResponseTemplate::new(status).set_body_string(body), None, None)
            .await;
    }

    /// Answer the next `times` requests with `status`.
    pub async fn fail_times(&self, status: u16, times: u64) {
        self.mount_keys(ResponseTemplate::new(status), Some(times), Some(times))
            .await;
    }

    /// Answer the next `times` requests with `status` after `delay`.
    pub async fn fail_slowly(&self, status: u16, delay: Duration, times: u64) {
        self.mount_keys(
            ResponseTemplate::new(status).set_delay(delay),
            Some(times),
            Some(times),
        )
        .await;
    }

    async fn mount_keys(&self, response: ResponseTemplate, limit: Option<u64>, expect: Option<u64>) {
        let mut mock = Mock::given(method("GET"))
            .and(path(PUBLIC_KEY_PATH))
            .respond_with(response);
        if let Some(limit) = limit {
            mock = mock.up_to_n_times(limit);
        }
        if let Some(expect) = expect {
            mock = mock.expect(expect);
        }
        mock.mount(&self.server).await;
    }

    pub fn server(&self) -> &MockServer {
        &self.server
    }
}

/// Mock of the project metadata directory.
///
/// Only requests carrying `Metadata-Flavor: Google` are answered; anything
/// else falls through to wiremock's default 404.
pub struct MockMetadataServer {
    server: MockServer,
}

impl MockMetadataServer {
    pub async fn start() -> Self {
        Self {
            server: MockServer::start().await,
        }
    }

    /// URL to configure as the metadata base URL.
    pub fn metadata_url(&self) -> String {
        format!("{}{}/", self.server.uri(), METADATA_PROJECT_PATH)
    }

    /// Answer both project lookups on every request.
    pub async fn serve_project(&self, numeric_project_id: &str, project_id: &str) {
        self.mount_item("numeric-project-id", ResponseTemplate::new(200).set_body_string(numeric_project_id), None)
            .await;
        self.mount_item("project-id", ResponseTemplate::new(200).set_body_string(project_id), None)
            .await;
    }

    /// Answer both lookups, each expected exactly `times` times.
    pub async fn serve_project_expecting(&self, numeric_project_id: &str, project_id: &str, times: u64) {
        self.mount_item(
            "numeric-project-id",
            ResponseTemplate::new(200).set_body_string(numeric_project_id),
            Some(times),
        )
        .await;
        self.mount_item(
            "project-id",
            ResponseTemplate::new(200).set_body_string(project_id),
            Some(times),
        )
        .await;
    }

    /// Answer both lookups after `delay`, each expected exactly `times` times.
    pub async fn serve_project_slowly(
        &self,
        numeric_project_id: &str,
        project_id: &str,
        delay: Duration,
        times: u64,
    ) {
        self.mount_item(
            "numeric-project-id",
            ResponseTemplate::new(200)
                .set_body_string(numeric_project_id)
                .set_delay(delay),
            Some(times),
        )
        .await;
        self.mount_item(
            "project-id",
            ResponseTemplate::new(200)
                .set_body_string(project_id)
                .set_delay(delay),
            Some(times),
        )
        .await;
    }

    /// Answer one item with an arbitrary response.
    pub async fn serve_item(&self, item: &str, response: ResponseTemplate) {
        self.mount_item(item, response, None).await;
    }

    async fn mount_item(&self, item: &str, response: ResponseTemplate, expect: Option<u64>) {
        let mut mock = Mock::given(method("GET"))
            .and(path(format!("{}/{}", METADATA_PROJECT_PATH, item)))
            .and(header("Metadata-Flavor", "Google"))
            .respond_with(response);
        if let Some(expect) = expect {
            mock = mock.expect(expect);
        }
        mock.mount(&self.server).await;
    }

    pub fn server(&self) -> &MockServer {
        &self.server
    }
}
