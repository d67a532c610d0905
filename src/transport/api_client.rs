use anyhow::Context;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, trace};

use crate::credential::{ExecuteError, RequestExecutor};
use crate::transport::{CallError, VendorError};

/// `post_json` / `get_json` primitives for endpoint wrappers.
///
/// Each call appends `access_token` from the credential cache, decodes the
/// platform's `{errcode, errmsg}` envelope, and is replayed once through the
/// [`RequestExecutor`] when the token is rejected.
#[derive(Debug, Clone)]
pub struct ApiClient {
    base_url: String,
    http_client: Client,
    executor: RequestExecutor,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, executor: RequestExecutor) -> anyhow::Result<Self> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("building http client")?;
        Ok(Self::with_client(base_url, executor, http_client))
    }

    pub fn with_client(
        base_url: impl Into<String>,
        executor: RequestExecutor,
        http_client: Client,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client,
            executor,
        }
    }

    pub fn executor(&self) -> &RequestExecutor {
        &self.executor
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub async fn post_json<Req, Resp>(&self, path: &str, request: &Req) -> Result<Resp, ExecuteError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let body = serde_json::to_vec(request)
            .map_err(|e| CallError::Transport(format!("serialize request: {e}")))?;
        let url = self.url(path);
        let (url, body) = (&url, &body);

        self.executor
            .execute(move |token| async move {
                trace!(url = %url, "POST");
                let resp = self
                    .http_client
                    .post(url)
                    .query(&[("access_token", token.as_str())])
                    .header(CONTENT_TYPE, "application/json")
                    .body(body.clone())
                    .send()
                    .await
                    .map_err(|e| CallError::Transport(e.to_string()))?;
                decode_response(resp).await
            })
            .await
    }

    pub async fn get_json<Resp>(&self, path: &str) -> Result<Resp, ExecuteError>
    where
        Resp: DeserializeOwned,
    {
        let url = self.url(path);
        let url = &url;

        self.executor
            .execute(move |token| async move {
                trace!(url = %url, "GET");
                let resp = self
                    .http_client
                    .get(url)
                    .query(&[("access_token", token.as_str())])
                    .send()
                    .await
                    .map_err(|e| CallError::Transport(e.to_string()))?;
                decode_response(resp).await
            })
            .await
    }
}

async fn decode_response<Resp: DeserializeOwned>(resp: Response) -> Result<Resp, CallError> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(CallError::Transport(format!("http status {status}: {body}")));
    }

    let bytes = resp
        .bytes()
        .await
        .map_err(|e| CallError::Transport(format!("read body: {e}")))?;
    let value: Value = serde_json::from_slice(&bytes)
        .map_err(|e| CallError::Transport(format!("decode body: {e}")))?;

    if let Some(err) = VendorError::from_body(&value) {
        debug!(errcode = err.errcode, errmsg = %err.errmsg, "platform returned error");
        return Err(err.into());
    }
    serde_json::from_value(value).map_err(|e| CallError::Transport(format!("decode body: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::{CachePolicy, CredentialCache, HttpTokenSource};
    use mockito::{Matcher, Server};
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::Arc;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Group {
        id: i64,
        name: String,
    }

    #[derive(Debug, Deserialize)]
    struct GroupEnvelope {
        group: Group,
    }

    fn client_for(base_url: &str) -> ApiClient {
        let source = HttpTokenSource::new(base_url, "wxapp", "secret").unwrap();
        let cache = CredentialCache::new(Arc::new(source), CachePolicy::default());
        ApiClient::new(base_url, RequestExecutor::new(cache)).unwrap()
    }

    async fn token_mock(server: &mut Server, token: &str) -> mockito::Mock {
        server
            .mock("GET", "/cgi-bin/token")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "client_credential".into()),
                Matcher::UrlEncoded("appid".into(), "wxapp".into()),
                Matcher::UrlEncoded("secret".into(), "secret".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(json!({"access_token": token, "expires_in": 7200}).to_string())
            .expect(1)
            .create_async()
            .await
    }

    #[tokio::test]
    async fn test_post_json_attaches_token_and_decodes() {
        let mut server = Server::new_async().await;
        let token = token_mock(&mut server, "ACCESS_1").await;
        let create = server
            .mock("POST", "/cgi-bin/groups/create")
            .match_query(Matcher::UrlEncoded("access_token".into(), "ACCESS_1".into()))
            .match_body(Matcher::Json(json!({"group": {"name": "test"}})))
            .with_status(200)
            .with_body(r#"{"group":{"id":107,"name":"test"}}"#)
            .create_async()
            .await;

        let client = client_for(&server.url());
        let got: GroupEnvelope = client
            .post_json("/cgi-bin/groups/create", &json!({"group": {"name": "test"}}))
            .await
            .unwrap();
        assert_eq!(got.group, Group { id: 107, name: "test".into() });

        token.assert_async().await;
        create.assert_async().await;
    }

    #[tokio::test]
    async fn test_expired_token_is_refreshed_and_replayed_once() {
        let mut server = Server::new_async().await;
        let first = token_mock(&mut server, "OLD").await;
        let rejected = server
            .mock("GET", "/cgi-bin/groups/get")
            .match_query(Matcher::UrlEncoded("access_token".into(), "OLD".into()))
            .with_status(200)
            .with_body(r#"{"errcode":42001,"errmsg":"access_token expired"}"#)
            .expect(1)
            .create_async()
            .await;

        let client = client_for(&server.url());
        // Prime the cache with OLD, then rotate the issuer to NEW.
        client.executor().cache().get().await.unwrap();
        first.assert_async().await;
        first.remove_async().await;
        let second = token_mock(&mut server, "NEW").await;

        let accepted = server
            .mock("GET", "/cgi-bin/groups/get")
            .match_query(Matcher::UrlEncoded("access_token".into(), "NEW".into()))
            .with_status(200)
            .with_body(r#"{"groups":[]}"#)
            .expect(1)
            .create_async()
            .await;

        let got: Value = client.get_json("/cgi-bin/groups/get").await.unwrap();
        assert_eq!(got, json!({"groups": []}));

        rejected.assert_async().await;
        second.assert_async().await;
        accepted.assert_async().await;
    }

    #[tokio::test]
    async fn test_business_errors_are_returned_without_refresh() {
        let mut server = Server::new_async().await;
        let token = token_mock(&mut server, "ACCESS").await;
        let call = server
            .mock("POST", "/cgi-bin/groups/update")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"errcode":40050,"errmsg":"invalid group id"}"#)
            .expect(1)
            .create_async()
            .await;

        let client = client_for(&server.url());
        let err = client
            .post_json::<_, Value>("cgi-bin/groups/update", &json!({"group": {"id": 1, "name": "x"}}))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ExecuteError::Call(CallError::Remote(VendorError::new(40050, "invalid group id")))
        );

        token.assert_async().await;
        call.assert_async().await;
    }

    #[tokio::test]
    async fn test_http_failure_is_transport_error() {
        let mut server = Server::new_async().await;
        let _token = token_mock(&mut server, "ACCESS").await;
        let _call = server
            .mock("GET", "/cgi-bin/groups/get")
            .match_query(Matcher::Any)
            .with_status(502)
            .create_async()
            .await;

        let client = client_for(&server.url());
        let err = client.get_json::<Value>("/cgi-bin/groups/get").await.unwrap_err();
        assert!(matches!(err, ExecuteError::Call(CallError::Transport(_))));
    }
}
