//! Blocking HTTP access to a recsync storage server.

use crate::client::{CollectionRequest, InfoCollections, PostResult, Response, StorageClient};
use crate::record::Bso;
use crate::{Error, RecordId, Result, Timestamp};
use reqwest::blocking::{Client, RequestBuilder, Response as HttpResponse};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, trace};

/// Header carrying the server's clock, in milliseconds.
pub const TIMESTAMP_HEADER: &str = "X-Weave-Timestamp";

#[derive(Deserialize)]
struct Modified {
    modified: Timestamp,
}

pub struct HttpClient {
    base_url: String,
    token: Option<String>,
    http: Client,
}

impl HttpClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
            http: Client::new(),
        }
    }

    /// Send `token` as a bearer token with every request.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn collection_url(&self, collection: &str) -> String {
        self.url(&format!("/storage/{collection}"))
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Send the request; `Ok(None)` on 404.
    fn send(&self, builder: RequestBuilder, url: &str) -> Result<Option<HttpResponse>> {
        let response = self
            .authorize(builder)
            .send()
            .map_err(|e| Error::Network(e.to_string()))?;
        let status = response.status();
        trace!(url, %status, "storage response");
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            debug!(url, %status, "storage request failed");
            return Err(Error::Http {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(Some(response))
    }

    fn send_found(&self, builder: RequestBuilder, url: &str) -> Result<HttpResponse> {
        self.send(builder, url)?.ok_or_else(|| Error::Http {
            status: StatusCode::NOT_FOUND.as_u16(),
            url: url.to_string(),
        })
    }

    fn timestamp(response: &HttpResponse) -> Timestamp {
        response
            .headers()
            .get(TIMESTAMP_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    fn json<T: DeserializeOwned>(response: HttpResponse) -> Result<Response<T>> {
        let timestamp = Self::timestamp(&response);
        let value = response
            .json()
            .map_err(|e| Error::Network(e.to_string()))?;
        Ok(Response::new(value, timestamp))
    }
}

impl StorageClient for HttpClient {
    fn info_collections(&self) -> Result<Response<InfoCollections>> {
        let url = self.url("/info/collections");
        Self::json(self.send_found(self.http.get(&url), &url)?)
    }

    fn get_record(&self, collection: &str, id: &str) -> Result<Option<Response<Bso>>> {
        let url = format!("{}/{id}", self.collection_url(collection));
        match self.send(self.http.get(&url), &url)? {
            Some(response) => Ok(Some(Self::json(response)?)),
            None => Ok(None),
        }
    }

    fn put_record(&self, collection: &str, record: &Bso) -> Result<Timestamp> {
        let url = format!("{}/{}", self.collection_url(collection), record.id);
        let response = self.send_found(self.http.put(&url).json(record), &url)?;
        Ok(Self::json::<Modified>(response)?.value.modified)
    }

    fn get(&self, collection: &str, request: &CollectionRequest) -> Result<Response<Vec<Bso>>> {
        let url = self.collection_url(collection);
        let builder = self.http.get(&url).query(&request.to_query_pairs(true));
        match self.send(builder, &url)? {
            Some(response) => Self::json(response),
            None => Ok(Response::new(Vec::new(), 0)),
        }
    }

    fn get_ids(
        &self,
        collection: &str,
        request: &CollectionRequest,
    ) -> Result<Response<Vec<RecordId>>> {
        let url = self.collection_url(collection);
        let builder = self.http.get(&url).query(&request.to_query_pairs(false));
        match self.send(builder, &url)? {
            Some(response) => Self::json(response),
            None => Ok(Response::new(Vec::new(), 0)),
        }
    }

    fn post(&self, collection: &str, records: &[Bso]) -> Result<Response<PostResult>> {
        let url = self.collection_url(collection);
        Self::json(self.send_found(self.http.post(&url).json(records), &url)?)
    }

    fn delete(&self, collection: &str, request: &CollectionRequest) -> Result<Timestamp> {
        let url = self.collection_url(collection);
        let builder = self.http.delete(&url).query(&request.to_query_pairs(false));
        match self.send(builder, &url)? {
            Some(response) => Ok(Self::json::<Modified>(response)?.value.modified),
            None => Ok(0),
        }
    }

    fn wipe_collection(&self, collection: &str) -> Result<Timestamp> {
        self.delete(collection, &CollectionRequest::new())
    }

    fn wipe_all(&self) -> Result<Timestamp> {
        let url = self.url("/storage");
        let response = self.send_found(self.http.delete(&url), &url)?;
        Ok(Self::json::<Modified>(response)?.value.modified)
    }
}
