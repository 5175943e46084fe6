//! Blob REST API over `ureq`.

use std::time::Duration;

use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::Utc;
use url::Url;

use super::{
    BlobDownload, BlobStore, Metadata,
    connection::{ConnectionString, StorageAuth},
    shared_key::SharedKeyCredential,
};
use crate::http::{self, ServiceError};

pub const API_VERSION: &str = "2021-08-06";
const METADATA_PREFIX: &str = "x-ms-meta-";

enum Auth {
    SharedKey(SharedKeyCredential),
    Sas(String),
}

pub struct AzureBlobStore {
    endpoint: Url,
    auth: Auth,
    agent: ureq::Agent,
}

impl AzureBlobStore {
    pub fn new(connection: ConnectionString) -> Self {
        let auth = match connection.auth {
            StorageAuth::SharedKey { account, key } => {
                Auth::SharedKey(SharedKeyCredential::new(account, key))
            }
            StorageAuth::Sas(sas) => Auth::Sas(sas),
        };
        Self {
            endpoint: connection.blob_endpoint,
            auth,
            agent: http::agent(Duration::from_secs(30)),
        }
    }

    pub fn from_connection_string(raw: &str) -> anyhow::Result<Self> {
        Ok(Self::new(ConnectionString::parse(raw)?))
    }

    /// `{endpoint}/{container}[/{blob path segments}]`.
    fn url(&self, container: &str, blob: Option<&str>) -> anyhow::Result<Url> {
        let mut url = self.endpoint.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|()| {
                anyhow::anyhow!("blob endpoint cannot be a base: {}", self.endpoint)
            })?;
            segments.pop_if_empty().push(container);
            if let Some(blob) = blob {
                segments.extend(blob.split('/'));
            }
        }
        Ok(url)
    }

    /// Build a signed (or SAS-authorized) request. `content_length`
    /// must match the body that will be sent.
    fn request(
        &self,
        method: &str,
        mut url: Url,
        extra_headers: &[(&str, &str)],
        content_length: Option<usize>,
    ) -> anyhow::Result<ureq::Request> {
        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        let mut headers: Vec<(&str, &str)> =
            vec![("x-ms-date", date.as_str()), ("x-ms-version", API_VERSION)];
        headers.extend_from_slice(extra_headers);

        let authorization = match &self.auth {
            Auth::SharedKey(credential) => {
                let content_length = content_length.map(|len| len.to_string());
                let mut signed = headers.clone();
                if let Some(len) = &content_length {
                    signed.push(("Content-Length", len.as_str()));
                }
                Some(credential.authorization(method, &url, &signed)?)
            }
            Auth::Sas(sas) => {
                let query = match url.query() {
                    Some(q) => format!("{q}&{sas}"),
                    None => sas.clone(),
                };
                url.set_query(Some(&query));
                None
            }
        };

        log::debug!("{method} {}", url.path());
        let mut request = self.agent.request_url(method, &url);
        for (name, value) in &headers {
            request = request.set(name, value);
        }
        if let Some(authorization) = &authorization {
            request = request.set("Authorization", authorization);
        }
        Ok(request)
    }
}

fn error_code(response: &ureq::Response) -> Option<&str> {
    response.header("x-ms-error-code")
}

fn block_list_xml(block_ids: &[String]) -> String {
    let mut xml = String::from(r#"<?xml version="1.0" encoding="utf-8"?><BlockList>"#);
    for id in block_ids {
        xml.push_str("<Latest>");
        xml.push_str(id);
        xml.push_str("</Latest>");
    }
    xml.push_str("</BlockList>");
    xml
}

impl BlobStore for AzureBlobStore {
    fn create_container_if_not_exists(&self, container: &str) -> anyhow::Result<bool> {
        let mut url = self.url(container, None)?;
        url.query_pairs_mut().append_pair("restype", "container");
        match self.request("PUT", url, &[], Some(0))?.send_bytes(&[]) {
            Ok(_) => Ok(true),
            Err(ureq::Error::Status(409, response))
                if error_code(&response) == Some("ContainerAlreadyExists") =>
            {
                Ok(false)
            }
            Err(e) => Err(http::into_error(e)),
        }
    }

    fn stage_block(
        &self,
        container: &str,
        blob: &str,
        block_id: &str,
        data: &[u8],
    ) -> anyhow::Result<()> {
        let mut url = self.url(container, Some(blob))?;
        url.query_pairs_mut()
            .append_pair("comp", "block")
            .append_pair("blockid", block_id);
        self.request("PUT", url, &[], Some(data.len()))?
            .send_bytes(data)
            .map_err(http::into_error)?;
        Ok(())
    }

    fn commit_block_list(
        &self,
        container: &str,
        blob: &str,
        block_ids: &[String],
        metadata: &Metadata,
    ) -> anyhow::Result<()> {
        let mut url = self.url(container, Some(blob))?;
        url.query_pairs_mut().append_pair("comp", "blocklist");

        let names: Vec<String> = metadata
            .keys()
            .map(|k| format!("{METADATA_PREFIX}{k}"))
            .collect();
        let mut headers: Vec<(&str, &str)> = vec![("Content-Type", "application/xml")];
        headers.extend(
            names
                .iter()
                .zip(metadata.values())
                .map(|(name, value)| (name.as_str(), value.as_str())),
        );

        let xml = block_list_xml(block_ids);
        self.request("PUT", url, &headers, Some(xml.len()))?
            .send_bytes(xml.as_bytes())
            .map_err(http::into_error)?;
        Ok(())
    }

    fn get_blob(&self, container: &str, blob: &str) -> anyhow::Result<BlobDownload> {
        let url = self.url(container, Some(blob))?;
        let response = match self.request("GET", url, &[], None)?.call() {
            Ok(response) => response,
            Err(ureq::Error::Status(404, response)) => {
                let err = ServiceError::from_response(404, response);
                return Err(anyhow::Error::new(err)
                    .context(format!("blob '{container}/{blob}' does not exist")));
            }
            Err(e) => return Err(http::into_error(e)),
        };

        let metadata = response
            .headers_names()
            .into_iter()
            .filter_map(|name| {
                let lower = name.to_ascii_lowercase();
                let key = lower.strip_prefix(METADATA_PREFIX)?.to_owned();
                let value = response.header(&name)?.to_owned();
                Some((key, value))
            })
            .collect();
        Ok(BlobDownload {
            metadata,
            body: Box::new(response.into_reader()),
        })
    }
}

/// Block ids must all have the same length within a blob.
pub fn block_id(index: usize) -> String {
    STANDARD.encode(format!("{index:08}"))
}
