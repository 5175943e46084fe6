use base64::{Engine, engine::general_purpose::STANDARD};
use url::Url;
use zeroize::Zeroizing;

pub const DEV_ACCOUNT_NAME: &str = "devstoreaccount1";
pub const DEV_ACCOUNT_KEY: &str =
    "Eby8vdM02xNOcqFlqUwJPLlmEtlCDXJ1OUzFT50uSRZ6IFsuFq2UVErCz4I6tq/K1SZFPTOtr/KBHBeksoGMGw==";
const DEV_BLOB_ENDPOINT: &str = "http://127.0.0.1:10000/devstoreaccount1";

/// How requests to the blob endpoint are authorized.
pub enum StorageAuth {
    SharedKey {
        account: String,
        key: Zeroizing<Vec<u8>>,
    },
    /// SAS token appended to every request's query string.
    Sas(String),
}

/// A parsed storage connection string.
pub struct ConnectionString {
    pub blob_endpoint: Url,
    pub auth: StorageAuth,
}

impl ConnectionString {
    /// Parse `Key=Value;...` pairs. Keys are case-insensitive and
    /// unknown keys are ignored.
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let mut protocol = None;
        let mut account_name = None;
        let mut account_key = None;
        let mut endpoint_suffix = None;
        let mut blob_endpoint = None;
        let mut sas = None;
        let mut development = false;

        for part in raw.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = part.split_once('=').ok_or_else(|| {
                anyhow::anyhow!("malformed connection string segment '{}'", redact(part))
            })?;
            let value = value.trim().to_owned();
            match key.trim().to_ascii_lowercase().as_str() {
                "defaultendpointsprotocol" => protocol = Some(value),
                "accountname" => account_name = Some(value),
                "accountkey" => account_key = Some(Zeroizing::new(value)),
                "endpointsuffix" => endpoint_suffix = Some(value),
                "blobendpoint" => blob_endpoint = Some(value),
                "sharedaccesssignature" => sas = Some(value),
                "usedevelopmentstorage" => development = value.eq_ignore_ascii_case("true"),
                other => log::debug!("ignoring connection string key '{other}'"),
            }
        }

        if development {
            account_name.get_or_insert_with(|| DEV_ACCOUNT_NAME.to_owned());
            account_key.get_or_insert_with(|| Zeroizing::new(DEV_ACCOUNT_KEY.to_owned()));
            blob_endpoint.get_or_insert_with(|| DEV_BLOB_ENDPOINT.to_owned());
        }

        let blob_endpoint = match (blob_endpoint, &account_name) {
            (Some(endpoint), _) => Url::parse(&endpoint)
                .map_err(|e| anyhow::anyhow!("invalid BlobEndpoint '{endpoint}': {e}"))?,
            (None, Some(account)) => {
                let protocol = protocol.as_deref().unwrap_or("https");
                let suffix = endpoint_suffix.as_deref().unwrap_or("core.windows.net");
                Url::parse(&format!("{protocol}://{account}.blob.{suffix}"))
                    .map_err(|e| anyhow::anyhow!("cannot build blob endpoint: {e}"))?
            }
            (None, None) => anyhow::bail!("connection string needs AccountName or BlobEndpoint"),
        };

        let auth = match (account_key, sas) {
            (_, Some(sas)) => StorageAuth::Sas(sas.trim_start_matches('?').to_owned()),
            (Some(key), None) => {
                let account = account_name
                    .ok_or_else(|| anyhow::anyhow!("AccountKey given without AccountName"))?;
                let key = Zeroizing::new(
                    STANDARD
                        .decode(key.as_bytes())
                        .map_err(|e| anyhow::anyhow!("AccountKey is not base64: {e}"))?,
                );
                StorageAuth::SharedKey { account, key }
            }
            (None, None) => {
                anyhow::bail!("connection string needs AccountKey or SharedAccessSignature")
            }
        };

        Ok(Self {
            blob_endpoint,
            auth,
        })
    }
}

/// Keep secrets out of error messages.
fn redact(part: &str) -> String {
    match part.split_once('=') {
        Some((key, _)) => format!("{key}=***"),
        None if part.chars().count() > 8 => {
            format!("{}...", part.chars().take(8).collect::<String>())
        }
        None => part.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_key_form() {
        let cs = ConnectionString::parse(
            "DefaultEndpointsProtocol=https;AccountName=acct;AccountKey=a2V5;EndpointSuffix=core.windows.net",
        )
        .unwrap();
        assert_eq!(cs.blob_endpoint.as_str(), "https://acct.blob.core.windows.net/");
        match cs.auth {
            StorageAuth::SharedKey { account, key } => {
                assert_eq!(account, "acct");
                assert_eq!(key.as_slice(), b"key");
            }
            StorageAuth::Sas(_) => panic!("expected shared key"),
        }
    }

    #[test]
    fn sovereign_suffix_and_http() {
        let cs = ConnectionString::parse(
            "DefaultEndpointsProtocol=http;AccountName=acct;AccountKey=a2V5;EndpointSuffix=core.chinacloudapi.cn",
        )
        .unwrap();
        assert_eq!(cs.blob_endpoint.as_str(), "http://acct.blob.core.chinacloudapi.cn/");
    }

    #[test]
    fn sas_form() {
        let cs = ConnectionString::parse(
            "BlobEndpoint=https://acct.blob.core.windows.net/;SharedAccessSignature=?sv=2021-08-06&sig=abc%3D",
        )
        .unwrap();
        match cs.auth {
            StorageAuth::Sas(sas) => assert_eq!(sas, "sv=2021-08-06&sig=abc%3D"),
            StorageAuth::SharedKey { .. } => panic!("expected SAS"),
        }
    }

    #[test]
    fn development_storage() {
        let cs = ConnectionString::parse("UseDevelopmentStorage=true").unwrap();
        assert_eq!(
            cs.blob_endpoint.as_str(),
            "http://127.0.0.1:10000/devstoreaccount1"
        );
        assert!(matches!(
            cs.auth,
            StorageAuth::SharedKey { ref account, .. } if account == DEV_ACCOUNT_NAME
        ));
    }

    #[test]
    fn keys_are_case_insensitive() {
        let cs = ConnectionString::parse("accountname=acct;ACCOUNTKEY=a2V5").unwrap();
        assert_eq!(cs.blob_endpoint.host_str(), Some("acct.blob.core.windows.net"));
    }

    #[test]
    fn missing_pieces() {
        assert!(ConnectionString::parse("AccountKey=a2V5").is_err());
        assert!(ConnectionString::parse("AccountName=acct").is_err());
        assert!(ConnectionString::parse("AccountName=acct;AccountKey=***").is_err());
        assert!(ConnectionString::parse("garbage").is_err());
    }

    #[test]
    fn errors_do_not_leak_values() {
        let err = ConnectionString::parse("AccountName=acct;AccountKeysecretvalue")
            .err()
            .unwrap();
        assert!(!err.to_string().contains("secretvalue"));
    }
}
