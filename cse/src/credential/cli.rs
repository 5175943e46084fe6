use std::process::Command;

use chrono::{DateTime, Duration, Local, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;

use super::{AccessToken, TokenCredential, scope_to_resource};

/// Token from the Azure CLI's signed-in account
/// (`az account get-access-token`).
#[derive(Default)]
pub struct AzureCliCredential;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CliToken {
    access_token: String,
    /// Local time, e.g. `2024-05-01 10:20:30.000000`.
    expires_on: Option<String>,
    /// Epoch seconds; only newer CLI versions send it.
    #[serde(rename = "expires_on")]
    expires_on_epoch: Option<i64>,
}

impl CliToken {
    fn expiry(&self) -> DateTime<Utc> {
        if let Some(epoch) = self
            .expires_on_epoch
            .and_then(|s| DateTime::<Utc>::from_timestamp(s, 0))
        {
            return epoch;
        }
        self.expires_on
            .as_deref()
            .and_then(|s| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f").ok())
            .and_then(|naive| Local.from_local_datetime(&naive).single())
            .map(|local| local.with_timezone(&Utc))
            .unwrap_or_else(|| Utc::now() + Duration::minutes(5))
    }
}

fn command() -> Command {
    if cfg!(windows) {
        let mut cmd = Command::new("cmd");
        cmd.args(["/C", "az"]);
        cmd
    } else {
        Command::new("az")
    }
}

impl TokenCredential for AzureCliCredential {
    fn get_token(&self, scopes: &[&str]) -> anyhow::Result<AccessToken> {
        let [scope] = scopes else {
            anyhow::bail!("Azure CLI takes exactly one scope, got {}", scopes.len());
        };
        let output = command()
            .args(["account", "get-access-token", "--output", "json", "--resource"])
            .arg(scope_to_resource(scope))
            .output()
            .map_err(|e| anyhow::anyhow!("Azure CLI not available: {e}"))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("Azure CLI failed: {}", stderr.trim());
        }
        let token: CliToken = serde_json::from_slice(&output.stdout)?;
        let expires_on = token.expiry();
        Ok(AccessToken::new(token.access_token, expires_on))
    }
}
