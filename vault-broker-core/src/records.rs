//! Durable tenant and binding records.
//!
//! Records are stored as a JSON string under the `json` key of the backend
//! data, which is also how earlier broker releases stored them. The legacy
//! field names are accepted on decode.

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backend::Data;
use crate::error::{Error, Result};

const JSON_KEY: &str = "json";

/// A provisioned namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantRecord {
    #[serde(default)]
    pub instance_id: String,
    #[serde(alias = "OrganizationGUID")]
    pub organization_id: String,
    #[serde(alias = "SpaceGUID")]
    pub space_id: String,
}

impl TenantRecord {
    pub fn new(
        instance_id: impl Into<String>,
        organization_id: impl Into<String>,
        space_id: impl Into<String>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            organization_id: organization_id.into(),
            space_id: space_id.into(),
        }
    }
}

/// One issued, renewable credential.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingRecord {
    #[serde(alias = "Binding")]
    pub binding_id: String,
    #[serde(default)]
    pub instance_id: String,
    #[serde(default, alias = "Organization")]
    pub organization_id: String,
    #[serde(default, alias = "Space")]
    pub space_id: String,
    #[serde(alias = "ClientToken")]
    pub client_token: String,
    #[serde(alias = "Accessor")]
    pub accessor: String,
    #[serde(default)]
    pub lease_duration_secs: u64,
    #[serde(default = "epoch")]
    pub issued_at: DateTime<Utc>,
    #[serde(default = "epoch")]
    pub expires_at: DateTime<Utc>,
}

fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

impl BindingRecord {
    /// Lease window starting at `issued_at`.
    pub fn lease_window(issued_at: DateTime<Utc>, lease_duration_secs: u64) -> DateTime<Utc> {
        issued_at + Duration::seconds(i64::try_from(lease_duration_secs).unwrap_or(i64::MAX / 2))
    }

    /// Record the outcome of a successful renewal at `renewed_at`.
    pub fn renewed(&self, renewed_at: DateTime<Utc>, lease_duration_secs: u64) -> Self {
        Self {
            lease_duration_secs,
            issued_at: renewed_at,
            expires_at: Self::lease_window(renewed_at, lease_duration_secs),
            ..self.clone()
        }
    }

    /// Instant at which the next renewal is due: half way through the lease.
    pub fn renewal_due(&self) -> DateTime<Utc> {
        self.issued_at + Duration::seconds(i64::try_from(self.lease_duration_secs / 2).unwrap_or(0))
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

// The client token never reaches logs.
impl std::fmt::Debug for BindingRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BindingRecord")
            .field("binding_id", &self.binding_id)
            .field("instance_id", &self.instance_id)
            .field("accessor", &self.accessor)
            .field("lease_duration_secs", &self.lease_duration_secs)
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

pub fn encode<T: Serialize>(path: &str, record: &T) -> Result<Data> {
    let json = serde_json::to_string(record).map_err(|err| Error::decode(path, err))?;
    let mut data = Data::new();
    data.insert(JSON_KEY.into(), Value::String(json));
    Ok(data)
}

pub fn decode<T: DeserializeOwned>(path: &str, data: &Data) -> Result<T> {
    let raw = data
        .get(JSON_KEY)
        .ok_or_else(|| Error::decode(path, "missing 'json' key"))?;
    let json = raw
        .as_str()
        .ok_or_else(|| Error::decode(path, format!("json data is {}, not a string", kind(raw))))?;
    serde_json::from_str(json).map_err(|err| Error::decode(path, err))
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a bool",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_legacy_binding_layout() {
        let mut data = Data::new();
        data.insert(
            "json".into(),
            json!(
                r#"{"Organization":"org","Space":"space","Binding":"b-1","ClientToken":"s.abc","Accessor":"acc"}"#
            ),
        );
        let record: BindingRecord = decode("cf/broker/i/b-1", &data).unwrap();
        assert_eq!(record.binding_id, "b-1");
        assert_eq!(record.organization_id, "org");
        assert_eq!(record.lease_duration_secs, 0);
        assert!(record.is_expired(Utc::now()));
        assert!(record.renewal_due() < Utc::now());
    }

    #[test]
    fn decodes_legacy_tenant_layout() {
        let mut data = Data::new();
        data.insert(
            "json".into(),
            json!(r#"{"OrganizationGUID":"org","SpaceGUID":"space"}"#),
        );
        let record: TenantRecord = decode("cf/broker/i", &data).unwrap();
        assert_eq!(record.organization_id, "org");
        assert_eq!(record.space_id, "space");
    }

    #[test]
    fn rejects_non_string_payload() {
        let mut data = Data::new();
        data.insert("json".into(), json!(42));
        let err = decode::<TenantRecord>("cf/broker/i", &data).unwrap_err();
        assert_eq!(
            err.to_string(),
            "failed to decode cf/broker/i: json data is a number, not a string"
        );
    }

    #[test]
    fn renewal_is_due_half_way() {
        let issued = Utc::now();
        let record = BindingRecord {
            binding_id: "b".into(),
            instance_id: "i".into(),
            organization_id: "o".into(),
            space_id: "s".into(),
            client_token: "t".into(),
            accessor: "a".into(),
            lease_duration_secs: 3600,
            issued_at: issued,
            expires_at: BindingRecord::lease_window(issued, 3600),
        };
        assert_eq!(record.renewal_due(), issued + Duration::seconds(1800));
        assert!(!format!("{record:?}").contains("\"t\""));
    }
}
