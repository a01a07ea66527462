//! Isolation policy rendering.
//!
//! Every tenant gets one ACL policy. It grants full access to the instance's
//! own namespace and to the space namespace, read access to the organization
//! namespace, and list access on each namespace root so consumers can
//! enumerate without reading.

use std::fmt::Write;

use crate::error::{Result, ensure_component, ensure_identifier};

const FULL: &str = r#"["create", "read", "update", "delete", "list"]"#;
const READ_ONLY: &str = r#"["read", "list"]"#;
const LIST_ONLY: &str = r#"["list"]"#;

/// Identifiers a tenant policy is scoped to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyInput<'a> {
    /// Mount prefix shared by every namespace (`cf` by default).
    pub prefix: &'a str,
    pub instance_id: &'a str,
    pub space_id: &'a str,
    pub org_id: &'a str,
    /// Optional application namespace, granted the same access as the instance.
    pub application_id: Option<&'a str>,
}

impl<'a> PolicyInput<'a> {
    pub fn new(prefix: &'a str, instance_id: &'a str, space_id: &'a str, org_id: &'a str) -> Self {
        Self {
            prefix,
            instance_id,
            space_id,
            org_id,
            application_id: None,
        }
    }

    pub fn with_application(mut self, application_id: &'a str) -> Self {
        self.application_id = Some(application_id);
        self
    }
}

/// Name of the policy (and token role) owned by an instance.
pub fn policy_name(instance_id: &str) -> String {
    format!("cf-{instance_id}")
}

/// Render the tenant policy. Output is a pure function of the input.
pub fn generate_policy(input: &PolicyInput<'_>) -> Result<String> {
    ensure_component(input.prefix, "mount prefix")?;
    ensure_identifier(input.instance_id, "instance id")?;
    ensure_identifier(input.space_id, "space id")?;
    ensure_identifier(input.org_id, "organization id")?;
    if let Some(application_id) = input.application_id {
        ensure_identifier(application_id, "application id")?;
    }

    let prefix = input.prefix.trim_matches('/');
    let mut document = String::new();
    namespace_block(&mut document, prefix, input.instance_id, FULL);
    namespace_block(&mut document, prefix, input.space_id, FULL);
    namespace_block(&mut document, prefix, input.org_id, READ_ONLY);
    if let Some(application_id) = input.application_id {
        namespace_block(&mut document, prefix, application_id, FULL);
    }
    Ok(document)
}

fn namespace_block(out: &mut String, prefix: &str, id: &str, capabilities: &str) {
    // Writing into a String cannot fail.
    let _ = write!(
        out,
        "path \"{prefix}/{id}\" {{\n  capabilities = {LIST_ONLY}\n}}\n\n\
         path \"{prefix}/{id}/*\" {{\n  capabilities = {capabilities}\n}}\n\n"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_identifiers() {
        let err = generate_policy(&PolicyInput::new("cf", "", "s", "o")).unwrap_err();
        assert_eq!(err.to_string(), "instance id must not be empty");
    }

    #[test]
    fn org_namespace_is_read_only() {
        let policy = generate_policy(&PolicyInput::new("cf", "i", "s", "o")).unwrap();
        assert!(policy.contains("path \"cf/o/*\" {\n  capabilities = [\"read\", \"list\"]\n}"));
        assert!(!policy.contains("path \"cf/o/*\" {\n  capabilities = [\"create\""));
    }
}
