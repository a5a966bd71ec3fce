//! Capability probing.
//!
//! Modern servers answer the `version` command's `optional`/`required`
//! capability query directly and reject missing required capabilities
//! themselves. Older servers only report a version string, so we synthesize
//! the capability map from a table of minimum versions and enforce the
//! `required` set client-side.

use std::collections::BTreeMap;

use crate::bser::{Object, Value};
use crate::client::ClientError;

/// Capability names to probe. `required` failures fail the check.
#[derive(Debug, Clone, Default)]
pub struct CapabilityQuery {
    pub optional: Vec<String>,
    pub required: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityCheckResult {
    pub version: String,
    pub capabilities: BTreeMap<String, bool>,
}

/// Minimum server version for each capability we know how to infer.
const CAPABILITY_VERSIONS: &[(&str, (u32, u32, u32))] = &[
    ("cmd-watch-del-all", (3, 1, 1)),
    ("cmd-watch-project", (3, 1, 0)),
    ("relative_root", (3, 3, 0)),
    ("term-dirname", (3, 1, 0)),
    ("term-idirname", (3, 1, 0)),
    ("wildmatch", (3, 7, 0)),
];

/// Build the `["version", {...}]` request for a capability query.
pub(crate) fn version_request(query: &CapabilityQuery) -> Value {
    let names = |list: &[String]| {
        Value::Array(list.iter().map(|name| Value::from(name.clone())).collect())
    };
    let mut args = Object::new();
    args.insert("optional", names(&query.optional));
    args.insert("required", names(&query.required));
    Value::Array(vec![Value::from("version"), Value::Object(args)])
}

/// Interpret a `version` response, synthesizing the capability map when the
/// server is too old to have answered the query itself.
pub(crate) fn interpret_version_response(
    response: &Value,
    query: &CapabilityQuery,
) -> Result<CapabilityCheckResult, ClientError> {
    let obj = response
        .as_object()
        .ok_or_else(|| ClientError::MalformedVersionResponse {
            reason: "response is not an object",
        })?;
    let version = obj
        .get("version")
        .and_then(Value::as_str)
        .ok_or_else(|| ClientError::MalformedVersionResponse {
            reason: "response has no version field",
        })?
        .to_string();

    let capabilities = match obj.get("capabilities").and_then(Value::as_object) {
        Some(caps) => caps
            .iter()
            .map(|(name, value)| {
                (
                    String::from_utf8_lossy(name).into_owned(),
                    value.as_bool().unwrap_or(false),
                )
            })
            .collect(),
        None => synthesize_capabilities(&version, query)?,
    };

    Ok(CapabilityCheckResult {
        version,
        capabilities,
    })
}

fn synthesize_capabilities(
    version: &str,
    query: &CapabilityQuery,
) -> Result<BTreeMap<String, bool>, ClientError> {
    let parsed = parse_version(version);
    let mut capabilities = BTreeMap::new();
    for name in query.optional.iter().chain(&query.required) {
        capabilities.insert(name.clone(), version_supports(parsed, name));
    }
    for name in &query.required {
        if !capabilities.get(name).copied().unwrap_or(false) {
            return Err(ClientError::CapabilityUnsupported {
                capability: name.clone(),
            });
        }
    }
    Ok(capabilities)
}

fn version_supports(server: (u32, u32, u32), capability: &str) -> bool {
    CAPABILITY_VERSIONS
        .iter()
        .find(|(name, _)| *name == capability)
        .is_some_and(|(_, min)| server >= *min)
}

/// First three dotted components, base-10; missing or unparsable components
/// count as 0.
fn parse_version(version: &str) -> (u32, u32, u32) {
    let mut parts = version
        .split('.')
        .map(|part| part.parse::<u32>().unwrap_or(0));
    (
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
    )
}
