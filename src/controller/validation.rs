//! Validation of TikvCluster specs.
//!
//! [`validate_cluster`] runs on every reconcile pass; a cluster that fails it
//! gets a `FailedValidation` warning event and is otherwise left alone.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use kube::ResourceExt;
use regex::Regex;

use crate::crd::{
    ANN_PD_DELETE_SLOTS, ANN_TIKV_DELETE_SLOTS, EnvVar, KeySelector, MemberType,
    ResourceRequirementsSpec, TikvCluster,
};

/// Annotations of one object may not exceed this many bytes in total.
pub const TOTAL_ANNOTATION_SIZE_LIMIT: usize = 256 * 1024;

const QUALIFIED_NAME_MAX_LENGTH: usize = 63;
const DNS1123_SUBDOMAIN_MAX_LENGTH: usize = 253;
const CONFIG_MAP_KEY_MAX_LENGTH: usize = 253;

static QUALIFIED_NAME_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^([A-Za-z0-9][-A-Za-z0-9_.]*)?[A-Za-z0-9]$").ok());

static DNS1123_SUBDOMAIN_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$").ok()
});

static C_IDENTIFIER_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").ok());

static CONFIG_MAP_KEY_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[-._a-zA-Z0-9]+$").ok());

fn matches(re: &LazyLock<Option<Regex>>, value: &str) -> bool {
    re.as_ref().is_some_and(|re| re.is_match(value))
}

/// Kind of a validation failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldErrorKind {
    Required,
    Invalid,
    TooLong,
    Forbidden,
}

/// A single validation failure at a field path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldError {
    pub kind: FieldErrorKind,
    pub field: String,
    pub value: String,
    pub detail: String,
}

impl FieldError {
    fn required(field: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind: FieldErrorKind::Required,
            field: field.into(),
            value: String::new(),
            detail: detail.into(),
        }
    }

    fn invalid(field: impl Into<String>, value: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind: FieldErrorKind::Invalid,
            field: field.into(),
            value: value.into(),
            detail: detail.into(),
        }
    }

    fn too_long(field: impl Into<String>, limit: usize) -> Self {
        Self {
            kind: FieldErrorKind::TooLong,
            field: field.into(),
            value: String::new(),
            detail: format!("must have at most {} bytes", limit),
        }
    }

    fn forbidden(field: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind: FieldErrorKind::Forbidden,
            field: field.into(),
            value: String::new(),
            detail: detail.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let head = match self.kind {
            FieldErrorKind::Required => "Required value".to_string(),
            FieldErrorKind::Invalid => format!("Invalid value: {:?}", self.value),
            FieldErrorKind::TooLong => "Too long".to_string(),
            FieldErrorKind::Forbidden => "Forbidden".to_string(),
        };
        if self.detail.is_empty() {
            write!(f, "{}: {}", self.field, head)
        } else {
            write!(f, "{}: {}: {}", self.field, head, self.detail)
        }
    }
}

/// Join errors the way they are reported in events: `[a, b]` for several.
pub fn aggregate_message(errors: &[FieldError]) -> String {
    let messages: Vec<String> = errors.iter().map(ToString::to_string).collect();
    if messages.len() == 1 {
        messages.concat()
    } else {
        format!("[{}]", messages.join(", "))
    }
}

/// Rules every reconciled cluster must satisfy.
pub fn validate_cluster(tc: &TikvCluster) -> Vec<FieldError> {
    let mut errors = Vec::new();
    errors.extend(validate_annotations(tc.annotations(), "metadata.annotations"));

    let spec = &tc.spec;
    errors.extend(validate_replicas(spec.pd.replicas, "spec.pd.replicas"));
    errors.extend(validate_replicas(spec.tikv.replicas, "spec.tikv.replicas"));
    errors.extend(validate_env(&spec.pd.component.env, "spec.pd.env"));
    errors.extend(validate_env(&spec.tikv.component.env, "spec.tikv.env"));
    errors.extend(validate_storage_request(&spec.pd.resources, "spec.pd"));
    errors.extend(validate_storage_request(&spec.tikv.resources, "spec.tikv"));
    errors.extend(validate_delete_slots(tc, MemberType::Pd));
    errors.extend(validate_delete_slots(tc, MemberType::Tikv));
    errors
}

/// Delete slots inside the running range are rejected: the StatefulSet
/// controller only runs ordinals `0..replicas`, so such a slot would drain one
/// member while a different pod is removed.
fn validate_delete_slots(tc: &TikvCluster, member_type: MemberType) -> Vec<FieldError> {
    let key = match member_type {
        MemberType::Pd => ANN_PD_DELETE_SLOTS,
        MemberType::Tikv => ANN_TIKV_DELETE_SLOTS,
    };
    let replicas = tc.sts_desired_replicas(member_type);
    tc.delete_slots(member_type)
        .into_iter()
        .filter(|&slot| slot < replicas)
        .map(|slot| {
            FieldError::invalid(
                format!("metadata.annotations[{key}]"),
                slot.to_string(),
                format!("delete slot must not be below the {member_type} replica count {replicas}"),
            )
        })
        .collect()
}

fn validate_replicas(replicas: i32, field: &str) -> Option<FieldError> {
    (replicas < 1).then(|| {
        FieldError::invalid(field, replicas.to_string(), "replicas must be at least 1")
    })
}

fn validate_storage_request(resources: &ResourceRequirementsSpec, field: &str) -> Option<FieldError> {
    match resources.storage_request() {
        Some(storage) if !storage.is_empty() => None,
        _ => Some(FieldError::required(
            format!("{}.requests.storage[storage]", field),
            "storage request must not be empty",
        )),
    }
}

/// Annotation keys must be qualified names and all annotations together
/// must fit within [`TOTAL_ANNOTATION_SIZE_LIMIT`].
pub fn validate_annotations(annotations: &BTreeMap<String, String>, field: &str) -> Vec<FieldError> {
    let mut errors = Vec::new();
    let mut total = 0usize;
    for (key, value) in annotations {
        for detail in qualified_name_errors(&key.to_lowercase()) {
            errors.push(FieldError::invalid(field, key.as_str(), detail));
        }
        total += key.len() + value.len();
    }
    if total > TOTAL_ANNOTATION_SIZE_LIMIT {
        errors.push(FieldError::too_long(field, TOTAL_ANNOTATION_SIZE_LIMIT));
    }
    errors
}

fn qualified_name_errors(value: &str) -> Vec<String> {
    let mut errors = Vec::new();
    let (prefix, name) = match value.split_once('/') {
        Some((prefix, name)) => (Some(prefix), name),
        None => (None, value),
    };
    if name.contains('/') {
        errors.push(
            "a qualified name must consist of alphanumeric characters, '-', '_' or '.', \
             with an optional DNS subdomain prefix and '/'"
                .to_string(),
        );
        return errors;
    }
    if let Some(prefix) = prefix {
        if prefix.is_empty() {
            errors.push("prefix part must be non-empty".to_string());
        } else {
            errors.extend(dns1123_subdomain_errors(prefix).into_iter().map(|e| format!("prefix part {}", e)));
        }
    }
    if name.is_empty() {
        errors.push("name part must be non-empty".to_string());
    } else if name.len() > QUALIFIED_NAME_MAX_LENGTH {
        errors.push(format!(
            "name part must be no more than {} characters",
            QUALIFIED_NAME_MAX_LENGTH
        ));
    }
    if !name.is_empty() && !matches(&QUALIFIED_NAME_RE, name) {
        errors.push(
            "name part must consist of alphanumeric characters, '-', '_' or '.', \
             and must start and end with an alphanumeric character"
                .to_string(),
        );
    }
    errors
}

fn dns1123_subdomain_errors(value: &str) -> Vec<String> {
    let mut errors = Vec::new();
    if value.len() > DNS1123_SUBDOMAIN_MAX_LENGTH {
        errors.push(format!(
            "must be no more than {} characters",
            DNS1123_SUBDOMAIN_MAX_LENGTH
        ));
    }
    if !matches(&DNS1123_SUBDOMAIN_RE, value) {
        errors.push(
            "a DNS-1123 subdomain must consist of lower case alphanumeric characters, \
             '-' or '.', and must start and end with an alphanumeric character"
                .to_string(),
        );
    }
    errors
}

fn config_map_key_errors(value: &str) -> Vec<String> {
    let mut errors = Vec::new();
    if value.len() > CONFIG_MAP_KEY_MAX_LENGTH {
        errors.push(format!(
            "must be no more than {} characters",
            CONFIG_MAP_KEY_MAX_LENGTH
        ));
    }
    if !matches(&CONFIG_MAP_KEY_RE, value) {
        errors.push(
            "a valid config key must consist of alphanumeric characters, '-', '_' or '.'".to_string(),
        );
    }
    if value == "." {
        errors.push("must not be '.'".to_string());
    } else if value == ".." {
        errors.push("must not be '..'".to_string());
    } else if value.starts_with("..") {
        errors.push("must not start with '..'".to_string());
    }
    errors
}

fn validate_env(env: &[EnvVar], field: &str) -> Vec<FieldError> {
    let mut errors = Vec::new();
    for (i, var) in env.iter().enumerate() {
        let idx_path = format!("{}[{}]", field, i);
        if var.name.is_empty() {
            errors.push(FieldError::required(format!("{}.name", idx_path), ""));
        } else if !matches(&C_IDENTIFIER_RE, &var.name) {
            errors.push(FieldError::invalid(
                format!("{}.name", idx_path),
                var.name.as_str(),
                "a valid C identifier must start with alphabetic character or '_', \
                 followed by a string of alphanumeric characters or '_'",
            ));
        }
        errors.extend(validate_env_var_value_from(var, &format!("{}.valueFrom", idx_path)));
    }
    errors
}

fn validate_env_var_value_from(var: &EnvVar, field: &str) -> Vec<FieldError> {
    let Some(source) = var.value_from.as_ref() else {
        return Vec::new();
    };
    let mut errors = Vec::new();
    let mut refs = 0;

    if source.field_ref.is_some() {
        refs += 1;
        errors.push(FieldError::invalid(
            format!("{}.fieldRef", field),
            "",
            "fieldRef is not supported",
        ));
    }
    if source.resource_field_ref.is_some() {
        refs += 1;
        errors.push(FieldError::invalid(
            format!("{}.resourceFieldRef", field),
            "",
            "resourceFieldRef is not supported",
        ));
    }
    if let Some(selector) = source.config_map_key_ref.as_ref() {
        refs += 1;
        errors.extend(validate_key_selector(selector, &format!("{}.configMapKeyRef", field)));
    }
    if let Some(selector) = source.secret_key_ref.as_ref() {
        refs += 1;
        errors.extend(validate_key_selector(selector, &format!("{}.secretKeyRef", field)));
    }

    if refs == 0 {
        errors.push(FieldError::invalid(
            field,
            "",
            "must specify one of: `configMapKeyRef` or `secretKeyRef`",
        ));
    } else if !var.value.is_empty() {
        errors.push(FieldError::invalid(
            field,
            "",
            "may not be specified when `value` is not empty",
        ));
    } else if refs > 1 {
        errors.push(FieldError::forbidden(
            field,
            "may not have more than one field specified at a time",
        ));
    }
    errors
}

fn validate_key_selector(selector: &KeySelector, field: &str) -> Vec<FieldError> {
    let mut errors = Vec::new();
    let name_field = format!("{}.name", field);
    if selector.name.is_empty() {
        errors.push(FieldError::required(name_field, ""));
    } else {
        for detail in dns1123_subdomain_errors(&selector.name) {
            errors.push(FieldError::invalid(
                name_field.as_str(),
                selector.name.as_str(),
                detail,
            ));
        }
    }
    let key_field = format!("{}.key", field);
    if selector.key.is_empty() {
        errors.push(FieldError::required(key_field, ""));
    } else {
        for detail in config_map_key_errors(&selector.key) {
            errors.push(FieldError::invalid(
                key_field.as_str(),
                selector.key.as_str(),
                detail,
            ));
        }
    }
    errors
}
