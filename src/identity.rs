use crate::config::{FieldOptions, GroupOptions, Parameters};

/// Canonical store key for a field: `workspace|layer|field|k1:v1|k2:v2...`.
///
/// Parameter names are visited in ascending order, so the same logical request
/// always yields the same key and requests differing in any parameter value
/// never collide in the store.
pub fn normalize(workspace: &str, layer: &str, field: &str, params: &Parameters) -> String {
    format!("{}|{}|{}{}", workspace, layer, field, parameter_suffix(params))
}

/// The `|k1:v1|k2:v2...` tail of an identity. Two parameter sets with the same
/// suffix address the same data.
pub fn parameter_suffix(params: &Parameters) -> String {
    let mut suffix = String::new();
    for (name, value) in params {
        suffix.push('|');
        suffix.push_str(name);
        suffix.push(':');
        suffix.push_str(&value.to_string());
    }
    suffix
}

/// Identity of `field` within `group`, using `params` as the request's parameter set.
pub fn field_identity(group: &GroupOptions, field: &FieldOptions, params: &Parameters) -> String {
    normalize(&group.workspace, &group.layer, &field.property_name, params)
}
