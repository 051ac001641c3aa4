// Helper functions for extracting values from KDL nodes

use kdl::KdlNode;

use crate::{ConfigError, ConfigResult};

pub(crate) fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

pub(crate) fn get_first_int_arg(node: &KdlNode) -> Option<i128> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_integer())
}

pub(crate) fn get_first_bool_arg(node: &KdlNode) -> Option<bool> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_bool())
}

/// String argument of a child node, failing if it is missing or not a string.
pub(crate) fn require_string(node: &KdlNode) -> ConfigResult<String> {
    get_first_string_arg(node).ok_or_else(|| invalid(node, "expected a string"))
}

pub(crate) fn require_bool(node: &KdlNode) -> ConfigResult<bool> {
    get_first_bool_arg(node).ok_or_else(|| invalid(node, "expected #true or #false"))
}

/// Non-negative integer argument of a child node.
pub(crate) fn require_count(node: &KdlNode) -> ConfigResult<u64> {
    let value = get_first_int_arg(node).ok_or_else(|| invalid(node, "expected an integer"))?;
    u64::try_from(value).map_err(|_| invalid(node, "must not be negative"))
}

pub(crate) fn invalid(node: &KdlNode, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: node.name().value().to_string(),
        message: message.to_string(),
    }
}
