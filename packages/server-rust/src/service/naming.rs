//! Method name formatting and `service_method` reference parsing.

/// Separator between the service and method parts of a method reference.
pub const SERVICE_METHOD_SEPARATOR: char = '_';

/// Formats a declared method name into its wire form by lower-casing the
/// first character (`EchoWithCtx` -> `echoWithCtx`).
#[must_use]
pub fn format_name(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Splits `service_method` on the first separator.
///
/// Returns `None` when there is no separator or either side is empty.
#[must_use]
pub fn split_method_ref(reference: &str) -> Option<(&str, &str)> {
    let (service, method) = reference.split_once(SERVICE_METHOD_SEPARATOR)?;
    if service.is_empty() || method.is_empty() {
        return None;
    }
    Some((service, method))
}
