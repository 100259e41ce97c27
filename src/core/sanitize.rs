//! String normalisation applied before window and process descriptors are
//! looked up or stored.

/// Remove control characters and trim surrounding whitespace.
pub fn sanitize(value: &str) -> String {
    let cleaned: String = value.chars().filter(|c| !c.is_control()).collect();
    cleaned.trim().to_string()
}
