//! Node address namespacing.
//!
//! The controller sees one flat address space shared by every worker. Each
//! worker only knows its own local addresses, so the manager prefixes them
//! with `<worker_id>_` on the way up and strips the prefix on the way down.
//! Worker ids are restricted to ASCII alphanumerics, which keeps the prefix
//! unambiguous: no global address can carry two different worker prefixes.

/// Separator between the worker id and the local address.
pub const SEPARATOR: char = '_';

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("address `{address}` does not belong to worker `{worker_id}`")]
    Mismatch { worker_id: String, address: String },

    #[error("invalid worker id `{0}`: must be non-empty ASCII alphanumerics")]
    InvalidWorkerId(String),
}

/// Check that a worker id can serve as an address prefix.
pub fn validate_worker_id(worker_id: &str) -> Result<(), AddressError> {
    if worker_id.is_empty() || !worker_id.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(AddressError::InvalidWorkerId(worker_id.to_string()));
    }
    Ok(())
}

/// Global → local. Fails if `global` does not carry `worker_id`'s prefix.
pub fn to_local(worker_id: &str, global: &str) -> Result<String, AddressError> {
    global
        .strip_prefix(worker_id)
        .and_then(|rest| rest.strip_prefix(SEPARATOR))
        .map(str::to_string)
        .ok_or_else(|| AddressError::Mismatch {
            worker_id: worker_id.to_string(),
            address: global.to_string(),
        })
}

/// Local → global.
pub fn to_global(worker_id: &str, local: &str) -> String {
    format!("{worker_id}{SEPARATOR}{local}")
}
