//! User-facing message catalog.
//!
//! The desktop shell owns real localization; the core only needs the two
//! strings it puts into listener errors. Unknown keys echo back so a missing
//! entry is visible instead of silent.

/// Look up a user-facing message by key.
pub fn lookup(key: &str) -> &'static str {
    match key {
        "port_already_used" => "Port already in use: ",
        "failed_to_start_socket_transfer" => "Failed to start socket transfer",
        _ => "",
    }
}

/// Look up a message, falling back to the key itself when absent.
pub fn lookup_or_key(key: &str) -> String {
    let msg = lookup(key);
    if msg.is_empty() {
        key.to_string()
    } else {
        msg.to_string()
    }
}
