use std::borrow::Cow;

/// Normalize a bind/listen address.
///
/// Config files commonly use the shorthand `":PORT"` to mean "bind on all
/// interfaces". Tokio bind APIs do not accept `":PORT"`, so it becomes
/// `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Normalize a dial address: `":PORT"` means the local host.
pub fn normalize_dial_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("127.0.0.1{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Bind address for a port opened on behalf of a tunnel client.
pub fn listen_port_addr(port: u16) -> String {
    format!("0.0.0.0:{port}")
}
