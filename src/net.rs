use std::borrow::Cow;

/// Join a host and port into something `TcpListener::bind` accepts.
///
/// Bare IPv6 hosts get bracketed; an empty host means all interfaces.
pub fn host_port(host: &str, port: u16) -> String {
    let host = host.trim();
    if host.is_empty() {
        format!("0.0.0.0:{port}")
    } else if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Normalize an address to dial.
///
/// The shorthand `":PORT"` means the local machine.
pub fn normalize_dial_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("127.0.0.1{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// A loopback port that was free a moment ago.
#[cfg(test)]
pub(crate) fn free_port() -> u16 {
    let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    l.local_addr().unwrap().port()
}
