use std::{io::ErrorKind, net::TcpListener, ops::RangeInclusive};

/// A port counts as free when a listener can bind it on all interfaces.
pub fn is_port_free(port: u16) -> bool {
    match TcpListener::bind(("0.0.0.0", port)) {
        Ok(_) => true,
        Err(e) if e.kind() == ErrorKind::AddrInUse => false,
        Err(e) => {
            tracing::debug!(port, error = %e, "port probe failed");
            false
        }
    }
}

/// First free port in `range`, scanning upwards.
pub fn find_free_port(range: RangeInclusive<u16>) -> Option<u16> {
    range.into_iter().find(|&port| is_port_free(port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn found_port_can_be_bound() {
        let port = find_free_port(49152..=65535).expect("a free dynamic port");
        assert!((49152..=65535).contains(&port));
        TcpListener::bind(("0.0.0.0", port)).unwrap();
    }

    #[test]
    fn occupied_port_is_skipped() {
        let held = TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let port = held.local_addr().unwrap().port();
        assert!(!is_port_free(port));
        assert_eq!(find_free_port(port..=port), None);
    }

    #[test]
    fn empty_range_finds_nothing() {
        #[allow(clippy::reversed_empty_ranges)]
        let range = 50001..=50000;
        assert_eq!(find_free_port(range), None);
    }
}
