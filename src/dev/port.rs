use crate::config::global::PortsConfig;
use crate::error::{DevServeError, Result};
use std::net::{Ipv4Addr, TcpListener};
use tracing::{debug, info};

/// Where the session's port came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSource {
    Explicit,
    EntryOptions,
    Environment,
    Probed,
    OsAssigned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedPort {
    pub port: u16,
    pub source: PortSource,
}

fn is_port_free(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).is_ok()
}

/// First port in `base..base + count` that can be bound right now.
pub fn first_free_port(base: u16, count: u16) -> Option<u16> {
    (0..count)
        .filter_map(|offset| base.checked_add(offset))
        .find(|port| is_port_free(*port))
}

/// Ask the OS for any free port.
pub fn os_assigned_port() -> Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    Ok(listener.local_addr()?.port())
}

/// Pick the server port for a session.
///
/// Order: explicit flag, entry options, numeric `PORT` from the environment,
/// the first free port of the configured range, then any OS-assigned port.
pub fn resolve_port(
    explicit: Option<u16>,
    entry_port: Option<u16>,
    env_port: Option<&str>,
    ports: &PortsConfig,
) -> Result<ResolvedPort> {
    if let Some(port) = explicit {
        return Ok(ResolvedPort { port, source: PortSource::Explicit });
    }
    if let Some(port) = entry_port {
        return Ok(ResolvedPort { port, source: PortSource::EntryOptions });
    }
    if let Some(raw) = env_port {
        match raw.trim().parse::<u16>() {
            Ok(port) if port > 0 => {
                return Ok(ResolvedPort { port, source: PortSource::Environment });
            }
            _ => debug!("Ignoring non-numeric PORT value '{}'", raw),
        }
    }

    if let Some(port) = first_free_port(ports.base_port, ports.probe_count) {
        return Ok(ResolvedPort { port, source: PortSource::Probed });
    }

    let port = os_assigned_port().map_err(|e| {
        DevServeError::ConnectionError(format!("No free port available: {e}"))
    })?;
    info!(
        "Ports {}..{} are busy, using port {}",
        ports.base_port,
        ports.base_port.saturating_add(ports.probe_count),
        port
    );
    Ok(ResolvedPort { port, source: PortSource::OsAssigned })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ports(base_port: u16, probe_count: u16) -> PortsConfig {
        PortsConfig { base_port, probe_count }
    }

    #[test]
    fn test_explicit_port_wins() {
        let resolved = resolve_port(Some(5000), Some(6000), Some("7000"), &ports(4111, 21)).unwrap();
        assert_eq!(resolved, ResolvedPort { port: 5000, source: PortSource::Explicit });
    }

    #[test]
    fn test_entry_port_beats_environment() {
        let resolved = resolve_port(None, Some(4000), Some("5000"), &ports(4111, 21)).unwrap();
        assert_eq!(resolved.port, 4000);
        assert_eq!(resolved.source, PortSource::EntryOptions);
    }

    #[test]
    fn test_numeric_environment_port() {
        let resolved = resolve_port(None, None, Some(" 5000 "), &ports(4111, 21)).unwrap();
        assert_eq!(resolved.port, 5000);
        assert_eq!(resolved.source, PortSource::Environment);
    }

    #[test]
    fn test_non_numeric_environment_port_is_ignored() {
        let resolved = resolve_port(None, None, Some("http"), &ports(4111, 21)).unwrap();
        assert_ne!(resolved.source, PortSource::Environment);
    }

    #[test]
    fn test_probe_skips_busy_port() {
        let busy = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).unwrap();
        let busy_port = busy.local_addr().unwrap().port();

        assert_eq!(first_free_port(busy_port, 1), None);
        if let Some(port) = first_free_port(busy_port, 3) {
            assert_ne!(port, busy_port);
        }
    }

    #[test]
    fn test_falls_back_to_os_assigned_port() {
        let busy = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).unwrap();
        let busy_port = busy.local_addr().unwrap().port();

        let resolved = resolve_port(None, None, None, &ports(busy_port, 1)).unwrap();
        assert_eq!(resolved.source, PortSource::OsAssigned);
        assert_ne!(resolved.port, busy_port);
        assert_ne!(resolved.port, 0);
    }
}
