//! Flag-value parsing: volume/port/env specs and memory-size suffixes.

use std::path::Path;

use sudocker_shared::{SudockerError, SudockerResult};

use crate::types::{PortMapping, Proto, VolumeBinding};

/// Parses a `host:container` bind-mount spec.
pub fn parse_volume(spec: &str) -> SudockerResult<VolumeBinding> {
    let (host, container) = spec
        .split_once(':')
        .ok_or_else(|| SudockerError::InvalidArgument(format!("bad volume spec: {spec}")))?;
    if host.is_empty() || container.is_empty() {
        return Err(SudockerError::InvalidArgument(format!("bad volume spec: {spec}")));
    }
    Ok(VolumeBinding {
        host_path: host.to_string(),
        container_path: container.to_string(),
    })
}

/// Parses a `hostPort:containerPort[/proto]` publish spec.
pub fn parse_port(spec: &str) -> SudockerResult<PortMapping> {
    let (ports, proto) = match spec.split_once('/') {
        Some((p, proto)) => (p, proto),
        None => (spec, "tcp"),
    };
    let (host_port, container_port) = ports
        .split_once(':')
        .ok_or_else(|| SudockerError::InvalidArgument(format!("bad port spec: {spec}")))?;

    let host_port: u16 = host_port
        .parse()
        .map_err(|_| SudockerError::InvalidArgument(format!("bad host port: {host_port}")))?;
    let container_port: u16 = container_port
        .parse()
        .map_err(|_| SudockerError::InvalidArgument(format!("bad container port: {container_port}")))?;
    let proto = match proto.to_ascii_lowercase().as_str() {
        "tcp" => Proto::Tcp,
        "udp" => Proto::Udp,
        other => return Err(SudockerError::InvalidArgument(format!("bad port protocol: {other}"))),
    };

    Ok(PortMapping { host_port, container_port, proto })
}

/// Parses a `KEY=VALUE` environment assignment.
pub fn parse_env_assignment(spec: &str) -> SudockerResult<(String, String)> {
    spec.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| SudockerError::InvalidArgument(format!("bad env assignment: {spec}")))
}

/// Parses a `--env-file`: one `KEY=VALUE` per line, blank lines and lines
/// starting with `#` ignored.
pub fn parse_env_file(path: &Path) -> SudockerResult<Vec<(String, String)>> {
    let contents = std::fs::read_to_string(path)?;
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(parse_env_assignment)
        .collect()
}

/// Parses a memory size with an optional `b`/`k`/`m`/`g` suffix
/// (case-insensitive) into bytes. `0` means "no limit".
pub fn parse_memory(spec: &str) -> SudockerResult<i64> {
    let spec = spec.trim();
    if spec == "-1" {
        return Ok(-1);
    }

    let (digits, multiplier) = match spec.chars().last() {
        Some(c) if c.eq_ignore_ascii_case(&'b') => (&spec[..spec.len() - 1], 1i64),
        Some(c) if c.eq_ignore_ascii_case(&'k') => (&spec[..spec.len() - 1], 1024),
        Some(c) if c.eq_ignore_ascii_case(&'m') => (&spec[..spec.len() - 1], 1024 * 1024),
        Some(c) if c.eq_ignore_ascii_case(&'g') => (&spec[..spec.len() - 1], 1024 * 1024 * 1024),
        _ => (spec, 1),
    };

    let value: i64 = digits
        .parse()
        .map_err(|_| SudockerError::InvalidArgument(format!("bad memory size: {spec}")))?;
    Ok(value * multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_spec_requires_both_sides() {
        assert!(parse_volume("/host:/ctr").is_ok());
        assert!(parse_volume("/host").is_err());
        assert!(parse_volume(":/ctr").is_err());
    }

    #[test]
    fn port_spec_defaults_to_tcp() {
        let p = parse_port("8080:80").unwrap();
        assert_eq!(p.host_port, 8080);
        assert_eq!(p.container_port, 80);
        assert_eq!(p.proto, Proto::Tcp);
    }

    #[test]
    fn port_spec_accepts_udp_suffix() {
        let p = parse_port("53:53/udp").unwrap();
        assert_eq!(p.proto, Proto::Udp);
    }

    #[test]
    fn memory_spec_parses_suffixes() {
        assert_eq!(parse_memory("0").unwrap(), 0);
        assert_eq!(parse_memory("64m").unwrap(), 64 * 1024 * 1024);
        assert_eq!(parse_memory("1g").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_memory("-1").unwrap(), -1);
    }

    #[test]
    fn env_assignment_requires_equals() {
        assert!(parse_env_assignment("KEY=value").is_ok());
        assert!(parse_env_assignment("KEY").is_err());
    }
}
