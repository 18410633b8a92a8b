//! New established TCP connections, classified by remote port.

use super::{CollectorError, CollectorKind, Scanner};
use crate::event::{SecurityEvent, Severity};
use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

const SUSPICIOUS_PORTS: &[u16] = &[4444, 5555, 6666, 1337, 31337];
const COMMON_PORTS: &[u16] = &[80, 443, 22, 21, 25, 53, 3389];

/// Remote-port classification: known RAT/backdoor ports are high, well-known
/// service ports are low, everything else is medium.
pub fn severity_for_port(port: u16) -> Severity {
    if SUSPICIOUS_PORTS.contains(&port) {
        Severity::High
    } else if COMMON_PORTS.contains(&port) {
        Severity::Low
    } else {
        Severity::Medium
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Established,
    SynSent,
    SynReceived,
    FinWait1,
    FinWait2,
    TimeWait,
    Closed,
    CloseWait,
    LastAck,
    Listen,
    Closing,
    Unknown,
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TcpState::Established => "Established",
            TcpState::SynSent => "SynSent",
            TcpState::SynReceived => "SynReceived",
            TcpState::FinWait1 => "FinWait1",
            TcpState::FinWait2 => "FinWait2",
            TcpState::TimeWait => "TimeWait",
            TcpState::Closed => "Closed",
            TcpState::CloseWait => "CloseWait",
            TcpState::LastAck => "LastAck",
            TcpState::Listen => "Listen",
            TcpState::Closing => "Closing",
            TcpState::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpConnection {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub state: TcpState,
}

impl TcpConnection {
    fn key(&self) -> String {
        format!("{}-{}", self.local, self.remote)
    }
}

/// Where the TCP table comes from.
pub trait ConnectionSource: Send + 'static {
    fn tcp_connections(&mut self) -> Result<Vec<TcpConnection>, CollectorError>;
}

/// The host's TCP table.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemConnections;

impl ConnectionSource for SystemConnections {
    #[cfg(target_os = "linux")]
    fn tcp_connections(&mut self) -> Result<Vec<TcpConnection>, CollectorError> {
        let mut conns = Vec::new();
        for (path, v6) in [("/proc/net/tcp", false), ("/proc/net/tcp6", true)] {
            match std::fs::read_to_string(path) {
                Ok(contents) => conns.extend(parse_proc_net_tcp(&contents, v6)),
                // tcp6 is absent when IPv6 is disabled
                Err(e) if v6 && e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(CollectorError::Source {
                        what: path.to_string(),
                        reason: e.to_string(),
                    })
                }
            }
        }
        Ok(conns)
    }

    #[cfg(windows)]
    fn tcp_connections(&mut self) -> Result<Vec<TcpConnection>, CollectorError> {
        windows_tcp::tcp_table()
    }

    #[cfg(not(any(target_os = "linux", windows)))]
    fn tcp_connections(&mut self) -> Result<Vec<TcpConnection>, CollectorError> {
        Err(CollectorError::Unsupported("TCP table"))
    }
}

/// Parses the kernel's `/proc/net/tcp` (or `tcp6`) table. Malformed rows are skipped.
pub fn parse_proc_net_tcp(contents: &str, v6: bool) -> Vec<TcpConnection> {
    contents
        .lines()
        .skip(1)
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            let _slot = cols.next()?;
            let local = parse_proc_endpoint(cols.next()?, v6)?;
            let remote = parse_proc_endpoint(cols.next()?, v6)?;
            let state = u8::from_str_radix(cols.next()?, 16).ok()?;
            Some(TcpConnection {
                local,
                remote,
                state: proc_state(state),
            })
        })
        .collect()
}

fn parse_proc_endpoint(field: &str, v6: bool) -> Option<SocketAddr> {
    let (addr, port) = field.split_once(':')?;
    let port = u16::from_str_radix(port, 16).ok()?;
    // Each 32-bit word is printed in host byte order.
    let ip = if v6 {
        if addr.len() != 32 {
            return None;
        }
        let mut octets = [0u8; 16];
        for (i, chunk) in octets.chunks_mut(4).enumerate() {
            let word = u32::from_str_radix(addr.get(i * 8..i * 8 + 8)?, 16).ok()?;
            chunk.copy_from_slice(&word.to_ne_bytes());
        }
        IpAddr::V6(Ipv6Addr::from(octets))
    } else {
        if addr.len() != 8 {
            return None;
        }
        let word = u32::from_str_radix(addr, 16).ok()?;
        IpAddr::V4(Ipv4Addr::from(word.to_ne_bytes()))
    };
    Some(SocketAddr::new(ip, port))
}

fn proc_state(code: u8) -> TcpState {
    match code {
        0x01 => TcpState::Established,
        0x02 => TcpState::SynSent,
        0x03 => TcpState::SynReceived,
        0x04 => TcpState::FinWait1,
        0x05 => TcpState::FinWait2,
        0x06 => TcpState::TimeWait,
        0x07 => TcpState::Closed,
        0x08 => TcpState::CloseWait,
        0x09 => TcpState::LastAck,
        0x0A => TcpState::Listen,
        0x0B => TcpState::Closing,
        _ => TcpState::Unknown,
    }
}

#[cfg(windows)]
mod windows_tcp {
    use super::{TcpConnection, TcpState};
    use crate::collectors::CollectorError;
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
    use windows::Win32::Foundation::{ERROR_INSUFFICIENT_BUFFER, FALSE, NO_ERROR};
    use windows::Win32::NetworkManagement::IpHelper::{
        GetExtendedTcpTable, MIB_TCP6ROW_OWNER_PID, MIB_TCP6TABLE_OWNER_PID,
        MIB_TCPROW_OWNER_PID, MIB_TCPTABLE_OWNER_PID, TCP_TABLE_OWNER_PID_ALL,
    };
    use windows::Win32::Networking::WinSock::{AF_INET, AF_INET6};

    /// IPv4 rows followed by IPv6 rows.
    pub(super) fn tcp_table() -> Result<Vec<TcpConnection>, CollectorError> {
        let mut conns = ipv4_table()?;
        conns.extend(ipv6_table()?);
        Ok(conns)
    }

    fn ipv4_table() -> Result<Vec<TcpConnection>, CollectorError> {
        let buf = fetch(AF_INET.0 as u32)?;
        // SAFETY: on success the buffer starts with a MIB_TCPTABLE_OWNER_PID
        // followed by `dwNumEntries` rows.
        let rows: &[MIB_TCPROW_OWNER_PID] = unsafe {
            let table = &*(buf.as_ptr() as *const MIB_TCPTABLE_OWNER_PID);
            std::slice::from_raw_parts(table.table.as_ptr(), table.dwNumEntries as usize)
        };
        Ok(rows
            .iter()
            .map(|row| TcpConnection {
                local: v4_endpoint(row.dwLocalAddr, row.dwLocalPort),
                remote: v4_endpoint(row.dwRemoteAddr, row.dwRemotePort),
                state: mib_state(row.dwState),
            })
            .collect())
    }

    fn ipv6_table() -> Result<Vec<TcpConnection>, CollectorError> {
        let buf = fetch(AF_INET6.0 as u32)?;
        // SAFETY: as above, with MIB_TCP6TABLE_OWNER_PID rows.
        let rows: &[MIB_TCP6ROW_OWNER_PID] = unsafe {
            let table = &*(buf.as_ptr() as *const MIB_TCP6TABLE_OWNER_PID);
            std::slice::from_raw_parts(table.table.as_ptr(), table.dwNumEntries as usize)
        };
        Ok(rows
            .iter()
            .map(|row| TcpConnection {
                local: v6_endpoint(row.ucLocalAddr, row.dwLocalPort),
                remote: v6_endpoint(row.ucRemoteAddr, row.dwRemotePort),
                state: mib_state(row.dwState),
            })
            .collect())
    }

    /// Raw table for one address family. The `u64` backing keeps the header aligned.
    fn fetch(family: u32) -> Result<Vec<u64>, CollectorError> {
        let mut size: u32 = 0;
        // SAFETY: a null table pointer asks only for the required size.
        let rc = unsafe {
            GetExtendedTcpTable(None, &mut size, FALSE, family, TCP_TABLE_OWNER_PID_ALL, 0)
        };
        if rc != ERROR_INSUFFICIENT_BUFFER.0 && rc != NO_ERROR.0 {
            return Err(table_error(rc));
        }

        let mut buf = vec![0u64; (size as usize / 8) + 1];
        // SAFETY: `buf` holds at least `size` writable bytes.
        let rc = unsafe {
            GetExtendedTcpTable(
                Some(buf.as_mut_ptr().cast()),
                &mut size,
                FALSE,
                family,
                TCP_TABLE_OWNER_PID_ALL,
                0,
            )
        };
        if rc != NO_ERROR.0 {
            return Err(table_error(rc));
        }
        Ok(buf)
    }

    // Addresses are in network order as laid out in memory; ports are the low
    // 16 bits in network order.
    fn v4_endpoint(addr: u32, port: u32) -> SocketAddr {
        let ip = Ipv4Addr::from(addr.to_ne_bytes());
        SocketAddr::new(IpAddr::V4(ip), u16::from_be(port as u16))
    }

    fn v6_endpoint(addr: [u8; 16], port: u32) -> SocketAddr {
        SocketAddr::new(IpAddr::V6(Ipv6Addr::from(addr)), u16::from_be(port as u16))
    }

    fn mib_state(state: u32) -> TcpState {
        match state {
            1 => TcpState::Closed,
            2 => TcpState::Listen,
            3 => TcpState::SynSent,
            4 => TcpState::SynReceived,
            5 => TcpState::Established,
            6 => TcpState::FinWait1,
            7 => TcpState::FinWait2,
            8 => TcpState::CloseWait,
            9 => TcpState::Closing,
            10 => TcpState::LastAck,
            11 => TcpState::TimeWait,
            _ => TcpState::Unknown,
        }
    }

    fn table_error(rc: u32) -> CollectorError {
        CollectorError::Source {
            what: "TCP table".to_string(),
            reason: format!("GetExtendedTcpTable returned {}", rc),
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn both_families_are_listed() {
            let v4 = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            let v6 = match std::net::TcpListener::bind("[::1]:0") {
                Ok(l) => l,
                // IPv6 disabled on this host
                Err(_) => return,
            };
            let conns = tcp_table().unwrap();
            for addr in [v4.local_addr().unwrap(), v6.local_addr().unwrap()] {
                assert!(
                    conns.iter().any(|c| c.local == addr && c.state == TcpState::Listen),
                    "{} missing from the TCP table",
                    addr
                );
            }
        }

        #[test]
        fn v6_endpoint_decodes_network_order_port() {
            let mut addr = [0u8; 16];
            addr[15] = 1;
            let port = u32::from(8080u16.to_be());
            assert_eq!(v6_endpoint(addr, port), "[::1]:8080".parse::<SocketAddr>().unwrap());
        }
    }
}

/// Emits `network_connection` the first time an established (local, remote)
/// pair is seen. Closed connections are not reported.
pub struct NetworkConnectionScanner<S> {
    source: S,
    tracked: HashSet<String>,
}

impl<S: ConnectionSource> NetworkConnectionScanner<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            tracked: HashSet::new(),
        }
    }
}

impl<S: ConnectionSource> Scanner for NetworkConnectionScanner<S> {
    fn kind(&self) -> CollectorKind {
        CollectorKind::NetworkMonitor
    }

    fn scan(&mut self) -> Result<Vec<SecurityEvent>, CollectorError> {
        let conns = self.source.tcp_connections()?;
        let mut current = HashSet::with_capacity(conns.len());
        let mut events = Vec::new();

        for conn in conns
            .iter()
            .filter(|c| c.state == TcpState::Established)
        {
            let key = conn.key();
            if !self.tracked.contains(&key) && !current.contains(&key) {
                events.push(connection_event(conn));
            }
            current.insert(key);
        }

        self.tracked = current;
        Ok(events)
    }
}

fn connection_event(conn: &TcpConnection) -> SecurityEvent {
    SecurityEvent::new("network_connection", severity_for_port(conn.remote.port()))
        .with_detail("direction", "established")
        .with_detail("protocol", "tcp")
        .with_detail("local_address", conn.local.ip().to_string())
        .with_detail("local_port", conn.local.port())
        .with_detail("remote_address", conn.remote.ip().to_string())
        .with_detail("remote_port", conn.remote.port())
        .with_detail("state", conn.state.to_string())
}
