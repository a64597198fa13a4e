use std::sync::OnceLock;

use regex::Regex;
#[cfg(target_os = "linux")]
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

const PORT_PATTERNS: &[&str] = &[
    r"(?i)(?:listening|running|started|bound).*?(?:on|at).*?port\s+(\d+)",
    r"(?i)(?:listening|running|started|bound).*?port\s+(\d+)",
    r"(?i)https?://(?:localhost|127\.0\.0\.1|0\.0\.0\.0|\[::\]):(\d+)",
    r"(?i)(?:localhost|127\.0\.0\.1|0\.0\.0\.0):(\d+)(?:\s|$|/|\?|,)",
];

fn patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        PORT_PATTERNS
            .iter()
            .filter_map(|pattern| Regex::new(pattern).ok())
            .collect()
    })
}

/// Extracts a listening port from a line of server output.
///
/// Patterns are tried in order and the first capture in the unprivileged
/// range wins.
pub fn detect_port(line: &str) -> Option<u16> {
    patterns().iter().find_map(|pattern| {
        let captured = pattern.captures(line)?.get(1)?;
        captured
            .as_str()
            .parse::<u16>()
            .ok()
            .filter(|port| *port >= 1024)
    })
}

/// Listening TCP ports held by `root` or any of its descendants, root first.
///
/// Wrappers such as `npm start` rarely bind the port themselves, so the whole
/// tree is searched. Returns `None` once `root` has exited.
#[cfg(target_os = "linux")]
pub fn listening_ports(system: &mut System, root: u32) -> Option<Vec<u16>> {
    use std::collections::{HashMap, VecDeque};

    system.refresh_processes_specifics(
        ProcessesToUpdate::All,
        true,
        ProcessRefreshKind::default(),
    );
    let root = Pid::from_u32(root);
    system.process(root)?;

    let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
    for (pid, process) in system.processes() {
        if let Some(parent) = process.parent() {
            children.entry(parent).or_default().push(*pid);
        }
    }

    let listening: HashMap<u64, u16> = ["/proc/net/tcp", "/proc/net/tcp6"]
        .iter()
        .filter_map(|path| std::fs::read_to_string(path).ok())
        .flat_map(|table| parse_listen_table(&table))
        .map(|(port, inode)| (inode, port))
        .collect();

    let mut ports = Vec::new();
    let mut queue = VecDeque::from([root]);
    while let Some(pid) = queue.pop_front() {
        for inode in socket_inodes(pid.as_u32()) {
            if let Some(port) = listening.get(&inode).copied() {
                if port >= 1024 && !ports.contains(&port) {
                    ports.push(port);
                }
            }
        }
        if let Some(next) = children.get(&pid) {
            queue.extend(next.iter().copied());
        }
    }
    Some(ports)
}

/// `(port, inode)` of every socket in LISTEN state in a `/proc/net/tcp*` table.
#[cfg(target_os = "linux")]
fn parse_listen_table(table: &str) -> Vec<(u16, u64)> {
    const TCP_LISTEN: &str = "0A";

    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 10 || fields[3] != TCP_LISTEN {
                return None;
            }
            let (_, port) = fields[1].rsplit_once(':')?;
            let port = u16::from_str_radix(port, 16).ok()?;
            let inode = fields[9].parse::<u64>().ok().filter(|inode| *inode != 0)?;
            Some((port, inode))
        })
        .collect()
}

#[cfg(target_os = "linux")]
fn socket_inodes(pid: u32) -> Vec<u64> {
    let Ok(entries) = std::fs::read_dir(format!("/proc/{pid}/fd")) else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter_map(|entry| std::fs::read_link(entry.path()).ok())
        .filter_map(|target| {
            target
                .to_str()?
                .strip_prefix("socket:[")?
                .strip_suffix(']')?
                .parse::<u64>()
                .ok()
        })
        .collect()
}
