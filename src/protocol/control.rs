//! Control and admission messages
//!
//! Commands are parsed once, at the protocol boundary, into [`Command`]. The
//! coordinator answers every command with one [`Reply`] datagram:
//!
//! ```text
//! member|<index>|<disk>|<ip>|<cport>|<mport>     (group-bearing replies)
//! file|<name>|<size>|<owner>                     (catalog listings)
//! OK|<tag>|key=value|...                         (summary, always last)
//! ```
//!
//! or a single `ERR|<code>|<detail>` line.

use super::{fields, parse_name, parse_num};
use crate::erasure::StripeLayout;
use crate::{Error, Result};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// Name, address and ports a disk or user registers with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub name: String,
    pub ip: IpAddr,
    /// Control (management) port
    pub mport: u16,
    /// Data (client) port
    pub cport: u16,
}

impl Registration {
    pub fn new(name: impl Into<String>, ip: IpAddr, mport: u16, cport: u16) -> Self {
        Self {
            name: name.into(),
            ip,
            mport,
            cport,
        }
    }

    fn from_fields(f: &[&str]) -> Result<Self> {
        let name = parse_name(f[0], "name")?;
        let ip: IpAddr = parse_num(f[1], "ip")?;
        let mport: u16 = parse_num(f[2], "mport")?;
        let cport: u16 = parse_num(f[3], "cport")?;
        if mport == 0 || cport == 0 {
            return Err(Error::InvalidArguments("ports must be non-zero".into()));
        }
        Ok(Self {
            name,
            ip,
            mport,
            cport,
        })
    }
}

/// A coordinator request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    RegisterUser(Registration),
    RegisterDisk(Registration),
    ConfigureDss {
        name: String,
        members: usize,
        stripe_size: usize,
    },
    /// Group listing; the catalog is paged starting at file index `from`
    GetDss {
        name: String,
        from: usize,
    },
    Copy {
        file: String,
        size: u64,
        owner: String,
        dss: String,
    },
    CopyComplete {
        dss: String,
        file: String,
        owner: String,
        size: u64,
    },
    Read {
        dss: String,
        file: String,
        user: String,
    },
    ReadComplete {
        dss: String,
        token: Option<u64>,
    },
    DiskFailure {
        dss: String,
    },
    RecoveryComplete {
        dss: String,
    },
    DeregisterUser {
        name: String,
    },
    DeregisterDisk {
        name: String,
    },
    DecommissionDss {
        name: String,
    },
}

impl Command {
    /// The command word as it appears on the wire
    pub fn verb(&self) -> &'static str {
        match self {
            Command::RegisterUser(_) => "register-user",
            Command::RegisterDisk(_) => "register-disk",
            Command::ConfigureDss { .. } => "configure-dss",
            Command::GetDss { .. } => "get-dss",
            Command::Copy { .. } => "copy",
            Command::CopyComplete { .. } => "copy-complete",
            Command::Read { .. } => "read",
            Command::ReadComplete { .. } => "read-complete",
            Command::DiskFailure { .. } => "disk-failure",
            Command::RecoveryComplete { .. } => "recovery-complete",
            Command::DeregisterUser { .. } => "deregister-user",
            Command::DeregisterDisk { .. } => "deregister-disk",
            Command::DecommissionDss { .. } => "decommission-dss",
        }
    }

    /// Whether the command never changes coordinator state
    pub fn is_query(&self) -> bool {
        matches!(self, Command::GetDss { .. })
    }

    /// Whether the command opens or closes a multi-step operation that a
    /// client workflow has to drive to completion
    pub fn is_admission(&self) -> bool {
        matches!(
            self,
            Command::Copy { .. }
                | Command::CopyComplete { .. }
                | Command::Read { .. }
                | Command::ReadComplete { .. }
                | Command::DiskFailure { .. }
                | Command::RecoveryComplete { .. }
        )
    }
}

impl FromStr for Command {
    type Err = Error;

    fn from_str(line: &str) -> Result<Self> {
        let line = line.trim();
        let verb = line.split('|').next().unwrap_or_default();

        let command = match verb {
            "register-user" => {
                let f = fields(line, 5, "register-user|name|ip|mport|cport")?;
                Command::RegisterUser(Registration::from_fields(&f[1..])?)
            }
            "register-disk" => {
                let f = fields(line, 5, "register-disk|name|ip|mport|cport")?;
                Command::RegisterDisk(Registration::from_fields(&f[1..])?)
            }
            "configure-dss" => {
                let f = fields(line, 4, "configure-dss|name|n|stripeSize")?;
                Command::ConfigureDss {
                    name: parse_name(f[1], "dss")?,
                    members: parse_num(f[2], "n")?,
                    stripe_size: parse_num(f[3], "stripe size")?,
                }
            }
            "get-dss" => {
                let f: Vec<&str> = line.split('|').collect();
                let from = match f.len() {
                    2 => 0,
                    3 => parse_num(f[2], "catalog offset")?,
                    _ => return Err(Error::InvalidArguments("usage: get-dss|name[|from]".into())),
                };
                Command::GetDss {
                    name: parse_name(f[1], "dss")?,
                    from,
                }
            }
            "copy" => {
                let f = fields(line, 5, "copy|file|size|owner|dss")?;
                Command::Copy {
                    file: parse_name(f[1], "file")?,
                    size: parse_num(f[2], "size")?,
                    owner: parse_name(f[3], "owner")?,
                    dss: parse_name(f[4], "dss")?,
                }
            }
            "copy-complete" => {
                let f = fields(line, 5, "copy-complete|dss|file|owner|size")?;
                Command::CopyComplete {
                    dss: parse_name(f[1], "dss")?,
                    file: parse_name(f[2], "file")?,
                    owner: parse_name(f[3], "owner")?,
                    size: parse_num(f[4], "size")?,
                }
            }
            "read" => {
                let f = fields(line, 4, "read|dss|file|user")?;
                Command::Read {
                    dss: parse_name(f[1], "dss")?,
                    file: parse_name(f[2], "file")?,
                    user: parse_name(f[3], "user")?,
                }
            }
            "read-complete" => {
                let f: Vec<&str> = line.split('|').collect();
                let token = match f.len() {
                    2 => None,
                    3 => Some(parse_num(f[2], "read token")?),
                    _ => {
                        return Err(Error::InvalidArguments(
                            "usage: read-complete|dss[|token]".into(),
                        ))
                    }
                };
                Command::ReadComplete {
                    dss: parse_name(f[1], "dss")?,
                    token,
                }
            }
            "disk-failure" => {
                let f = fields(line, 2, "disk-failure|dss")?;
                Command::DiskFailure {
                    dss: parse_name(f[1], "dss")?,
                }
            }
            "recovery-complete" => {
                let f = fields(line, 2, "recovery-complete|dss")?;
                Command::RecoveryComplete {
                    dss: parse_name(f[1], "dss")?,
                }
            }
            "deregister-user" => {
                let f = fields(line, 2, "deregister-user|name")?;
                Command::DeregisterUser {
                    name: parse_name(f[1], "user")?,
                }
            }
            "deregister-disk" => {
                let f = fields(line, 2, "deregister-disk|name")?;
                Command::DeregisterDisk {
                    name: parse_name(f[1], "disk")?,
                }
            }
            "decommission-dss" => {
                let f = fields(line, 2, "decommission-dss|name")?;
                Command::DecommissionDss {
                    name: parse_name(f[1], "dss")?,
                }
            }
            "" => return Err(Error::InvalidArguments("empty command".into())),
            other => {
                return Err(Error::InvalidArguments(format!(
                    "unknown command {:?}",
                    other
                )))
            }
        };
        Ok(command)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = self.verb();
        match self {
            Command::RegisterUser(r) | Command::RegisterDisk(r) => {
                write!(f, "{}|{}|{}|{}|{}", verb, r.name, r.ip, r.mport, r.cport)
            }
            Command::ConfigureDss {
                name,
                members,
                stripe_size,
            } => write!(f, "{}|{}|{}|{}", verb, name, members, stripe_size),
            Command::Copy {
                file,
                size,
                owner,
                dss,
            } => write!(f, "{}|{}|{}|{}|{}", verb, file, size, owner, dss),
            Command::CopyComplete {
                dss,
                file,
                owner,
                size,
            } => write!(f, "{}|{}|{}|{}|{}", verb, dss, file, owner, size),
            Command::Read { dss, file, user } => write!(f, "{}|{}|{}|{}", verb, dss, file, user),
            Command::ReadComplete { dss, token } => match token {
                Some(token) => write!(f, "{}|{}|{}", verb, dss, token),
                None => write!(f, "{}|{}", verb, dss),
            },
            Command::GetDss { name, from } if *from > 0 => write!(f, "{}|{}|{}", verb, name, from),
            Command::GetDss { name, .. }
            | Command::DeregisterUser { name }
            | Command::DeregisterDisk { name }
            | Command::DecommissionDss { name } => write!(f, "{}|{}", verb, name),
            Command::DiskFailure { dss } | Command::RecoveryComplete { dss } => {
                write!(f, "{}|{}", verb, dss)
            }
        }
    }
}

/// One member of a storage group, as handed to clients
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub index: usize,
    pub disk: String,
    pub ip: IpAddr,
    pub cport: u16,
    pub mport: u16,
}

impl Member {
    /// Where the member's block store listens
    pub fn data_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.cport)
    }

    /// Where the member's control loop listens
    pub fn control_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.mport)
    }
}

/// A file recorded in a storage group's catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
    pub owner: String,
}

/// A storage group as seen by a client: ordered members and geometry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupView {
    pub name: String,
    pub stripe_size: usize,
    pub members: Vec<Member>,
    pub files: Vec<FileEntry>,
}

impl GroupView {
    pub fn layout(&self) -> Result<StripeLayout> {
        StripeLayout::new(self.members.len(), self.stripe_size)
    }

    pub fn file(&self, name: &str) -> Option<&FileEntry> {
        self.files.iter().find(|f| f.name == name)
    }
}

/// A successful coordinator reply
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply {
    pub tag: String,
    pub fields: Vec<(String, String)>,
    pub members: Vec<Member>,
    pub files: Vec<FileEntry>,
}

impl Reply {
    pub fn ok(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..Self::default()
        }
    }

    /// Reply carrying a group's member list and catalog
    pub fn group(tag: impl Into<String>, view: GroupView) -> Self {
        Self {
            tag: tag.into(),
            fields: vec![
                ("dss".into(), view.name),
                ("n".into(), view.members.len().to_string()),
                ("b".into(), view.stripe_size.to_string()),
            ],
            members: view.members,
            files: view.files,
        }
    }

    /// Append catalog entries from `files[from..]` while the rendered reply
    /// stays within `budget` bytes; announces `files=` and, when entries
    /// remain, `next=` with the index to continue from
    pub fn with_catalog_page(mut self, files: &[FileEntry], from: usize, budget: usize) -> Self {
        let mut used = self.render().len() + 32;
        let mut next = from;
        for file in files.iter().skip(from) {
            let line = file_line(file).len();
            if used + line > budget && next > from {
                break;
            }
            used += line;
            self.files.push(file.clone());
            next += 1;
        }
        self = self.with("files", files.len());
        if next < files.len() {
            self = self.with("next", next);
        }
        self
    }

    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.fields.push((key.to_string(), value.to_string()));
        self
    }

    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// A required summary field, parsed
    pub fn parsed<T: FromStr>(&self, key: &str) -> Result<T> {
        let value = self
            .field(key)
            .ok_or_else(|| Error::Protocol(format!("{} reply lacks {}", self.tag, key)))?;
        value
            .parse()
            .map_err(|_| Error::Protocol(format!("bad {} in {} reply: {:?}", key, self.tag, value)))
    }

    /// Rebuild the group view carried by a group-bearing reply
    pub fn group_view(&self) -> Result<GroupView> {
        let name = self
            .field("dss")
            .ok_or_else(|| Error::Protocol(format!("{} reply lacks dss", self.tag)))?
            .to_string();
        let n: usize = self.parsed("n")?;
        if n != self.members.len() {
            return Err(Error::Protocol(format!(
                "reply announces {} members but lists {}",
                n,
                self.members.len()
            )));
        }
        let mut members = self.members.clone();
        members.sort_by_key(|m| m.index);
        if members.iter().enumerate().any(|(i, m)| m.index != i) {
            return Err(Error::Protocol("member indices are not 0..n".into()));
        }
        Ok(GroupView {
            name,
            stripe_size: self.parsed("b")?,
            members,
            files: self.files.clone(),
        })
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for m in &self.members {
            out.push_str(&format!(
                "member|{}|{}|{}|{}|{}\n",
                m.index, m.disk, m.ip, m.cport, m.mport
            ));
        }
        for file in &self.files {
            out.push_str(&file_line(file));
        }
        out.push_str("OK|");
        out.push_str(&self.tag);
        for (k, v) in &self.fields {
            out.push_str(&format!("|{}={}", k, v));
        }
        out.push('\n');
        out
    }

    pub fn render_error(err: &Error) -> String {
        let detail = err.detail().replace(['\n', '\r'], " ");
        format!("ERR|{}|{}\n", err.code(), detail)
    }

    /// Parse a reply datagram; `ERR` lines come back as typed errors
    pub fn parse(text: &str) -> Result<Reply> {
        let mut reply = Reply::default();
        let mut summary = false;

        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let (kind, rest) = line.split_once('|').unwrap_or((line, ""));
            match kind {
                "member" => reply.members.push(parse_member(rest)?),
                "file" => reply.files.push(parse_file(rest)?),
                "OK" => {
                    let mut parts = rest.split('|');
                    reply.tag = parts.next().unwrap_or_default().to_string();
                    for part in parts {
                        let (k, v) = part.split_once('=').ok_or_else(|| {
                            Error::Protocol(format!("summary field without '=': {:?}", part))
                        })?;
                        reply.fields.push((k.to_string(), v.to_string()));
                    }
                    summary = true;
                }
                "ERR" => {
                    let (code, detail) = rest.split_once('|').unwrap_or((rest, ""));
                    return Err(Error::from_wire(code, detail));
                }
                other => {
                    return Err(Error::Protocol(format!("unexpected reply line {:?}", other)))
                }
            }
        }

        if !summary {
            return Err(Error::Protocol("reply without status line".into()));
        }
        Ok(reply)
    }
}

fn file_line(file: &FileEntry) -> String {
    format!("file|{}|{}|{}\n", file.name, file.size, file.owner)
}

fn parse_member(rest: &str) -> Result<Member> {
    let f: Vec<&str> = rest.split('|').collect();
    if f.len() != 5 {
        return Err(Error::Protocol(format!("bad member line {:?}", rest)));
    }
    let bad = |_| Error::Protocol(format!("bad member line {:?}", rest));
    Ok(Member {
        index: parse_num(f[0], "member index").map_err(bad)?,
        disk: f[1].to_string(),
        ip: parse_num(f[2], "member ip").map_err(bad)?,
        cport: parse_num(f[3], "member cport").map_err(bad)?,
        mport: parse_num(f[4], "member mport").map_err(bad)?,
    })
}

fn parse_file(rest: &str) -> Result<FileEntry> {
    let f: Vec<&str> = rest.split('|').collect();
    if f.len() != 3 {
        return Err(Error::Protocol(format!("bad file line {:?}", rest)));
    }
    Ok(FileEntry {
        name: f[0].to_string(),
        size: parse_num(f[1], "file size")
            .map_err(|_| Error::Protocol(format!("bad file line {:?}", rest)))?,
        owner: f[2].to_string(),
    })
}

/// Commands accepted on a storage node's control port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeCommand {
    /// Erase every block (failure simulation)
    Fail,
    /// Report block count and bytes held
    Status,
}

impl FromStr for NodeCommand {
    type Err = Error;

    fn from_str(line: &str) -> Result<Self> {
        match line.trim() {
            "fail" => Ok(NodeCommand::Fail),
            "status" => Ok(NodeCommand::Status),
            other => Err(Error::InvalidArguments(format!(
                "unknown node command {:?}",
                other
            ))),
        }
    }
}

impl fmt::Display for NodeCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeCommand::Fail => write!(f, "fail"),
            NodeCommand::Status => write!(f, "status"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(index: usize, disk: &str, port: u16) -> Member {
        Member {
            index,
            disk: disk.to_string(),
            ip: "127.0.0.1".parse().unwrap(),
            cport: port,
            mport: port + 100,
        }
    }

    #[test]
    fn test_parse_every_command() {
        let lines = [
            "register-user|U1|127.0.0.1|5001|5002",
            "register-disk|D1|10.0.0.7|6001|6002",
            "configure-dss|G|4|512",
            "get-dss|G",
            "get-dss|G|40",
            "copy|f|2048|U1|G",
            "copy-complete|G|f|U1|2048",
            "read|G|f|U1",
            "read-complete|G",
            "read-complete|G|7",
            "disk-failure|G",
            "recovery-complete|G",
            "deregister-user|U1",
            "deregister-disk|D1",
            "decommission-dss|G",
        ];
        for line in lines {
            let command: Command = line.parse().unwrap();
            assert_eq!(command.to_string(), line);
        }
    }

    #[test]
    fn test_parse_typed_fields() {
        let command: Command = "copy|f|2048|U1|G\n".parse().unwrap();
        assert_eq!(
            command,
            Command::Copy {
                file: "f".into(),
                size: 2048,
                owner: "U1".into(),
                dss: "G".into(),
            }
        );
    }

    #[test]
    fn test_malformed_commands_are_invalid_arguments() {
        for line in [
            "",
            "register-user|U1|127.0.0.1|5001",
            "register-user|U1|not-an-ip|5001|5002",
            "register-disk|D1|127.0.0.1|0|5002",
            "configure-dss|G|four|512",
            "read-complete|G|1|2",
            "REGISTER USER U1 127.0.0.1 5001 5002",
            "frobnicate|x",
        ] {
            let err = line.parse::<Command>().unwrap_err();
            assert!(
                matches!(err, Error::InvalidArguments(_)),
                "{:?} gave {:?}",
                line,
                err
            );
        }
    }

    #[test]
    fn test_group_reply_lists_members_then_summary() {
        let view = GroupView {
            name: "G".into(),
            stripe_size: 512,
            members: vec![member(0, "D1", 7001), member(1, "D2", 7002), member(2, "D3", 7003)],
            files: vec![],
        };
        let text = Reply::group("copy", view.clone()).with("size", 2048).render();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "member|0|D1|127.0.0.1|7001|7101");
        assert_eq!(lines[3], "OK|copy|dss=G|n=3|b=512|size=2048");

        let parsed = Reply::parse(&text).unwrap();
        assert_eq!(parsed.group_view().unwrap(), view);
        assert_eq!(parsed.parsed::<u64>("size").unwrap(), 2048);
    }

    #[test]
    fn test_error_reply_parses_to_typed_error() {
        let text = Reply::render_error(&Error::InsufficientDisks { need: 5, have: 3 });
        assert_eq!(text, "ERR|insufficient-disks|need=5|have=3\n");
        let err = Reply::parse(&text).unwrap_err();
        assert!(matches!(err, Error::InsufficientDisks { need: 5, have: 3 }));
    }

    #[test]
    fn test_reply_without_status_is_protocol_error() {
        let err = Reply::parse("member|0|D1|127.0.0.1|1|2\n").unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_file_lines_round_trip() {
        let mut reply = Reply::ok("get-dss").with("dss", "G");
        reply.files.push(FileEntry {
            name: "f".into(),
            size: 10,
            owner: "U1".into(),
        });
        let parsed = Reply::parse(&reply.render()).unwrap();
        assert_eq!(parsed.files, reply.files);
        assert_eq!(parsed.field("dss"), Some("G"));
    }

    #[test]
    fn test_catalog_is_paged_within_budget() {
        let files: Vec<FileEntry> = (0..100)
            .map(|i| FileEntry {
                name: format!("file-{:03}", i),
                size: i,
                owner: "U1".into(),
            })
            .collect();

        let first = Reply::ok("get-dss").with_catalog_page(&files, 0, 1024);
        assert!(first.render().len() <= 1024);
        let next: usize = first.parsed("next").unwrap();
        assert_eq!(first.files.len(), next);
        assert_eq!(first.parsed::<usize>("files").unwrap(), 100);

        let mut seen = first.files.clone();
        let mut from = next;
        loop {
            let page = Reply::ok("get-dss").with_catalog_page(&files, from, 1024);
            seen.extend(page.files.clone());
            match page.field("next") {
                Some(_) => from = page.parsed("next").unwrap(),
                None => break,
            }
        }
        assert_eq!(seen, files);
    }

    #[test]
    fn test_node_commands() {
        assert_eq!("fail\n".parse::<NodeCommand>().unwrap(), NodeCommand::Fail);
        assert_eq!("status".parse::<NodeCommand>().unwrap(), NodeCommand::Status);
        assert!("FAIL|x".parse::<NodeCommand>().is_err());
    }
}
