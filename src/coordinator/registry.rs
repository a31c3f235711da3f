//! Resource registry
//!
//! The authoritative tables of disks, users and storage groups. Every
//! operation validates first and mutates only once nothing can fail, so a
//! rejected request leaves the registry exactly as it was.

use crate::protocol::{Command, FileEntry, GroupView, Member, Registration, Reply, CATALOG_PAGE_BYTES};
use crate::{Config, Error, Result, MAX_MEMBERS, MAX_STRIPE_SIZE, MIN_MEMBERS, MIN_STRIPE_SIZE};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::IpAddr;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Allocation state of a disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskState {
    Free,
    /// Bound to the named group
    Allocated(String),
}

impl std::fmt::Display for DiskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiskState::Free => write!(f, "FREE"),
            DiskState::Allocated(group) => write!(f, "ALLOCATED({})", group),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Disk {
    pub name: String,
    pub ip: IpAddr,
    pub mport: u16,
    pub cport: u16,
    pub state: DiskState,
    /// Registration order; allocation scans disks in this order
    seq: u64,
}

impl Disk {
    pub fn is_free(&self) -> bool {
        self.state == DiskState::Free
    }
}

#[derive(Debug, Clone)]
pub struct User {
    pub name: String,
    pub ip: IpAddr,
    pub mport: u16,
    pub cport: u16,
}

/// The copy currently admitted on a group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyTicket {
    pub file: String,
    pub owner: String,
    pub size: u64,
}

/// A read admitted on a group, keyed by its token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadTicket {
    pub file: String,
    pub user: String,
}

/// A configured storage group
#[derive(Debug, Clone)]
pub struct StorageGroup {
    pub name: String,
    pub stripe_size: usize,
    /// Member disk names; index is the member index
    pub members: Vec<String>,
    pub files: Vec<FileEntry>,
    pub copy: Option<CopyTicket>,
    pub reads: BTreeMap<u64, ReadTicket>,
    pub recovering: bool,
}

impl StorageGroup {
    pub fn copy_in_flight(&self) -> bool {
        self.copy.is_some()
    }

    pub fn active_reads(&self) -> usize {
        self.reads.len()
    }

    pub fn file(&self, name: &str) -> Option<&FileEntry> {
        self.files.iter().find(|f| f.name == name)
    }

    /// Short flag summary for logs and the dashboard
    pub fn flags(&self) -> String {
        let mut flags = Vec::new();
        if let Some(copy) = &self.copy {
            flags.push(format!("copying {} ({} bytes for {})", copy.file, copy.size, copy.owner));
        }
        if !self.reads.is_empty() {
            flags.push(format!("{} read(s)", self.reads.len()));
        }
        if self.recovering {
            flags.push("recovering".to_string());
        }
        if flags.is_empty() {
            "idle".to_string()
        } else {
            flags.join(", ")
        }
    }
}

/// One handled command, kept for the dashboard
#[derive(Debug, Clone)]
pub struct Activity {
    pub at: Instant,
    pub command: String,
    pub outcome: std::result::Result<String, String>,
}

impl Activity {
    pub fn format(&self) -> String {
        let seconds = self.at.elapsed().as_secs();
        match &self.outcome {
            Ok(tag) => format!("[{:4}s] [OK]  {} -> {}", seconds, self.command, tag),
            Err(code) => format!("[{:4}s] [ERR] {} -> {}", seconds, self.command, code),
        }
    }
}

/// Point-in-time copy of the tables, ordered for display
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub disks: Vec<Disk>,
    pub users: Vec<User>,
    pub groups: Vec<StorageGroup>,
    pub history: Vec<Activity>,
}

impl Snapshot {
    pub fn free_disks(&self) -> usize {
        self.disks.iter().filter(|d| d.is_free()).count()
    }
}

/// Disk, user and storage-group tables with their state transitions
#[derive(Debug)]
pub struct Registry {
    disks: HashMap<String, Disk>,
    users: HashMap<String, User>,
    groups: HashMap<String, StorageGroup>,
    next_disk_seq: u64,
    next_read_token: u64,
    max_disks: usize,
    max_users: usize,
    history: VecDeque<Activity>,
    history_len: usize,
}

impl Registry {
    pub fn new(config: &Config) -> Self {
        Self {
            disks: HashMap::new(),
            users: HashMap::new(),
            groups: HashMap::new(),
            next_disk_seq: 0,
            next_read_token: 1,
            max_disks: config.max_disks,
            max_users: config.max_users,
            history: VecDeque::with_capacity(config.history_len),
            history_len: config.history_len,
        }
    }

    /// Handle one parsed command, recording it in the activity history
    pub fn apply(&mut self, command: &Command) -> Result<Reply> {
        let result = self.dispatch(command);
        match &result {
            Ok(reply) => info!("{} -> OK {}", command, reply.tag),
            Err(e) => warn!("{} -> {}", command, e),
        }
        self.record(
            command.to_string(),
            match &result {
                Ok(reply) => Ok(reply.tag.clone()),
                Err(e) => Err(e.code().to_string()),
            },
        );
        result
    }

    /// Note a request that never parsed
    pub fn record_rejected(&mut self, line: &str, err: &Error) {
        self.record(line.trim().to_string(), Err(err.code().to_string()));
    }

    fn record(&mut self, command: String, outcome: std::result::Result<String, String>) {
        if self.history_len == 0 {
            return;
        }
        if self.history.len() == self.history_len {
            self.history.pop_front();
        }
        self.history.push_back(Activity {
            at: Instant::now(),
            command,
            outcome,
        });
    }

    fn dispatch(&mut self, command: &Command) -> Result<Reply> {
        match command {
            Command::RegisterUser(r) => {
                self.register_user(r)?;
                Ok(Reply::ok("register-user").with("user", &r.name))
            }
            Command::RegisterDisk(r) => {
                self.register_disk(r)?;
                Ok(Reply::ok("register-disk").with("disk", &r.name))
            }
            Command::ConfigureDss {
                name,
                members,
                stripe_size,
            } => {
                let view = self.configure(name, *members, *stripe_size)?;
                Ok(Reply::group("configure-dss", view))
            }
            Command::GetDss { name, from } => {
                let files = &self.group(name)?.files;
                if *from > files.len() {
                    return Err(Error::InvalidArguments(format!(
                        "{} has {} files, cannot list from {}",
                        name,
                        files.len(),
                        from
                    )));
                }
                Ok(Reply::group("get-dss", self.view(name)?).with_catalog_page(
                    files,
                    *from,
                    CATALOG_PAGE_BYTES,
                ))
            }
            Command::Copy {
                file,
                size,
                owner,
                dss,
            } => {
                let view = self.begin_copy(dss, file, owner, *size)?;
                Ok(Reply::group("copy", view)
                    .with("file", file)
                    .with("size", size))
            }
            Command::CopyComplete {
                dss,
                file,
                owner,
                size,
            } => {
                self.complete_copy(dss, file, owner, *size)?;
                Ok(Reply::ok("copy-complete")
                    .with("dss", dss)
                    .with("file", file)
                    .with("size", size))
            }
            Command::Read { dss, file, user } => {
                let (view, size, token) = self.begin_read(dss, file, user)?;
                Ok(Reply::group("read", view)
                    .with("file", file)
                    .with("size", size)
                    .with("token", token))
            }
            Command::ReadComplete { dss, token } => {
                let remaining = self.complete_read(dss, *token)?;
                Ok(Reply::ok("read-complete")
                    .with("dss", dss)
                    .with("reads", remaining))
            }
            Command::DiskFailure { dss } => Ok(Reply::group("disk-failure", self.begin_failure(dss)?)),
            Command::RecoveryComplete { dss } => {
                self.complete_recovery(dss)?;
                Ok(Reply::ok("recovery-complete").with("dss", dss))
            }
            Command::DeregisterUser { name } => {
                self.deregister_user(name)?;
                Ok(Reply::ok("deregister-user").with("user", name))
            }
            Command::DeregisterDisk { name } => {
                self.deregister_disk(name)?;
                Ok(Reply::ok("deregister-disk").with("disk", name))
            }
            Command::DecommissionDss { name } => {
                let released = self.decommission(name)?;
                Ok(Reply::ok("decommission-dss")
                    .with("dss", name)
                    .with("released", released))
            }
        }
    }

    pub fn register_disk(&mut self, r: &Registration) -> Result<()> {
        if self.disks.contains_key(&r.name) {
            return Err(Error::DuplicateName(r.name.clone()));
        }
        if self.disks.len() >= self.max_disks {
            return Err(Error::NameSpaceExhausted("disk".into()));
        }
        let seq = self.next_disk_seq;
        self.next_disk_seq += 1;
        self.disks.insert(
            r.name.clone(),
            Disk {
                name: r.name.clone(),
                ip: r.ip,
                mport: r.mport,
                cport: r.cport,
                state: DiskState::Free,
                seq,
            },
        );
        Ok(())
    }

    pub fn register_user(&mut self, r: &Registration) -> Result<()> {
        if self.users.contains_key(&r.name) {
            return Err(Error::DuplicateName(r.name.clone()));
        }
        if self.users.len() >= self.max_users {
            return Err(Error::NameSpaceExhausted("user".into()));
        }
        self.users.insert(
            r.name.clone(),
            User {
                name: r.name.clone(),
                ip: r.ip,
                mport: r.mport,
                cport: r.cport,
            },
        );
        Ok(())
    }

    pub fn deregister_disk(&mut self, name: &str) -> Result<()> {
        let disk = self
            .disks
            .get(name)
            .ok_or_else(|| Error::NoSuchDisk(name.to_string()))?;
        if let DiskState::Allocated(group) = &disk.state {
            return Err(Error::DiskBusy(format!("{} belongs to {}", name, group)));
        }
        self.disks.remove(name);
        Ok(())
    }

    /// Files the user owns stay catalogued; users hold no disks
    pub fn deregister_user(&mut self, name: &str) -> Result<()> {
        self.users
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::NoSuchUser(name.to_string()))
    }

    /// Create a group on the first `n` free disks in registration order
    pub fn configure(&mut self, name: &str, n: usize, stripe_size: usize) -> Result<GroupView> {
        if self.groups.contains_key(name) {
            return Err(Error::InvalidGroupParams(format!("{} already exists", name)));
        }
        if !(MIN_MEMBERS..=MAX_MEMBERS).contains(&n) {
            return Err(Error::InvalidGroupParams(format!(
                "n must be between {} and {}",
                MIN_MEMBERS, MAX_MEMBERS
            )));
        }
        if !stripe_size.is_power_of_two()
            || !(MIN_STRIPE_SIZE..=MAX_STRIPE_SIZE).contains(&stripe_size)
        {
            return Err(Error::InvalidGroupParams(format!(
                "stripe size must be a power of two in [{}, {}]",
                MIN_STRIPE_SIZE, MAX_STRIPE_SIZE
            )));
        }

        let mut free: Vec<&Disk> = self.disks.values().filter(|d| d.is_free()).collect();
        if free.len() < n {
            return Err(Error::InsufficientDisks {
                need: n,
                have: free.len(),
            });
        }
        free.sort_by_key(|d| d.seq);
        let members: Vec<String> = free.iter().take(n).map(|d| d.name.clone()).collect();

        for member in &members {
            if let Some(disk) = self.disks.get_mut(member) {
                disk.state = DiskState::Allocated(name.to_string());
            }
        }
        self.groups.insert(
            name.to_string(),
            StorageGroup {
                name: name.to_string(),
                stripe_size,
                members: members.clone(),
                files: Vec::new(),
                copy: None,
                reads: BTreeMap::new(),
                recovering: false,
            },
        );
        info!("Configured {} on {} (B={})", name, members.join(","), stripe_size);
        self.view(name)
    }

    /// Member list and full catalog of a group
    pub fn get(&self, name: &str) -> Result<GroupView> {
        let mut view = self.view(name)?;
        view.files = self.group(name)?.files.clone();
        Ok(view)
    }

    pub fn begin_copy(&mut self, dss: &str, file: &str, owner: &str, size: u64) -> Result<GroupView> {
        let group = self.group(dss)?;
        if group.copy_in_flight() {
            return Err(Error::CopyAlreadyInFlight(dss.to_string()));
        }
        if group.recovering {
            return Err(Error::GroupBusy(format!("{} is recovering", dss)));
        }
        if !group.reads.is_empty() {
            return Err(Error::GroupBusy(format!(
                "{} has {} active read(s)",
                dss,
                group.reads.len()
            )));
        }
        if group.file(file).is_some() {
            return Err(Error::DuplicateFile(file.to_string()));
        }
        let view = self.view(dss)?;

        self.group_mut(dss)?.copy = Some(CopyTicket {
            file: file.to_string(),
            owner: owner.to_string(),
            size,
        });
        debug!("Copy of {} ({} bytes) admitted on {}", file, size, dss);
        Ok(view)
    }

    /// Record the file and release the copy flag; the size is trusted
    pub fn complete_copy(&mut self, dss: &str, file: &str, owner: &str, size: u64) -> Result<()> {
        let group = self.group_mut(dss)?;
        if group.file(file).is_some() {
            return Err(Error::DuplicateFile(file.to_string()));
        }
        match &group.copy {
            Some(ticket) if ticket.file == file && ticket.owner == owner && ticket.size == size => {}
            Some(ticket) => warn!(
                "copy-complete for {} ({} bytes, {}) on {} while {} ({} bytes, {}) was admitted",
                file, size, owner, dss, ticket.file, ticket.size, ticket.owner
            ),
            None => warn!("copy-complete for {} on {} without an admitted copy", file, dss),
        }
        group.files.push(FileEntry {
            name: file.to_string(),
            size,
            owner: owner.to_string(),
        });
        group.copy = None;
        Ok(())
    }

    /// Admit a read; returns the group, the file size and the read token
    pub fn begin_read(&mut self, dss: &str, file: &str, user: &str) -> Result<(GroupView, u64, u64)> {
        let group = self.group(dss)?;
        let entry = group
            .file(file)
            .ok_or_else(|| Error::NoSuchFile(file.to_string()))?;
        if entry.owner != user {
            return Err(Error::NotOwner {
                file: file.to_string(),
                user: user.to_string(),
            });
        }
        if group.copy_in_flight() {
            return Err(Error::CopyInFlight(dss.to_string()));
        }
        if group.recovering {
            return Err(Error::GroupBusy(format!("{} is recovering", dss)));
        }
        let size = entry.size;
        let view = self.view(dss)?;

        let token = self.next_read_token;
        self.next_read_token += 1;
        self.group_mut(dss)?.reads.insert(
            token,
            ReadTicket {
                file: file.to_string(),
                user: user.to_string(),
            },
        );
        Ok((view, size, token))
    }

    /// Release a read; without a token the oldest read is released
    ///
    /// Returns how many reads remain active.
    pub fn complete_read(&mut self, dss: &str, token: Option<u64>) -> Result<usize> {
        let group = self.group_mut(dss)?;
        match token {
            Some(token) => {
                if group.reads.remove(&token).is_none() {
                    return Err(Error::InvalidArguments(format!(
                        "no read {} on {}",
                        token, dss
                    )));
                }
            }
            None => {
                let oldest = group.reads.keys().next().copied();
                if let Some(oldest) = oldest {
                    group.reads.remove(&oldest);
                }
            }
        }
        Ok(group.reads.len())
    }

    pub fn begin_failure(&mut self, dss: &str) -> Result<GroupView> {
        let group = self.group(dss)?;
        if group.copy_in_flight() || !group.reads.is_empty() || group.recovering {
            return Err(Error::GroupBusy(format!("{} is {}", dss, group.flags())));
        }
        let view = self.view(dss)?;
        self.group_mut(dss)?.recovering = true;
        Ok(view)
    }

    pub fn complete_recovery(&mut self, dss: &str) -> Result<()> {
        let group = self.group_mut(dss)?;
        if !group.recovering {
            debug!("recovery-complete on {} without a failure in progress", dss);
        }
        group.recovering = false;
        Ok(())
    }

    /// Delete a quiescent group and free its members; returns how many
    pub fn decommission(&mut self, dss: &str) -> Result<usize> {
        let group = self.group(dss)?;
        if group.copy_in_flight() || !group.reads.is_empty() || group.recovering {
            return Err(Error::GroupBusy(format!("{} is {}", dss, group.flags())));
        }
        let group = self
            .groups
            .remove(dss)
            .ok_or_else(|| Error::NoSuchGroup(dss.to_string()))?;
        for member in &group.members {
            if let Some(disk) = self.disks.get_mut(member) {
                disk.state = DiskState::Free;
            }
        }
        info!("Decommissioned {}, released {}", dss, group.members.join(","));
        Ok(group.members.len())
    }

    pub fn disk(&self, name: &str) -> Option<&Disk> {
        self.disks.get(name)
    }

    pub fn storage_group(&self, name: &str) -> Option<&StorageGroup> {
        self.groups.get(name)
    }

    pub fn free_disk_count(&self) -> usize {
        self.disks.values().filter(|d| d.is_free()).count()
    }

    pub fn snapshot(&self) -> Snapshot {
        let mut disks: Vec<Disk> = self.disks.values().cloned().collect();
        disks.sort_by_key(|d| d.seq);
        let mut users: Vec<User> = self.users.values().cloned().collect();
        users.sort_by(|a, b| a.name.cmp(&b.name));
        let mut groups: Vec<StorageGroup> = self.groups.values().cloned().collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        Snapshot {
            disks,
            users,
            groups,
            history: self.history.iter().cloned().collect(),
        }
    }

    fn group(&self, name: &str) -> Result<&StorageGroup> {
        self.groups
            .get(name)
            .ok_or_else(|| Error::NoSuchGroup(name.to_string()))
    }

    fn group_mut(&mut self, name: &str) -> Result<&mut StorageGroup> {
        self.groups
            .get_mut(name)
            .ok_or_else(|| Error::NoSuchGroup(name.to_string()))
    }

    /// Members and geometry; the catalog travels only in `get-dss` pages
    fn view(&self, name: &str) -> Result<GroupView> {
        let group = self.group(name)?;
        let members = group
            .members
            .iter()
            .enumerate()
            .map(|(index, disk_name)| {
                let disk = self
                    .disks
                    .get(disk_name)
                    .ok_or_else(|| Error::NoSuchDisk(disk_name.clone()))?;
                Ok(Member {
                    index,
                    disk: disk.name.clone(),
                    ip: disk.ip,
                    cport: disk.cport,
                    mport: disk.mport,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(GroupView {
            name: group.name.clone(),
            stripe_size: group.stripe_size,
            members,
            files: Vec::new(),
        })
    }
}
