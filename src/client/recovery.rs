//! Failure and recovery driver
//!
//! Declares a disk failure to the coordinator, tells one member to drop all
//! of its blocks, and rebuilds every block that member held from the other
//! members of each stripe. The coordinator only brackets the operation; all
//! reconstruction happens here.

use super::Client;
use crate::protocol::{Command, GroupView, NodeCommand, Reply};
use crate::storage::BlockKey;
use crate::{Error, Result};
use rand::Rng;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Outcome of one failure/recovery cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub dss: String,
    pub member: usize,
    pub disk: String,
    /// Blocks the node reported losing
    pub blocks_lost: usize,
    /// Files whose blocks were rebuilt
    pub files: usize,
    pub blocks_rebuilt: usize,
    pub bytes_rebuilt: usize,
    pub duration: Duration,
}

impl fmt::Display for RecoveryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: member {} ({}) lost {} blocks; rebuilt {} blocks ({} bytes) across {} file(s) in {:?}",
            self.dss,
            self.member,
            self.disk,
            self.blocks_lost,
            self.blocks_rebuilt,
            self.bytes_rebuilt,
            self.files,
            self.duration
        )
    }
}

impl Client {
    /// Fail one member of `dss` (random when `member` is `None`) and rebuild it
    ///
    /// `recovery-complete` is sent even when rebuilding fails, so the group
    /// does not stay locked; the rebuild error is returned afterwards.
    pub async fn fail_and_recover(&self, dss: &str, member: Option<usize>) -> Result<RecoveryReport> {
        let started = Instant::now();
        let view = self
            .command(&Command::DiskFailure {
                dss: dss.to_string(),
            })
            .await?
            .group_view()?;

        let outcome = self.recover_member(&view, member, started).await;

        self.command(&Command::RecoveryComplete {
            dss: dss.to_string(),
        })
        .await?;

        let report = outcome?;
        info!("Recovery finished: {}", report);
        Ok(report)
    }

    async fn recover_member(
        &self,
        view: &GroupView,
        member: Option<usize>,
        started: Instant,
    ) -> Result<RecoveryReport> {
        let n = view.members.len();
        let member = match member {
            Some(m) if m < n => m,
            Some(m) => {
                return Err(Error::InvalidArguments(format!(
                    "member {} out of range, {} has {} members",
                    m, view.name, n
                )))
            }
            None => rand::thread_rng().gen_range(0..n),
        };
        let target = &view.members[member];
        warn!("Failing member {} ({}) of {}", member, target.disk, view.name);

        let text = self
            .transport
            .request_text(target.control_addr(), &NodeCommand::Fail.to_string())
            .await?;
        let blocks_lost: usize = Reply::parse(&text)?.parsed("blocks")?;

        let layout = view.layout()?;
        let mut report = RecoveryReport {
            dss: view.name.clone(),
            member,
            disk: target.disk.clone(),
            blocks_lost,
            files: 0,
            blocks_rebuilt: 0,
            bytes_rebuilt: 0,
            duration: Duration::ZERO,
        };

        // copies are refused while recovering, so the catalog is stable
        let catalog = self.get_dss(&view.name).await?.files;
        for file in &catalog {
            for index in 0..layout.stripe_count(file.size) {
                let mut survivors = Vec::with_capacity(n - 1);
                for other in (0..n).filter(|&m| m != member) {
                    let key = BlockKey::new(
                        view.name.clone(),
                        file.name.clone(),
                        index,
                        other,
                        layout.parity_member(index) == other,
                    );
                    let block = self.link.fetch(view.members[other].data_addr(), &key).await?;
                    let expected = layout.block_len(index, other, file.size);
                    if block.len() != expected {
                        return Err(Error::Protocol(format!(
                            "{} has {} bytes, expected {}; stripe cannot be rebuilt",
                            key,
                            block.len(),
                            expected
                        )));
                    }
                    survivors.push(block);
                }

                let refs: Vec<&[u8]> = survivors.iter().map(Vec::as_slice).collect();
                let rebuilt = layout.rebuild(index, member, &refs, file.size);
                let key = BlockKey::new(
                    view.name.clone(),
                    file.name.clone(),
                    index,
                    member,
                    layout.parity_member(index) == member,
                );
                self.link.store(target.data_addr(), &key, &rebuilt).await?;
                report.blocks_rebuilt += 1;
                report.bytes_rebuilt += rebuilt.len();
            }
            report.files += 1;
        }

        report.duration = started.elapsed();
        Ok(report)
    }
}
