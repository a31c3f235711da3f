//! Client
//!
//! A client registers with the coordinator, asks it for admission, and then
//! drives the data path itself: files are striped with
//! [`StripeEncoder`](crate::erasure::StripeEncoder) and every block is stored
//! directly on its member node. Reads reverse the process and rebuild a
//! single missing block per stripe from the parity.

pub mod blocks;
pub mod recovery;
pub mod repl;

pub use blocks::BlockLink;
pub use recovery::RecoveryReport;

use crate::erasure::{Stripe, StripeDecoder, StripeEncoder, StripeLayout};
use crate::protocol::{Command, FileEntry, GroupView, Registration, Reply};
use crate::storage::BlockKey;
use crate::transport::Transport;
use crate::{Config, Error, Result};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::net::SocketAddr;
use std::path::Path;
use tracing::{debug, info, warn};

/// A registered user of the storage service
#[derive(Debug, Clone)]
pub struct Client {
    registration: Registration,
    coordinator: SocketAddr,
    transport: Transport,
    link: BlockLink,
}

impl Client {
    pub fn new(registration: Registration, coordinator: SocketAddr, config: &Config) -> Self {
        Self {
            registration,
            coordinator,
            transport: Transport::from_config(config),
            link: BlockLink::from_config(config),
        }
    }

    pub fn name(&self) -> &str {
        &self.registration.name
    }

    /// Send one command; `ERR` replies come back as typed errors
    pub async fn command(&self, command: &Command) -> Result<Reply> {
        let text = self.raw(&command.to_string()).await?;
        Reply::parse(&text)
    }

    /// Send a line verbatim and return the reply text
    pub async fn raw(&self, line: &str) -> Result<String> {
        debug!("{} -> {}", self.name(), line.trim());
        self.transport.request_text(self.coordinator, line.trim()).await
    }

    pub async fn register(&self) -> Result<()> {
        self.command(&Command::RegisterUser(self.registration.clone()))
            .await?;
        info!("User {} registered with {}", self.name(), self.coordinator);
        Ok(())
    }

    pub async fn deregister(&self) -> Result<()> {
        self.command(&Command::DeregisterUser {
            name: self.name().to_string(),
        })
        .await?;
        info!("User {} deregistered", self.name());
        Ok(())
    }

    pub async fn configure(&self, dss: &str, members: usize, stripe_size: usize) -> Result<GroupView> {
        self.command(&Command::ConfigureDss {
            name: dss.to_string(),
            members,
            stripe_size,
        })
        .await?
        .group_view()
    }

    /// Members and the whole catalog, fetched page by page
    pub async fn get_dss(&self, dss: &str) -> Result<GroupView> {
        let mut from = 0;
        let mut listing: Option<GroupView> = None;
        loop {
            let reply = self
                .command(&Command::GetDss {
                    name: dss.to_string(),
                    from,
                })
                .await?;
            let page = reply.group_view()?;
            let next = match reply.field("next") {
                Some(_) => Some(reply.parsed::<usize>("next")?),
                None => None,
            };
            match listing.as_mut() {
                Some(view) => view.files.extend(page.files),
                None => listing = Some(page),
            }
            match next {
                Some(next) if next > from => from = next,
                Some(next) => {
                    return Err(Error::Protocol(format!(
                        "catalog of {} does not advance past {}",
                        dss, next
                    )))
                }
                None => break,
            }
        }
        listing.ok_or_else(|| Error::Protocol(format!("empty listing of {}", dss)))
    }

    /// Decommission a group; returns how many disks were released
    pub async fn decommission(&self, dss: &str) -> Result<usize> {
        self.command(&Command::DecommissionDss {
            name: dss.to_string(),
        })
        .await?
        .parsed("released")
    }

    /// Copy a local file into the group under its file name
    pub async fn copy_file(&self, dss: &str, path: &Path) -> Result<FileEntry> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::InvalidArguments(format!("no file name in {}", path.display())))?
            .to_string();
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        self.copy_from(dss, &name, size, BufReader::new(file)).await
    }

    pub async fn copy_bytes(&self, dss: &str, name: &str, data: &[u8]) -> Result<FileEntry> {
        self.copy_from(dss, name, data.len() as u64, data).await
    }

    /// Admit, stripe and store `size` bytes from `reader`, then record the file
    ///
    /// A copy that fails halfway leaves the group's copy flag set; there is
    /// no way to cancel an admitted copy.
    pub async fn copy_from<R: Read>(&self, dss: &str, name: &str, size: u64, reader: R) -> Result<FileEntry> {
        let reply = self
            .command(&Command::Copy {
                file: name.to_string(),
                size,
                owner: self.name().to_string(),
                dss: dss.to_string(),
            })
            .await?;
        let view = reply.group_view()?;
        let layout = view.layout()?;
        info!(
            "Copying {} ({} bytes) to {} across {} members",
            name,
            size,
            dss,
            layout.members()
        );

        let mut stripes = 0u64;
        for stripe in StripeEncoder::new(layout, reader.take(size)) {
            let stripe = stripe?;
            self.store_stripe(&view, name, &stripe).await?;
            stripes += 1;
        }
        debug!("{}: {} stripe(s) stored", name, stripes);

        let complete = Command::CopyComplete {
            dss: dss.to_string(),
            file: name.to_string(),
            owner: self.name().to_string(),
            size,
        };
        match self.command(&complete).await {
            Ok(_) => {}
            // a retried copy-complete whose first attempt got through
            Err(Error::DuplicateFile(file)) => {
                let recorded = self.get_dss(dss).await?;
                match recorded.file(name) {
                    Some(entry) if entry.size == size && entry.owner == self.name() => {}
                    _ => return Err(Error::DuplicateFile(file)),
                }
            }
            Err(e) => return Err(e),
        }

        Ok(FileEntry {
            name: name.to_string(),
            size,
            owner: self.name().to_string(),
        })
    }

    async fn store_stripe(&self, view: &GroupView, file: &str, stripe: &Stripe) -> Result<()> {
        for (member, block) in stripe.blocks.iter().enumerate() {
            let key = BlockKey::new(
                view.name.clone(),
                file,
                stripe.index,
                member,
                stripe.is_parity(member),
            );
            self.link
                .store(view.members[member].data_addr(), &key, block)
                .await?;
        }
        Ok(())
    }

    /// Read a file out of the group into `out`; returns bytes written
    pub async fn read_file(&self, dss: &str, file: &str, out: &Path) -> Result<u64> {
        let writer = BufWriter::new(File::create(out)?);
        let (written, _) = self.read_into(dss, file, writer).await?;
        Ok(written)
    }

    pub async fn read_bytes(&self, dss: &str, file: &str) -> Result<Vec<u8>> {
        let (_, data) = self.read_into(dss, file, Vec::new()).await?;
        Ok(data)
    }

    /// Admit a read, fetch every stripe into `writer`, then release the read
    ///
    /// The read is released even when fetching fails.
    pub async fn read_into<W: Write>(&self, dss: &str, file: &str, writer: W) -> Result<(u64, W)> {
        let reply = self
            .command(&Command::Read {
                dss: dss.to_string(),
                file: file.to_string(),
                user: self.name().to_string(),
            })
            .await?;
        let token = reply.parsed::<u64>("token").ok();

        let fetched = match (reply.group_view(), reply.parsed::<u64>("size")) {
            (Ok(view), Ok(size)) => self.fetch_file(&view, file, size, writer).await,
            (Err(e), _) | (_, Err(e)) => Err(e),
        };

        let released = self
            .command(&Command::ReadComplete {
                dss: dss.to_string(),
                token,
            })
            .await;
        if let Err(e) = &released {
            warn!("Could not release read of {} on {}: {}", file, dss, e);
        }

        let out = fetched?;
        released?;
        Ok(out)
    }

    async fn fetch_file<W: Write>(&self, view: &GroupView, file: &str, size: u64, writer: W) -> Result<(u64, W)> {
        let layout = view.layout()?;
        let mut decoder = StripeDecoder::new(layout, size, writer);
        for index in 0..layout.stripe_count(size) {
            let stripe = self.fetch_stripe(view, layout, file, index, size).await?;
            decoder.push(&stripe)?;
        }
        let written = decoder.written();
        Ok((written, decoder.finish()?))
    }

    /// Fetch one stripe, rebuilding at most one missing or damaged block
    pub(crate) async fn fetch_stripe(
        &self,
        view: &GroupView,
        layout: StripeLayout,
        file: &str,
        index: u64,
        size: u64,
    ) -> Result<Stripe> {
        let mut blocks = Vec::with_capacity(layout.members());
        let mut missing = Vec::new();
        let mut last_error = None;

        for member in 0..layout.members() {
            let key = BlockKey::new(
                view.name.clone(),
                file,
                index,
                member,
                layout.parity_member(index) == member,
            );
            let expected = layout.block_len(index, member, size);
            match self.link.fetch(view.members[member].data_addr(), &key).await {
                Ok(block) if block.len() == expected => blocks.push(block),
                Ok(block) => {
                    warn!("{} has {} bytes, expected {}", key, block.len(), expected);
                    missing.push(member);
                    blocks.push(Vec::new());
                }
                Err(e) => {
                    warn!("{} unavailable: {}", key, e);
                    missing.push(member);
                    blocks.push(Vec::new());
                    last_error = Some(e);
                }
            }
        }

        match missing.as_slice() {
            [] => {}
            [lost] => {
                let lost = *lost;
                let survivors: Vec<&[u8]> = blocks
                    .iter()
                    .enumerate()
                    .filter(|(member, _)| *member != lost)
                    .map(|(_, block)| block.as_slice())
                    .collect();
                let rebuilt = layout.rebuild(index, lost, &survivors, size);
                info!(
                    "Rebuilt member {} of stripe {} of {} from parity",
                    lost, index, file
                );
                blocks[lost] = rebuilt;
            }
            many => {
                return Err(last_error.unwrap_or_else(|| {
                    Error::Protocol(format!(
                        "stripe {} of {} lost {} blocks; single parity recovers one",
                        index,
                        file,
                        many.len()
                    ))
                }))
            }
        }

        Ok(Stripe {
            index,
            parity_member: layout.parity_member(index),
            blocks,
        })
    }
}
