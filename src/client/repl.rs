//! Operator commands for the interactive client
//!
//! Workflow commands run a whole copy, read or recovery. Coordinator verbs
//! that only open or close one of those operations are refused, since
//! nothing here would finish what they start; any other line is handed to
//! the coordinator unchanged and its reply is shown as-is.

use super::Client;
use crate::protocol::{parse_name, parse_num, Command, GroupView};
use crate::{Error, Result};
use std::path::Path;

pub const USAGE: &str = "\
commands:
  configure-dss|G|n|stripeSize     create a storage group
  get-dss|G                        show members and files
  copy-file|G|/path/to/file        store a local file in G
  read-file|G|file|/path/to/out    read a file back out of G
  fail-disk|G[|member]             fail a member and rebuild it
  decommission-dss|G               release the group's disks
  help                             show this text
  quit                             deregister and exit
any other coordinator command is sent verbatim";

/// What the REPL loop should do after a line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Print(String),
    Quit,
}

/// Run one operator line against the client
pub async fn execute(client: &Client, line: &str) -> Result<Outcome> {
    let line = line.trim();
    let f: Vec<&str> = line.split('|').collect();

    let text = match f.as_slice() {
        [] | [""] => String::new(),
        ["quit"] | ["exit"] => return Ok(Outcome::Quit),
        ["help"] => USAGE.to_string(),
        ["configure-dss", dss, n, b] => {
            let view = client
                .configure(
                    &parse_name(dss, "dss")?,
                    parse_num(n, "n")?,
                    parse_num(b, "stripe size")?,
                )
                .await?;
            describe(&view)
        }
        ["get-dss", dss] => describe(&client.get_dss(&parse_name(dss, "dss")?).await?),
        ["copy-file", dss, path] => {
            let entry = client.copy_file(&parse_name(dss, "dss")?, Path::new(path)).await?;
            format!("copied {} ({} bytes) to {}", entry.name, entry.size, dss)
        }
        ["read-file", dss, file, out] => {
            let written = client
                .read_file(&parse_name(dss, "dss")?, &parse_name(file, "file")?, Path::new(out))
                .await?;
            format!("read {} bytes of {} into {}", written, file, out)
        }
        ["fail-disk", dss] => client
            .fail_and_recover(&parse_name(dss, "dss")?, None)
            .await?
            .to_string(),
        ["fail-disk", dss, member] => client
            .fail_and_recover(&parse_name(dss, "dss")?, Some(parse_num(member, "member")?))
            .await?
            .to_string(),
        ["decommission-dss", dss] => {
            let released = client.decommission(&parse_name(dss, "dss")?).await?;
            format!("decommissioned {}, {} disk(s) released", dss, released)
        }
        _ => {
            if let Ok(command) = line.parse::<Command>() {
                if command.is_admission() {
                    return Err(Error::InvalidArguments(format!(
                        "{} is driven by copy-file, read-file or fail-disk",
                        command.verb()
                    )));
                }
            }
            client.raw(line).await?.trim_end().to_string()
        }
    };
    Ok(Outcome::Print(text))
}

/// Human-readable listing of a group
pub fn describe(view: &GroupView) -> String {
    let mut out = format!(
        "{}: {} members, stripe block {} bytes",
        view.name,
        view.members.len(),
        view.stripe_size
    );
    for m in &view.members {
        out.push_str(&format!(
            "\n  [{}] {} {} data:{} control:{}",
            m.index, m.disk, m.ip, m.cport, m.mport
        ));
    }
    for file in &view.files {
        out.push_str(&format!("\n  {} {} bytes (owner {})", file.name, file.size, file.owner));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demo::LocalCluster;
    use crate::Config;
    use std::time::Duration;

    fn config() -> Config {
        Config {
            request_timeout: Duration::from_millis(500),
            ..Config::default()
        }
    }

    async fn print(client: &Client, line: &str) -> String {
        match execute(client, line).await.unwrap() {
            Outcome::Print(text) => text,
            Outcome::Quit => panic!("unexpected quit on {}", line),
        }
    }

    #[tokio::test]
    async fn test_raw_admission_verbs_are_refused() {
        let cluster = LocalCluster::start(3, &config()).await.unwrap();
        let user = cluster.client("U1", 5001, 5002);
        user.register().await.unwrap();
        print(&user, "configure-dss|G|3|128").await;

        for line in ["copy|f|10|U1|G", "read|G|f|U1", "disk-failure|G", "copy-complete|G|f|U1|10"] {
            let err = execute(&user, line).await.unwrap_err();
            assert!(matches!(err, Error::InvalidArguments(_)), "{}", line);
        }

        // nothing was admitted, so a full copy still goes through
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("f");
        std::fs::write(&src, vec![7u8; 300]).unwrap();
        let text = print(&user, &format!("copy-file|G|{}", src.display())).await;
        assert!(text.starts_with("copied f (300 bytes)"), "{}", text);
    }

    #[tokio::test]
    async fn test_workflow_verbs_round_trip() {
        let cluster = LocalCluster::start(3, &config()).await.unwrap();
        let user = cluster.client("U1", 5001, 5002);
        user.register().await.unwrap();
        print(&user, "configure-dss|G|3|64").await;

        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("notes");
        let data: Vec<u8> = (0..500).map(|i| (i % 256) as u8).collect();
        std::fs::write(&src, &data).unwrap();
        print(&user, &format!("copy-file|G|{}", src.display())).await;

        let report = print(&user, "fail-disk|G|1").await;
        assert!(report.starts_with("G: member 1"), "{}", report);

        let out = dir.path().join("notes.out");
        let text = print(&user, &format!("read-file|G|notes|{}", out.display())).await;
        assert!(text.starts_with("read 500 bytes"), "{}", text);
        assert_eq!(std::fs::read(&out).unwrap(), data);

        // other coordinator verbs still pass through
        let raw = print(&user, "get-dss|G|0").await;
        assert!(raw.contains("file|notes|500|U1"), "{}", raw);
        assert!(raw.ends_with("files=1"), "{}", raw);
        assert_eq!(execute(&user, "quit").await.unwrap(), Outcome::Quit);
    }
}
