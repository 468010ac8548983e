//! Shells out to `partprobe`, `lsblk`, `pvscan` and `vgchange` to discover
//! what a newly-attached NBD device contains: run, check exit status,
//! split plain-text tabular output by a fixed separator.

use thiserror::Error;
use tokio::process::Command;

#[derive(Error, Debug)]
pub enum BlockDevError {
    #[error("failed to spawn {0}: {1}")]
    SpawnFailed(String, String),
    #[error("{0} exited non-zero: {1}")]
    CommandFailed(String, String),
}

#[derive(Debug, Clone)]
pub struct BlockDevice {
    pub name: String,
    pub fstype: Option<String>,
    pub label: Option<String>,
    pub size_bytes: u64,
    #[allow(dead_code)]
    pub device_type: String,
}

async fn run(command: &str, args: &[&str]) -> Result<String, BlockDevError> {
    let output = Command::new(command)
        .args(args)
        .output()
        .await
        .map_err(|e| BlockDevError::SpawnFailed(command.to_string(), e.to_string()))?;

    if !output.status.success() {
        return Err(BlockDevError::CommandFailed(
            command.to_string(),
            String::from_utf8_lossy(&output.stderr).to_string(),
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Refreshes the kernel's view of `device`'s partition table after a fresh attach.
pub async fn partprobe(device: &str) -> Result<(), BlockDevError> {
    run("partprobe", &[device]).await?;
    Ok(())
}

/// Lists `device` and every partition under it, one level deep.
pub async fn list_block_devices(device: &str) -> Result<Vec<BlockDevice>, BlockDevError> {
    let output = run(
        "lsblk",
        &["-n", "-b", "-P", "-o", "NAME,FSTYPE,SIZE,TYPE,LABEL", device],
    )
    .await?;
    Ok(parse_lsblk_pairs(&output))
}

/// `lsblk -P` emits `KEY="value" KEY="value" ...` per line, one line per device.
fn parse_lsblk_pairs(output: &str) -> Vec<BlockDevice> {
    output
        .lines()
        .filter_map(|line| {
            let mut name = None;
            let mut fstype = None;
            let mut label = None;
            let mut size = None;
            let mut device_type = None;
            for field in split_quoted_pairs(line) {
                let (key, value) = field;
                match key {
                    "NAME" => name = Some(value.to_string()),
                    "FSTYPE" if !value.is_empty() => fstype = Some(value.to_string()),
                    "LABEL" if !value.is_empty() => label = Some(value.to_string()),
                    "SIZE" => size = value.parse::<u64>().ok(),
                    "TYPE" => device_type = Some(value.to_string()),
                    _ => {}
                }
            }
            Some(BlockDevice {
                name: name?,
                fstype,
                label,
                size_bytes: size.unwrap_or(0),
                device_type: device_type.unwrap_or_default(),
            })
        })
        .collect()
}

fn split_quoted_pairs(line: &str) -> Vec<(&str, &str)> {
    let mut pairs = Vec::new();
    let mut rest = line.trim();
    while let Some(eq) = rest.find('=') {
        let key = rest[..eq].trim();
        rest = &rest[eq + 1..];
        if !rest.starts_with('"') {
            break;
        }
        rest = &rest[1..];
        let Some(close) = rest.find('"') else { break };
        let value = &rest[..close];
        pairs.push((key, value));
        rest = rest[close + 1..].trim_start();
    }
    pairs
}

/// Refreshes LVM's cache so a just-attached PV is visible, then activates
/// every VG the device contributes to. Returns the activated VG names.
pub async fn activate_lvm_on_device(device: &str) -> Result<Vec<String>, BlockDevError> {
    run("pvscan", &["--cache", device]).await.ok();

    let vgs_output = run(
        "pvs",
        &["--noheadings", "-o", "vg_name", "--separator", "\t", device],
    )
    .await?;
    let vg_names: Vec<String> = vgs_output
        .lines()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect();

    for vg in &vg_names {
        run("vgchange", &["-ay", vg]).await?;
    }
    Ok(vg_names)
}

pub async fn deactivate_lvm(vg_name: &str) -> Result<(), BlockDevError> {
    run("vgchange", &["-an", vg_name]).await?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct LogicalVolume {
    pub lv_path: String,
    pub lv_name: String,
    pub fstype: Option<String>,
    pub label: Option<String>,
    pub size_bytes: u64,
}

pub async fn list_logical_volumes(vg_name: &str) -> Result<Vec<LogicalVolume>, BlockDevError> {
    let output = run(
        "lvs",
        &[
            "--noheadings",
            "--units",
            "b",
            "--nosuffix",
            "-o",
            "lv_path,lv_name,lv_size",
            "--separator",
            "\t",
            vg_name,
        ],
    )
    .await?;

    let mut volumes = Vec::new();
    for line in output.lines() {
        let cols: Vec<&str> = line.trim().split('\t').map(|c| c.trim()).collect();
        if cols.len() < 3 {
            continue;
        }
        let Ok(size_bytes) = cols[2].parse::<u64>() else { continue };
        let (fstype, label) = probe_fs_info(cols[0]).await;
        volumes.push(LogicalVolume {
            lv_path: cols[0].to_string(),
            lv_name: cols[1].to_string(),
            fstype,
            label,
            size_bytes,
        });
    }
    Ok(volumes)
}

async fn probe_fs_info(device_path: &str) -> (Option<String>, Option<String>) {
    let Ok(output) = run("lsblk", &["-n", "-P", "-o", "FSTYPE,LABEL", device_path]).await else {
        return (None, None);
    };
    let Some(pairs) = output.lines().next().map(split_quoted_pairs) else {
        return (None, None);
    };
    let fstype = pairs
        .iter()
        .find(|(k, _)| *k == "FSTYPE")
        .map(|(_, v)| v.to_string())
        .filter(|v| !v.is_empty());
    let label = pairs
        .iter()
        .find(|(k, _)| *k == "LABEL")
        .map(|(_, v)| v.to_string())
        .filter(|v| !v.is_empty());
    (fstype, label)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_lsblk_key_value_pairs() {
        let line = r#"NAME="nbd0" FSTYPE="" SIZE="10737418240" TYPE="disk""#;
        let pairs = split_quoted_pairs(line);
        assert_eq!(pairs, vec![("NAME", "nbd0"), ("FSTYPE", ""), ("SIZE", "10737418240"), ("TYPE", "disk")]);
    }

    #[test]
    fn parses_full_lsblk_output_into_devices() {
        let output = "NAME=\"nbd0\" FSTYPE=\"\" SIZE=\"10737418240\" TYPE=\"disk\"\n\
                       NAME=\"nbd0p1\" FSTYPE=\"ext4\" SIZE=\"10736369152\" TYPE=\"part\"\n";
        let devices = parse_lsblk_pairs(output);
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[1].name, "nbd0p1");
        assert_eq!(devices[1].fstype.as_deref(), Some("ext4"));
    }
}
