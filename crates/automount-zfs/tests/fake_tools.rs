#![cfg(target_os = "linux")]

use automount_core::error::AutomountError;
use automount_core::model::{KeyFormat, PoolHealth, ScrubStatus, TrimSupport};
use automount_core::provider::PoolInspector;
use automount_zfs::{DiskDetector, SystemRunner, SystemZfs};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::{tempdir, TempDir};

const FAKE_ZPOOL: &str = r#"#!/bin/sh
echo "zpool $*" >> "__LOG__"
case "$1" in
list)
    printf 'tank\tONLINE\t1.81T\t912G\n'
    printf 'media\tDEGRADED\t3.62T\t2.1T\n'
    ;;
status)
    if [ "$2" = "-P" ]; then
        case "$4" in
        tank) printf '\ttank ONLINE\n\t  mirror-0 ONLINE\n\t    /dev/nvme0n1p1 ONLINE 0 0 0\n\t    /dev/nvme1n1p1 ONLINE 0 0 0\n' ;;
        media) printf '\tmedia DEGRADED\n\t  /dev/sdb1 ONLINE 0 0 0\n' ;;
        esac
    else
        case "$2" in
        tank) echo "  scan: scrub repaired 0B in 00:10:12 with 0 errors on Sun Oct 12 00:34:13 2025" ;;
        media) echo "  scan: none requested" ;;
        esac
    fi
    ;;
import) ;;
scrub)
    if [ "$2" = "media" ]; then
        echo "cannot scrub media: currently resilvering" >&2
        exit 1
    fi
    ;;
trim) ;;
*)
    echo "unexpected args: $*" >&2
    exit 2
    ;;
esac
"#;

const FAKE_ZFS: &str = r#"#!/bin/sh
echo "zfs $*" >> "__LOG__"
case "$1" in
list)
    printf 'tank\t/tank\tyes\toff\t-\tnone\n'
    printf 'tank/enc1\t/tank/enc1\tno\taes-256-gcm\tpassphrase\tprompt\n'
    printf 'media/enc2\t/media/enc2\tno\taes-256-gcm\traw\tfile:///etc/zfs/keys/enc2\n'
    ;;
load-key)
    if [ "$4" = "tank/enc1" ]; then
        echo "Key load error: Key already loaded for 'tank/enc1'." >&2
        exit 255
    fi
    if [ "$4" = "media/enc2" ]; then
        echo "Key load error: Incorrect key provided for 'media/enc2'." >&2
        exit 255
    fi
    ;;
mount) ;;
*)
    echo "unexpected args: $*" >&2
    exit 2
    ;;
esac
"#;

const FAKE_LSBLK: &str = r#"#!/bin/sh
case "$6" in
/dev/nvme*) printf 'NAME="%s" ROTA="0" TRAN="" MODEL=""\nNAME="nvme" ROTA="0" TRAN="nvme" MODEL="WD Black SN850"\n' "$6" ;;
*) printf 'NAME="sdb1" ROTA="1" TRAN="" MODEL=""\nNAME="sdb" ROTA="1" TRAN="sata" MODEL="IronWolf"\n' ;;
esac
"#;

struct Fixture {
    zfs: SystemZfs,
    log: PathBuf,
    _tmp: TempDir,
}

fn install(dir: &Path, name: &str, script: &str, log: &Path) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, script.replace("__LOG__", &log.to_string_lossy())).unwrap();
    let mut perms = fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).unwrap();
    path
}

fn fixture() -> Fixture {
    let tmp = tempdir().unwrap();
    let log = tmp.path().join("calls.log");
    let zfs = install(tmp.path(), "zfs", FAKE_ZFS, &log);
    let zpool = install(tmp.path(), "zpool", FAKE_ZPOOL, &log);
    let lsblk = install(tmp.path(), "lsblk", FAKE_LSBLK, &log);
    let zfs = SystemZfs::with_executor(zfs, zpool, SystemRunner::new(Duration::from_secs(10)))
        .device_id_dir("/dev/disk/by-id")
        .disk_detector(DiskDetector::new(lsblk));
    Fixture {
        zfs,
        log,
        _tmp: tmp,
    }
}

fn calls(fixture: &Fixture) -> Vec<String> {
    fs::read_to_string(&fixture.log)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

#[tokio::test]
async fn pools_carry_scrub_and_trim_details() {
    let fx = fixture();
    let pools = fx.zfs.list_pools().await.unwrap();
    assert_eq!(pools.len(), 2);

    let tank = &pools[0];
    assert_eq!(tank.name, "tank");
    assert_eq!(tank.health, PoolHealth::Online);
    assert_eq!(tank.scrub.status, ScrubStatus::Clean);
    assert_eq!(tank.scrub.last_scrub_label(), "Oct 12, 2025");
    assert_eq!(tank.trim_support(), TrimSupport::Supported);
    assert_eq!(tank.disks.summary(), "2x NVMe SSD");

    let media = &pools[1];
    assert_eq!(media.health, PoolHealth::Degraded);
    assert_eq!(media.scrub.status, ScrubStatus::NeverRun);
    assert_eq!(media.trim_status(), "Not eligible");
}

#[tokio::test]
async fn datasets_are_listed_with_key_properties() {
    let fx = fixture();
    let datasets = fx.zfs.list_datasets().await.unwrap();
    let locked: Vec<&str> = datasets
        .iter()
        .filter(|ds| ds.needs_key())
        .map(|ds| ds.name.as_str())
        .collect();
    assert_eq!(locked, vec!["tank/enc1", "media/enc2"]);
    assert_eq!(datasets[2].key_format, KeyFormat::Raw);
    assert!(calls(&fx).contains(
        &"zfs list -H -t filesystem -o name,mountpoint,mounted,encryption,keyformat,keylocation"
            .to_string()
    ));
}

#[tokio::test]
async fn administrative_commands_use_expected_arguments() {
    let fx = fixture();
    fx.zfs.import_pools().await.unwrap();
    fx.zfs.mount_all().await.unwrap();
    fx.zfs.trim("tank").await.unwrap();
    assert_eq!(
        calls(&fx),
        vec![
            "zpool import -a -d /dev/disk/by-id".to_string(),
            "zfs mount -a".to_string(),
            "zpool trim tank".to_string(),
        ]
    );
}

#[tokio::test]
async fn already_loaded_key_is_success() {
    let fx = fixture();
    let out = fx
        .zfs
        .load_key("tank/enc1", "file:///tmp/zfs_key_x")
        .await
        .unwrap();
    assert_eq!(out, "Key already loaded");

    let err = fx
        .zfs
        .load_key("media/enc2", "file:///tmp/zfs_key_y")
        .await
        .unwrap_err();
    match err {
        AutomountError::CommandFailed { stderr, status, .. } => {
            assert_eq!(status, 255);
            assert!(stderr.contains("Incorrect key"), "{stderr}");
        }
        other => panic!("expected CommandFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn scrub_failure_surfaces_tool_stderr() {
    let fx = fixture();
    assert_eq!(fx.zfs.scrub("tank").await.unwrap(), "Scrub started on tank");
    let err = fx.zfs.scrub("media").await.unwrap_err();
    assert_eq!(err.reply_text(), "cannot scrub media: currently resilvering");
}
