//! 端到端场景测试：备份、校验、保留、恢复、互斥和调度

use crate::backup::{BackupStore, BackupStoreOptions};
use crate::clock::{Clock, ManualClock};
use crate::config::SchedulerConfig;
use crate::config_manager::LastStatus;
use crate::content::{ContentGroup, ContentSource, DirectorySource, FileSource, SourceLayout};
use crate::db::{BackupRecord, DuckDbManager};
use crate::integrity::IntegrityCheck;
use crate::remote_sync::RemoteSync;
use crate::restore::RestoreRequest;
use crate::scheduler::{SchedulerLifecycle, SchedulerService};
use crate::service::BackupService;
use crate::{BackupError, ErrorKind, Result};
use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::{Notify, Semaphore};

struct Fixture {
    _temp_dir: TempDir,
    root: PathBuf,
    service: BackupService,
}

impl Fixture {
    fn live(&self, relative: &str) -> PathBuf {
        self.root.join("live").join(relative)
    }

    fn read(&self, relative: &str) -> Vec<u8> {
        std::fs::read(self.live(relative)).unwrap()
    }

    fn write(&self, relative: &str, content: &[u8]) {
        let path = self.live(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }
}

fn all_groups() -> BTreeSet<ContentGroup> {
    ContentGroup::ALL.into_iter().collect()
}

fn default_sources(root: &Path) -> Vec<Arc<dyn ContentSource>> {
    vec![
        Arc::new(FileSource::new(ContentGroup::Records, root.join("live/library.db"))),
        Arc::new(DirectorySource::new(ContentGroup::Assets, root.join("live/covers"))),
        Arc::new(FileSource::new(ContentGroup::Config, root.join("live/config.yaml"))),
    ]
}

fn broken_config_sources(root: &Path) -> Vec<Arc<dyn ContentSource>> {
    vec![
        Arc::new(FileSource::new(ContentGroup::Records, root.join("live/library.db"))),
        Arc::new(DirectorySource::new(ContentGroup::Assets, root.join("live/covers"))),
        Arc::new(BrokenInstall(FileSource::new(
            ContentGroup::Config,
            root.join("live/config.yaml"),
        ))),
    ]
}

async fn fixture_with(
    retention: usize,
    sources: impl FnOnce(&Path) -> Vec<Arc<dyn ContentSource>>,
    remote: Option<Arc<dyn RemoteSync>>,
) -> Fixture {
    fixture_with_retention(retention, 5, sources, remote).await
}

async fn fixture_with_retention(
    retention: usize,
    safety_retention: usize,
    sources: impl FnOnce(&Path) -> Vec<Arc<dyn ContentSource>>,
    remote: Option<Arc<dyn RemoteSync>>,
) -> Fixture {
    let temp_dir = tempfile::tempdir().unwrap();
    let root = temp_dir.path().to_path_buf();

    std::fs::create_dir_all(root.join("live/covers/2026")).unwrap();
    std::fs::write(root.join("live/library.db"), b"records v1").unwrap();
    std::fs::write(root.join("live/covers/2026/a.jpg"), b"cover a v1").unwrap();
    std::fs::write(root.join("live/covers/b.png"), b"cover b v1").unwrap();
    std::fs::write(root.join("live/config.yaml"), b"port: 1").unwrap();

    let db = DuckDbManager::new_memory().await.unwrap();
    let store = BackupStore::new(
        BackupStoreOptions {
            storage_dir: root.join("backups"),
            retention_count: retention,
            safety_retention_count: safety_retention,
            compression_level: 1,
        },
        db.clone(),
        sources(&root),
    )
    .unwrap();

    Fixture {
        _temp_dir: temp_dir,
        root,
        service: BackupService::new(db, store, remote),
    }
}

async fn fixture(retention: usize) -> Fixture {
    fixture_with(retention, default_sources, None).await
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(std::time::Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// 在线目录中残留的换入临时文件
fn leftovers(dir: &Path) -> Vec<String> {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
        .filter(|name| name.contains(".restore-"))
        .collect()
}

/// 换入时总是失败的内容来源
#[derive(Debug)]
struct BrokenInstall(FileSource);

#[async_trait]
impl ContentSource for BrokenInstall {
    fn group(&self) -> ContentGroup {
        self.0.group()
    }

    fn live_path(&self) -> &Path {
        self.0.live_path()
    }

    fn layout(&self) -> SourceLayout {
        self.0.layout()
    }

    async fn capture(&self, dest: &Path) -> Result<()> {
        self.0.capture(dest).await
    }

    async fn install(&self, _staged: &Path) -> Result<Option<PathBuf>> {
        Err(BackupError::Io(std::io::Error::other("simulated rename failure")))
    }
}

/// 捕获时停在闸门前，直到测试放行
#[derive(Debug)]
struct Gate {
    entered: Notify,
    release: Semaphore,
}

impl Gate {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            entered: Notify::new(),
            release: Semaphore::new(0),
        })
    }
}

#[derive(Debug)]
struct GatedSource(FileSource, Arc<Gate>);

#[async_trait]
impl ContentSource for GatedSource {
    fn group(&self) -> ContentGroup {
        self.0.group()
    }

    fn live_path(&self) -> &Path {
        self.0.live_path()
    }

    fn layout(&self) -> SourceLayout {
        self.0.layout()
    }

    async fn capture(&self, dest: &Path) -> Result<()> {
        self.1.entered.notify_one();
        let _permit = self.1.release.acquire().await.unwrap();
        self.0.capture(dest).await
    }
}

#[derive(Debug)]
struct UnreachableRemote;

#[async_trait]
impl RemoteSync for UnreachableRemote {
    async fn upload(&self, _record: &BackupRecord) -> Result<()> {
        Err(BackupError::UpstreamUnavailable("connection refused".to_string()))
    }
}

#[tokio::test]
async fn test_full_round_trip_restores_live_state() {
    let fx = fixture(10).await;
    let outcome = fx
        .service
        .create(all_groups(), Some("before upgrade".to_string()))
        .await
        .unwrap();
    assert_eq!(outcome.record.includes, all_groups());
    assert!(outcome.sync_warning.is_none());

    fx.write("library.db", b"records v2");
    fx.write("covers/2026/a.jpg", b"cover a v2");
    fx.write("covers/new.jpg", b"added later");
    std::fs::remove_file(fx.live("covers/b.png")).unwrap();
    fx.write("config.yaml", b"port: 2");

    let restored = fx
        .service
        .restore(RestoreRequest::new(&outcome.record.id))
        .await
        .unwrap();

    assert_eq!(restored.restored, all_groups());
    assert!(restored.safety_snapshot_id.is_some());
    assert_eq!(fx.read("library.db"), b"records v1");
    assert_eq!(fx.read("covers/2026/a.jpg"), b"cover a v1");
    assert_eq!(fx.read("covers/b.png"), b"cover b v1");
    assert!(!fx.live("covers/new.jpg").exists());
    assert_eq!(fx.read("config.yaml"), b"port: 1");
    assert_eq!(leftovers(&fx.root.join("live")), Vec::<String>::new());

    let report = fx.service.validate(&outcome.record.id).await.unwrap();
    assert!(report.valid);
}

#[tokio::test]
async fn test_single_byte_corruption_is_digest_mismatch() {
    let fx = fixture(10).await;
    let record = fx
        .service
        .create(all_groups(), None)
        .await
        .unwrap()
        .record;

    let mut bytes = std::fs::read(&record.location).unwrap();
    let middle = bytes.len() / 2;
    bytes[middle] ^= 0xff;
    std::fs::write(&record.location, bytes).unwrap();

    let report = fx.service.validate(&record.id).await.unwrap();
    assert!(!report.valid);
    assert_eq!(report.check, Some(IntegrityCheck::DigestMismatch));

    fx.write("config.yaml", b"port: 9");
    let err = fx
        .service
        .restore(RestoreRequest::new(&record.id))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Corrupt);
    // 校验失败不会修改在线内容，也不会创建安全快照
    assert_eq!(fx.read("config.yaml"), b"port: 9");
    assert_eq!(fx.service.list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_missing_archive_file_is_reported() {
    let fx = fixture(10).await;
    let record = fx
        .service
        .create(BTreeSet::from([ContentGroup::Config]), None)
        .await
        .unwrap()
        .record;
    std::fs::remove_file(&record.location).unwrap();

    let report = fx.service.validate(&record.id).await.unwrap();
    assert_eq!(report.check, Some(IntegrityCheck::MissingFile));
}

#[tokio::test]
async fn test_retention_keeps_newest_backups() {
    let fx = fixture(3).await;
    let mut ids = Vec::new();
    for _ in 0..4 {
        let outcome = fx
            .service
            .create(BTreeSet::from([ContentGroup::Config]), None)
            .await
            .unwrap();
        ids.push(outcome.record.id);
    }
    let (a, b, c, d) = (&ids[0], &ids[1], &ids[2], &ids[3]);

    let listed: Vec<String> = fx
        .service
        .list()
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(listed, vec![d.clone(), c.clone(), b.clone()]);

    assert!(matches!(
        fx.service.validate(a).await,
        Err(BackupError::NotFound(_))
    ));
    let stats = fx.service.stats().await.unwrap();
    assert_eq!(stats.total_count, 3);
    assert_eq!(stats.oldest.unwrap().id, *b);
    assert_eq!(stats.newest.unwrap().id, *d);
}

#[tokio::test]
async fn test_safety_snapshots_are_exempt_from_retention() {
    let fx = fixture(1).await;
    let first = fx
        .service
        .create(BTreeSet::from([ContentGroup::Config]), None)
        .await
        .unwrap()
        .record;

    let restored = fx
        .service
        .restore(RestoreRequest::new(&first.id))
        .await
        .unwrap();
    let snapshot_id = restored.safety_snapshot_id.unwrap();

    for _ in 0..2 {
        fx.service
            .create(BTreeSet::from([ContentGroup::Config]), None)
            .await
            .unwrap();
    }

    let records = fx.service.list().await.unwrap();
    let regular: Vec<_> = records.iter().filter(|r| !r.is_safety_snapshot).collect();
    assert_eq!(regular.len(), 1);
    assert!(records.iter().any(|r| r.id == snapshot_id && r.is_safety_snapshot));

    // 操作员可以显式删除安全快照
    fx.service.delete(&snapshot_id).await.unwrap();
    assert!(matches!(
        fx.service.delete(&snapshot_id).await,
        Err(BackupError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_jobs_are_mutually_exclusive() {
    let fx = fixture(10).await;
    let record = fx
        .service
        .create(BTreeSet::from([ContentGroup::Config]), None)
        .await
        .unwrap()
        .record;

    let _held = fx.service.job_slot().try_acquire().unwrap();

    let err = fx
        .service
        .create(BTreeSet::from([ContentGroup::Config]), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InFlight);
    assert!(err.is_retryable());

    let err = fx
        .service
        .restore(RestoreRequest::new(&record.id))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InFlight);

    // 只读操作不受影响
    assert_eq!(fx.service.list().await.unwrap().len(), 1);
    assert!(fx.service.validate(&record.id).await.unwrap().valid);
}

#[tokio::test]
async fn test_concurrent_jobs_yield_exactly_one_in_flight() {
    let fx = fixture(10).await;
    let record = fx
        .service
        .create(BTreeSet::from([ContentGroup::Config]), None)
        .await
        .unwrap()
        .record;

    let (first, second) = tokio::join!(
        fx.service.create(all_groups(), None),
        fx.service.create(all_groups(), None),
    );
    let results = [first.map(|_| ()), second.map(|_| ())];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(
        results
            .iter()
            .filter(|r| matches!(r, Err(BackupError::InFlight)))
            .count(),
        1
    );

    let (created, restored) = tokio::join!(
        fx.service.create(all_groups(), None),
        fx.service.restore(RestoreRequest::new(&record.id)),
    );
    let results = [created.map(|_| ()), restored.map(|_| ())];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(
        results
            .iter()
            .filter(|r| matches!(r, Err(BackupError::InFlight)))
            .count(),
        1
    );

    // 初始备份、第一轮胜出的备份、第二轮的新备份或安全快照
    assert_eq!(fx.service.list().await.unwrap().len(), 3);
    assert!(fx.service.job_slot().try_acquire().is_ok());
}

#[tokio::test]
async fn test_restoring_the_only_safety_snapshot_keeps_it() {
    let fx = fixture_with_retention(10, 1, default_sources, None).await;
    let original = fx
        .service
        .create(BTreeSet::from([ContentGroup::Config]), None)
        .await
        .unwrap()
        .record;

    fx.write("config.yaml", b"port: 2");
    let first = fx
        .service
        .restore(RestoreRequest::new(&original.id))
        .await
        .unwrap();
    let before_first = first.safety_snapshot_id.unwrap();
    assert_eq!(fx.read("config.yaml"), b"port: 1");

    // 恢复唯一的安全快照时，新建的快照不会把它挤出保留数量
    let second = fx
        .service
        .restore(RestoreRequest::new(&before_first))
        .await
        .unwrap();
    let before_second = second.safety_snapshot_id.unwrap();
    assert_eq!(fx.read("config.yaml"), b"port: 2");

    let snapshots = |records: Vec<BackupRecord>| -> Vec<String> {
        records
            .into_iter()
            .filter(|r| r.is_safety_snapshot)
            .map(|r| r.id)
            .collect()
    };
    assert_eq!(
        snapshots(fx.service.list().await.unwrap()),
        vec![before_second.clone(), before_first.clone()]
    );
    assert!(fx.service.validate(&before_first).await.unwrap().valid);

    // 之后的快照照常按保留数量清理
    fx.write("config.yaml", b"port: 3");
    let third = fx
        .service
        .restore(RestoreRequest::new(&original.id))
        .await
        .unwrap();
    assert_eq!(
        snapshots(fx.service.list().await.unwrap()),
        vec![third.safety_snapshot_id.unwrap()]
    );
}

#[tokio::test]
async fn test_failed_swap_rolls_back_from_safety_snapshot() {
    let fx = fixture_with(10, broken_config_sources, None).await;

    let record = fx.service.create(all_groups(), None).await.unwrap().record;

    fx.write("library.db", b"records v2");
    fx.write("covers/2026/a.jpg", b"cover a v2");
    fx.write("config.yaml", b"port: 2");

    let err = fx
        .service
        .restore(RestoreRequest::new(&record.id))
        .await
        .unwrap_err();

    match &err {
        BackupError::Restore {
            safety_snapshot_id,
            restored,
            rolled_back,
            source,
        } => {
            assert!(safety_snapshot_id.is_some());
            assert!(restored.is_empty());
            assert_eq!(rolled_back, &vec![ContentGroup::Records, ContentGroup::Assets]);
            assert!(matches!(
                source.as_ref(),
                BackupError::PartialGroupFailure {
                    group: ContentGroup::Config,
                    ..
                }
            ));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(err.kind(), ErrorKind::PartialGroupFailure);
    assert!(err.safety_snapshot_id().is_some());

    // 在线内容回到恢复前的状态
    assert_eq!(fx.read("library.db"), b"records v2");
    assert_eq!(fx.read("covers/2026/a.jpg"), b"cover a v2");
    assert_eq!(fx.read("config.yaml"), b"port: 2");
    assert_eq!(leftovers(&fx.root.join("live")), Vec::<String>::new());
}

#[tokio::test]
async fn test_failed_swap_without_snapshot_uses_set_aside_content() {
    let without_assets = |root: &Path| {
        broken_config_sources(root)
            .into_iter()
            .filter(|source| source.group() != ContentGroup::Assets)
            .collect::<Vec<_>>()
    };
    let fx = fixture_with(10, without_assets, None).await;

    let includes = BTreeSet::from([ContentGroup::Records, ContentGroup::Config]);
    let record = fx.service.create(includes, None).await.unwrap().record;
    fx.write("library.db", b"records v2");

    let err = fx
        .service
        .restore(RestoreRequest::new(&record.id).without_safety_snapshot())
        .await
        .unwrap_err();

    assert!(err.safety_snapshot_id().is_none());
    assert_eq!(fx.read("library.db"), b"records v2");
    assert_eq!(fx.service.list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_partial_restore_leaves_other_groups_untouched() {
    let fx = fixture(10).await;
    let record = fx.service.create(all_groups(), None).await.unwrap().record;

    fx.write("library.db", b"records v2");
    fx.write("config.yaml", b"port: 2");

    let outcome = fx
        .service
        .restore(
            RestoreRequest::new(&record.id).with_includes(BTreeSet::from([ContentGroup::Records])),
        )
        .await
        .unwrap();

    assert_eq!(outcome.restored, BTreeSet::from([ContentGroup::Records]));
    assert_eq!(fx.read("library.db"), b"records v1");
    assert_eq!(fx.read("config.yaml"), b"port: 2");

    // 快照只包含被恢复的内容组
    let snapshot = fx
        .service
        .store()
        .get(&outcome.safety_snapshot_id.unwrap())
        .await
        .unwrap();
    assert_eq!(snapshot.includes, BTreeSet::from([ContentGroup::Records]));
}

#[tokio::test]
async fn test_restore_of_group_not_in_backup_fails_before_mutation() {
    let fx = fixture(10).await;
    let record = fx
        .service
        .create(BTreeSet::from([ContentGroup::Config]), None)
        .await
        .unwrap()
        .record;

    let err = fx
        .service
        .restore(
            RestoreRequest::new(&record.id).with_includes(BTreeSet::from([ContentGroup::Assets])),
        )
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::PartialGroupFailure);
    assert_eq!(fx.service.list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_remote_sync_failure_is_a_warning() {
    let fx = fixture_with(10, default_sources, Some(Arc::new(UnreachableRemote))).await;

    let outcome = fx
        .service
        .create(BTreeSet::from([ContentGroup::Config]), None)
        .await
        .unwrap();

    assert!(outcome.sync_warning.unwrap().contains("connection refused"));
    assert!(fx.service.validate(&outcome.record.id).await.unwrap().valid);
}

fn scheduler_config(expression: &str) -> SchedulerConfig {
    SchedulerConfig {
        enabled: true,
        cron_expression: expression.to_string(),
        utc_offset: "+00:00".to_string(),
        max_consecutive_failures: 2,
    }
}

#[tokio::test]
async fn test_scheduler_fires_on_schedule_with_manual_clock() {
    let fx = fixture(10).await;
    let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 30).unwrap();
    let clock = ManualClock::new(start);

    let scheduler = SchedulerService::new(
        fx.service.clone(),
        &scheduler_config("*/5 * * * *"),
        BTreeSet::from([ContentGroup::Config]),
        Arc::new(clock.clone()),
    )
    .await
    .unwrap();

    assert_eq!(scheduler.status().lifecycle, SchedulerLifecycle::Stopped);
    scheduler.start();
    let status = scheduler.status();
    assert_eq!(status.lifecycle, SchedulerLifecycle::Idle);
    assert_eq!(status.next_run_at, Some(start + Duration::seconds(270)));
    assert_eq!(status.last_status, LastStatus::NeverRun);

    clock.set(Utc.with_ymd_and_hms(2026, 1, 1, 0, 5, 0).unwrap());
    wait_until(|| scheduler.status().last_status == LastStatus::Success).await;

    let status = scheduler.status();
    assert_eq!(
        status.next_run_at,
        Some(Utc.with_ymd_and_hms(2026, 1, 1, 0, 10, 0).unwrap())
    );
    assert_eq!(status.consecutive_failures, 0);

    let records = fx.service.list().await.unwrap();
    assert_eq!(records.len(), 1);
    assert!(records[0].description.as_deref().unwrap().starts_with("自动备份 - "));

    scheduler.disable().await.unwrap();
    assert_eq!(scheduler.status().next_run_at, None);
    scheduler.stop().await;
    assert_eq!(scheduler.status().lifecycle, SchedulerLifecycle::Stopped);
}

#[tokio::test]
async fn test_scheduler_controls_and_persistence() {
    let fx = fixture(10).await;
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap());
    let mut config = scheduler_config("0 2 * * *");
    config.enabled = false;

    let scheduler = SchedulerService::new(
        fx.service.clone(),
        &config,
        BTreeSet::from([ContentGroup::Config]),
        Arc::new(clock.clone()),
    )
    .await
    .unwrap();
    scheduler.start();
    assert_eq!(scheduler.status().next_run_at, None);

    // 无效表达式立即失败且不修改当前调度
    let err = scheduler.update_schedule("0 2 * *").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ScheduleInvalid);
    assert_eq!(scheduler.status().cron_expression, "0 2 * * *");

    scheduler.enable(Some("30 3 * * *")).await.unwrap();
    assert_eq!(
        scheduler.status().next_run_at,
        Some(Utc.with_ymd_and_hms(2026, 1, 1, 3, 30, 0).unwrap())
    );

    // 手动触发不受 enabled 影响，也不改变下次触发时间
    scheduler.disable().await.unwrap();
    let outcome = scheduler.trigger_now().await.unwrap();
    assert!(outcome
        .record
        .description
        .as_deref()
        .unwrap()
        .starts_with("手动触发的自动备份 - "));
    assert_eq!(scheduler.status().next_run_at, None);
    assert_eq!(scheduler.status().last_status, LastStatus::Success);
    scheduler.stop().await;

    // 新实例从索引库读取持久化状态
    let reloaded = SchedulerService::new(
        fx.service.clone(),
        &config,
        BTreeSet::from([ContentGroup::Config]),
        Arc::new(clock.clone()),
    )
    .await
    .unwrap();
    let status = reloaded.status();
    assert!(!status.enabled);
    assert_eq!(status.cron_expression, "30 3 * * *");
    assert_eq!(status.last_status, LastStatus::Success);
    assert!(status.last_run_at.is_some());
}

#[tokio::test]
async fn test_scheduler_records_failures_and_keeps_running() {
    let fx = fixture(10).await;
    std::fs::remove_file(fx.live("config.yaml")).unwrap();
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap());

    let scheduler = SchedulerService::new(
        fx.service.clone(),
        &scheduler_config("0 * * * *"),
        BTreeSet::from([ContentGroup::Config]),
        Arc::new(clock.clone()),
    )
    .await
    .unwrap();
    scheduler.start();

    for expected in 1..=3u32 {
        let err = scheduler.trigger_now().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PartialGroupFailure);
        let status = scheduler.status();
        assert_eq!(status.last_status, LastStatus::Failure);
        assert_eq!(status.consecutive_failures, expected);
        assert_eq!(status.lifecycle, SchedulerLifecycle::Idle);
    }

    fx.write("config.yaml", b"port: 1");
    scheduler.trigger_now().await.unwrap();
    assert_eq!(scheduler.status().consecutive_failures, 0);
    assert!(scheduler.status().last_error.is_none());
    scheduler.stop().await;
}

#[tokio::test]
async fn test_in_flight_trigger_is_rejected_without_recording() {
    let fx = fixture(10).await;
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap());
    let scheduler = SchedulerService::new(
        fx.service.clone(),
        &scheduler_config("0 2 * * *"),
        BTreeSet::from([ContentGroup::Config]),
        Arc::new(clock.clone()),
    )
    .await
    .unwrap();

    let held = fx.service.job_slot().try_acquire().unwrap();
    let err = scheduler.trigger_now().await.unwrap_err();
    assert!(matches!(err, BackupError::InFlight));
    assert_eq!(scheduler.status().last_status, LastStatus::NeverRun);
    assert!(scheduler.status().last_run_at.is_none());
    drop(held);

    assert_eq!(clock.now(), Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap());
}

#[tokio::test]
async fn test_stop_waits_for_running_scheduled_job() {
    let gate = Gate::new();
    let fx = fixture_with(
        10,
        |root: &Path| -> Vec<Arc<dyn ContentSource>> {
            let config: Arc<dyn ContentSource> = Arc::new(GatedSource(
                FileSource::new(ContentGroup::Config, root.join("live/config.yaml")),
                gate.clone(),
            ));
            vec![config]
        },
        None,
    )
    .await;

    let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
    let clock = ManualClock::new(start);
    let scheduler = SchedulerService::new(
        fx.service.clone(),
        &scheduler_config("*/5 * * * *"),
        BTreeSet::from([ContentGroup::Config]),
        Arc::new(clock.clone()),
    )
    .await
    .unwrap();
    scheduler.start();

    clock.advance(Duration::minutes(5));
    tokio::time::timeout(std::time::Duration::from_secs(10), gate.entered.notified())
        .await
        .expect("scheduled job did not start");
    assert_eq!(scheduler.status().lifecycle, SchedulerLifecycle::Running);

    let stopping = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.stop().await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(!stopping.is_finished());

    gate.release.add_permits(1);
    tokio::time::timeout(std::time::Duration::from_secs(10), stopping)
        .await
        .expect("stop did not return")
        .unwrap();

    // stop 返回时任务已经完成并记录
    let status = scheduler.status();
    assert_eq!(status.lifecycle, SchedulerLifecycle::Stopped);
    assert_eq!(status.last_status, LastStatus::Success);
    assert_eq!(fx.service.list().await.unwrap().len(), 1);
    assert!(fx.service.job_slot().try_acquire().is_ok());
}
