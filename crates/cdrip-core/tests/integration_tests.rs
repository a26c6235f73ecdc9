//! Integration tests for cdrip-core
//!
//! These tests rip from a simulated drive into temporary directories and
//! check the sessions end to end.

use cdrip_core::{
    AudioDrive, ComparisonConfig, Error, JitterCorrector, OutputConfig, ParanoiaConfig,
    ParanoiaRipper, ReadFormat, Result, Rip, RipManifest, RipProgress, RipSession, RipStatus,
    RipTarget, RippingStrategy, SectorRange, SectorVerdict, SessionReport, Toc, CDDA_SECTOR_SIZE,
    ERROR_FLAGS_SIZE,
};
use mockall::mock;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tempfile::{NamedTempFile, TempDir};
use tracing_subscriber::EnvFilter;

/// Route rip logs to the test harness (`RUST_LOG=cdrip_core=debug` to see them)
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_test_writer()
        .try_init();
}

// ============================================================================
// Simulated drive
// ============================================================================

/// Pseudo-random audio with no repeating windows
fn audio_byte(position: i64) -> u8 {
    (position as u64)
        .wrapping_mul(0x9E37_79B9_7F4A_7C15)
        .rotate_left(23) as u8
}

fn true_sector(sector: u64) -> Vec<u8> {
    let base = sector as i64 * CDDA_SECTOR_SIZE as i64;
    (0..CDDA_SECTOR_SIZE as i64)
        .map(|i| audio_byte(base + i))
        .collect()
}

/// Disc of two tracks read through a drive with scripted faults
struct SimulatedDrive {
    toc: Toc,
    /// Device bytes lag the true audio by this many bytes
    shift_bytes: i64,
    /// Every read returns different bytes
    unstable: HashSet<u64>,
    /// Only the first read is corrupted
    first_read_bad: HashSet<u64>,
    /// C2 pointers always set
    c2: HashSet<u64>,
    /// Reading these reports a lost device
    lost: HashSet<u64>,
    reads_per_sector: HashMap<u64, u32>,
    reads: Vec<(u64, u32)>,
    cache_clears: u32,
    stop_after_reads: Option<(RipProgress, usize)>,
}

impl SimulatedDrive {
    fn new() -> Self {
        Self {
            toc: Toc::single_session(&[0, 3000], 6000).unwrap(),
            shift_bytes: 0,
            unstable: HashSet::new(),
            first_read_bad: HashSet::new(),
            c2: HashSet::new(),
            lost: HashSet::new(),
            reads_per_sector: HashMap::new(),
            reads: Vec::new(),
            cache_clears: 0,
            stop_after_reads: None,
        }
    }

    /// Drive that reads `samples` late, as a drive with that offset does
    fn shifted(samples: i64) -> Self {
        Self {
            shift_bytes: samples * 4,
            ..Self::new()
        }
    }
}

impl AudioDrive for SimulatedDrive {
    fn device_path(&self) -> &str {
        "/dev/simulated"
    }

    fn toc(&self) -> &Toc {
        &self.toc
    }

    fn cache_size(&self) -> usize {
        0
    }

    fn set_cache_size(&mut self, _bytes: usize) {}

    fn speed(&self) -> u16 {
        0
    }

    fn set_speed(&mut self, _speed: u16) -> Result<()> {
        Ok(())
    }

    fn clear_cache(&mut self, _range: &SectorRange, _progress: &RipProgress) -> Result<()> {
        self.cache_clears += 1;
        Ok(())
    }

    fn read_mcn(&mut self) -> Result<Option<String>> {
        Ok(Some("0724384260910".to_string()))
    }

    fn read_isrc(&mut self, track: u8) -> Result<Option<String>> {
        Ok(Some(format!("USRC1770000{track}")))
    }

    fn read_sectors(
        &mut self,
        buffer: &mut [u8],
        start: u64,
        count: u32,
        format: ReadFormat,
    ) -> Result<u32> {
        self.reads.push((start, count));
        if let Some((progress, limit)) = &self.stop_after_reads {
            if self.reads.len() >= *limit {
                progress.stop();
            }
        }

        let stride = format.bytes_per_sector();
        for i in 0..count as usize {
            let sector = start + i as u64;
            if self.lost.contains(&sector) {
                return Err(Error::Device("medium removed".to_string()));
            }
            let read_number = {
                let n = self.reads_per_sector.entry(sector).or_insert(0);
                *n += 1;
                *n
            };

            let out = &mut buffer[i * stride..(i + 1) * stride];
            let base = sector as i64 * CDDA_SECTOR_SIZE as i64 - self.shift_bytes;
            for (j, byte) in out[..CDDA_SECTOR_SIZE].iter_mut().enumerate() {
                *byte = audio_byte(base + j as i64);
            }
            if self.unstable.contains(&sector) {
                out[0] ^= read_number as u8;
                out[1] ^= (read_number >> 8) as u8 | 0x80;
            }
            if read_number == 1 && self.first_read_bad.contains(&sector) {
                out[500] ^= 0xFF;
            }
            if format.error_flags {
                let c2 = &mut out[CDDA_SECTOR_SIZE..CDDA_SECTOR_SIZE + ERROR_FLAGS_SIZE];
                c2.fill(0);
                if self.c2.contains(&sector) {
                    c2[10] = 0x04;
                }
            }
        }
        Ok(count)
    }
}

fn comparison(config: ComparisonConfig) -> RippingStrategy {
    RippingStrategy::Comparison(config)
}

fn run_session(
    drive: &mut SimulatedDrive,
    strategy: RippingStrategy,
    dir: &Path,
    targets: Vec<RipTarget>,
) -> SessionReport {
    init_tracing();
    RipSession::new(strategy, OutputConfig::new(dir))
        .with_targets(targets)
        .run(drive)
        .unwrap()
}

fn read_file(path: &Path) -> Vec<u8> {
    std::fs::read(path).unwrap()
}

// ============================================================================
// Comparison ripping
// ============================================================================

#[test]
fn test_clean_disc_needs_exactly_required_passes() {
    let dir = TempDir::new().unwrap();
    let mut drive = SimulatedDrive::new();
    let range = SectorRange::new(1000, 1199);

    let report = run_session(
        &mut drive,
        comparison(ComparisonConfig::new().required_matches(3)),
        dir.path(),
        vec![RipTarget::new(range)],
    );

    assert_eq!(report.status(), RipStatus::Completed);
    assert!(report.is_accurate());
    assert_eq!(report.ranges[0].passes, 3);
    assert_eq!(drive.cache_clears, 2);

    let data = read_file(report.ranges[0].rip.as_deref().unwrap());
    assert_eq!(data.len(), 200 * CDDA_SECTOR_SIZE);
    assert_eq!(&data[..CDDA_SECTOR_SIZE], true_sector(1000).as_slice());
    assert_eq!(&data[199 * CDDA_SECTOR_SIZE..], true_sector(1199).as_slice());
}

#[test]
fn test_disagreeing_sector_is_flagged_and_session_completes() {
    let dir = TempDir::new().unwrap();
    let mut drive = SimulatedDrive::new();
    drive.unstable.insert(1050);

    let config = ComparisonConfig::new().maximum_retries(4);
    let report = run_session(
        &mut drive,
        comparison(config),
        dir.path(),
        vec![RipTarget::new(SectorRange::new(1000, 1099))],
    );

    let range = &report.ranges[0];
    assert_eq!(range.status, RipStatus::Completed);
    assert_eq!(range.flagged_sectors, 1);
    assert_eq!(range.retried_sectors, 1);
    assert_eq!(range.passes, 6);
    assert_eq!(drive.reads_per_sector[&1050], 6);
    assert_eq!(drive.reads_per_sector[&1049], 2);

    let manifest = RipManifest::load_from_path(range.manifest.as_ref().unwrap()).unwrap();
    assert_eq!(manifest.error_sectors(), vec![1050]);
    assert_eq!(manifest.range, SectorRange::new(1000, 1099));
    assert!(manifest.hashes.is_some());
}

#[test]
fn test_transient_corruption_is_outvoted() {
    let dir = TempDir::new().unwrap();
    let mut drive = SimulatedDrive::new();
    drive.first_read_bad.extend([2010, 2011, 2090]);

    let report = run_session(
        &mut drive,
        RippingStrategy::default(),
        dir.path(),
        vec![RipTarget::new(SectorRange::new(2000, 2099))],
    );

    let range = &report.ranges[0];
    assert!(report.is_accurate());
    assert_eq!(range.retried_sectors, 3);
    assert_eq!(range.passes, 3);

    let data = read_file(range.rip.as_deref().unwrap());
    let at = |sector: u64| {
        let i = (sector - 2000) as usize * CDDA_SECTOR_SIZE;
        data[i..i + CDDA_SECTOR_SIZE].to_vec()
    };
    assert_eq!(at(2010), true_sector(2010));
    assert_eq!(at(2090), true_sector(2090));
}

#[test]
fn test_c2_marked_sector_never_reaches_consensus() {
    let dir = TempDir::new().unwrap();
    let mut drive = SimulatedDrive::new();
    drive.c2.insert(500);

    let config = ComparisonConfig::new().use_c2(true).maximum_retries(2);
    let report = run_session(
        &mut drive,
        comparison(config),
        dir.path(),
        vec![RipTarget::new(SectorRange::new(480, 519))],
    );

    assert_eq!(report.status(), RipStatus::Completed);
    assert_eq!(report.ranges[0].flagged_sectors, 1);
    let manifest = RipManifest::load_from_path(report.ranges[0].manifest.as_ref().unwrap()).unwrap();
    assert_eq!(manifest.error_sectors(), vec![500]);
}

#[test]
fn test_offset_equivalence() {
    let range = SectorRange::new(1500, 1599);

    for samples in [667i32, -30, 588, -1176] {
        let plain_dir = TempDir::new().unwrap();
        let mut plain = SimulatedDrive::new();
        let reference = run_session(
            &mut plain,
            comparison(ComparisonConfig::new()),
            plain_dir.path(),
            vec![RipTarget::new(range)],
        );

        let shifted_dir = TempDir::new().unwrap();
        let mut shifted = SimulatedDrive::shifted(i64::from(samples));
        let corrected = run_session(
            &mut shifted,
            comparison(ComparisonConfig::new().drive_offset(samples)),
            shifted_dir.path(),
            vec![RipTarget::new(range)],
        );

        assert!(corrected.is_accurate(), "offset {samples}");
        assert_eq!(
            read_file(reference.ranges[0].rip.as_deref().unwrap()),
            read_file(corrected.ranges[0].rip.as_deref().unwrap()),
            "offset {samples}"
        );
    }
}

#[test]
fn test_hash_and_byte_comparison_agree() {
    let mut outputs = Vec::new();
    for use_hashes in [true, false] {
        let dir = TempDir::new().unwrap();
        let mut drive = SimulatedDrive::new();
        drive.unstable.insert(2520);
        drive.first_read_bad.extend([2505, 2530]);

        let config = ComparisonConfig::new()
            .use_hashes(use_hashes)
            .maximum_retries(3);
        let report = run_session(
            &mut drive,
            comparison(config),
            dir.path(),
            vec![RipTarget::new(SectorRange::new(2500, 2549))],
        );

        let range = &report.ranges[0];
        let manifest = RipManifest::load_from_path(range.manifest.as_ref().unwrap()).unwrap();
        assert_eq!(manifest.hashes.is_some(), use_hashes);
        outputs.push((
            read_file(range.rip.as_deref().unwrap()),
            manifest.error_sectors(),
            range.flagged_sectors,
            range.retried_sectors,
            range.passes,
        ));
    }
    assert_eq!(outputs[0], outputs[1]);
    assert_eq!(outputs[0].1, vec![2520]);
}

#[test]
fn test_cancellation_stops_reading() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let mut drive = SimulatedDrive::new();
    let session = RipSession::new(
        comparison(ComparisonConfig::new().sectors_per_read(24)),
        OutputConfig::new(dir.path()),
    )
    .with_targets([
        RipTarget::new(SectorRange::new(0, 199)),
        RipTarget::new(SectorRange::new(3000, 3199)),
    ]);
    drive.stop_after_reads = Some((session.progress(), 3));

    let report = session.run(&mut drive).unwrap();

    assert_eq!(report.status(), RipStatus::Stopped);
    assert_eq!(drive.reads.len(), 3);
    assert_eq!(report.ranges[0].status, RipStatus::Stopped);
    assert_eq!(report.ranges[1].status, RipStatus::Stopped);
    assert_eq!(report.ranges[1].unfinished_sectors, 200);
    assert_eq!(report.ranges[1].passes, 0);
    assert!(session.progress().snapshot().stopped);

    // Nothing reached consensus after one partial pass, so everything is flagged
    let manifest = RipManifest::load_from_path(report.ranges[0].manifest.as_ref().unwrap()).unwrap();
    assert_eq!(manifest.error_count(), 200);

    // The range after the stop leaves nothing behind
    assert_eq!(report.ranges[1].rip, None);
    assert_eq!(report.ranges[1].manifest, None);
    assert!(!dir.path().join("sectors-3000-3199.pcm").exists());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
}

#[test]
fn test_stop_during_second_pass_keeps_committed_sectors() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let mut drive = SimulatedDrive::new();
    drive.first_read_bad.extend([1005, 1030]);

    let range = SectorRange::new(1000, 1099);
    let session = RipSession::new(
        comparison(
            ComparisonConfig::new()
                .required_matches(2)
                .sectors_per_read(24),
        ),
        OutputConfig::new(dir.path()),
    )
    .with_targets([RipTarget::new(range)]);
    // Pass 1 takes five reads; the stop lands during the second read of pass 2
    drive.stop_after_reads = Some((session.progress(), 7));

    let report = session.run(&mut drive).unwrap();
    let ripped = &report.ranges[0];
    assert_eq!(ripped.status, RipStatus::Stopped);
    assert_eq!(ripped.passes, 2);
    assert_eq!(drive.reads.len(), 7);

    // 1000..=1023 agree across both passes except 1005; the first sector of
    // the interrupted batch is still accounted for before the stop is seen
    let committed: Vec<u64> = (1000..=1024).filter(|&s| s != 1005).collect();
    assert_eq!(ripped.unfinished_sectors, 100 - committed.len() as u64);
    assert_eq!(ripped.flagged_sectors, 0);

    let manifest = RipManifest::load_from_path(ripped.manifest.as_ref().unwrap()).unwrap();
    let expected_errors: Vec<u64> = (1000..=1099).filter(|s| !committed.contains(s)).collect();
    assert_eq!(manifest.error_sectors(), expected_errors);

    let data = read_file(ripped.rip.as_deref().unwrap());
    for &sector in &committed {
        let i = (sector - 1000) as usize * CDDA_SECTOR_SIZE;
        assert_eq!(&data[i..i + CDDA_SECTOR_SIZE], true_sector(sector).as_slice(), "sector {sector}");
    }
}

/// Simulated drive that flushes its cache with the stock [`AudioDrive::clear_cache`]
struct FlushingDrive {
    inner: SimulatedDrive,
    cache_bytes: usize,
}

impl AudioDrive for FlushingDrive {
    fn device_path(&self) -> &str {
        self.inner.device_path()
    }

    fn toc(&self) -> &Toc {
        self.inner.toc()
    }

    fn cache_size(&self) -> usize {
        self.cache_bytes
    }

    fn set_cache_size(&mut self, bytes: usize) {
        self.cache_bytes = bytes;
    }

    fn speed(&self) -> u16 {
        0
    }

    fn set_speed(&mut self, _speed: u16) -> Result<()> {
        Ok(())
    }

    fn read_sectors(
        &mut self,
        buffer: &mut [u8],
        start: u64,
        count: u32,
        format: ReadFormat,
    ) -> Result<u32> {
        self.inner.read_sectors(buffer, start, count, format)
    }
}

#[test]
fn test_stop_during_cache_flush_ends_the_range() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    // 400 sectors of cache take a 500 sector flush
    let mut drive = FlushingDrive {
        inner: SimulatedDrive::new(),
        cache_bytes: 400 * CDDA_SECTOR_SIZE,
    };

    let session = RipSession::new(
        comparison(ComparisonConfig::new().required_matches(2)),
        OutputConfig::new(dir.path()),
    )
    .with_targets([RipTarget::new(SectorRange::new(0, 9))]);
    // Read 1 is pass 1; read 2 is the first flush read
    drive.inner.stop_after_reads = Some((session.progress(), 2));

    let report = session.run(&mut drive).unwrap();

    assert_eq!(report.status(), RipStatus::Stopped);
    assert_eq!(drive.inner.reads.len(), 2);
    assert_eq!(drive.inner.reads[1].0, 10);
    assert_eq!(report.ranges[0].unfinished_sectors, 10);
}

#[test]
fn test_device_loss_is_fatal_for_its_range_only() {
    let dir = TempDir::new().unwrap();
    let mut drive = SimulatedDrive::new();
    drive.lost.insert(3100);

    let report = run_session(
        &mut drive,
        RippingStrategy::default(),
        dir.path(),
        vec![
            RipTarget::new(SectorRange::new(3000, 3199)),
            RipTarget::new(SectorRange::new(100, 199)),
        ],
    );

    assert!(matches!(report.ranges[0].status, RipStatus::Fatal(ref reason) if reason.contains("medium removed")));
    assert_eq!(report.ranges[1].status, RipStatus::Completed);
    assert!(matches!(report.status(), RipStatus::Fatal(_)));
}

#[test]
fn test_progress_totals() {
    let dir = TempDir::new().unwrap();
    let mut drive = SimulatedDrive::new();
    let session = RipSession::new(
        comparison(ComparisonConfig::new().required_matches(2)),
        OutputConfig::new(dir.path()),
    )
    .with_targets([RipTarget::new(SectorRange::new(0, 99))]);

    session.run(&mut drive).unwrap();
    let snapshot = session.progress().snapshot();
    assert_eq!(snapshot.grand_total_sectors, 200);
    assert_eq!(snapshot.sectors_read, 200);
    assert_eq!(snapshot.percentage(), 100.0);
}

// ============================================================================
// Session output
// ============================================================================

#[test]
fn test_track_targets_and_metadata() {
    let dir = TempDir::new().unwrap();
    let mut drive = SimulatedDrive::new();
    let targets = RipTarget::audio_tracks(drive.toc());
    assert_eq!(targets.len(), 2);

    let short: Vec<RipTarget> = targets
        .into_iter()
        .map(|t| RipTarget {
            range: SectorRange::with_length(t.range.first(), 50),
            ..t
        })
        .collect();
    let report = run_session(
        &mut drive,
        comparison(ComparisonConfig::new().required_matches(1)),
        dir.path(),
        short,
    );

    assert_eq!(report.mcn.as_deref(), Some("0724384260910"));
    assert_eq!(report.device_path, "/dev/simulated");
    assert_eq!(report.strategy, "comparison");
    assert_eq!(report.ranges[1].track, Some(2));
    assert_eq!(report.ranges[1].isrc.as_deref(), Some("USRC17700002"));
    assert_eq!(report.ranges[1].rip, Some(dir.path().join("track02.pcm")));
    assert!(dir.path().join("track01.pcm.json").exists());
}

#[test]
fn test_existing_output_is_not_overwritten() {
    let dir = TempDir::new().unwrap();
    let target = RipTarget::new(SectorRange::new(0, 9));
    std::fs::write(dir.path().join(&target.file_name), b"keep me").unwrap();

    let mut drive = SimulatedDrive::new();
    let result = RipSession::new(RippingStrategy::default(), OutputConfig::new(dir.path()))
        .with_targets([target.clone()])
        .run(&mut drive);
    assert!(matches!(result, Err(Error::Io(_))));
    assert!(drive.reads.is_empty());

    let report = RipSession::new(
        RippingStrategy::default(),
        OutputConfig::new(dir.path()).overwrite(true).write_manifest(false),
    )
    .with_targets([target])
    .run(&mut drive)
    .unwrap();
    assert!(report.is_accurate());
    assert!(report.ranges[0].manifest.is_none());
}

#[test]
fn test_session_rejects_bad_targets() {
    let dir = TempDir::new().unwrap();
    let mut drive = SimulatedDrive::new();

    let empty = RipSession::new(RippingStrategy::default(), OutputConfig::new(dir.path()));
    assert!(matches!(empty.run(&mut drive), Err(Error::InvalidConfig(_))));

    let outside = RipSession::new(RippingStrategy::default(), OutputConfig::new(dir.path()))
        .with_targets([RipTarget::new(SectorRange::new(5990, 6010))]);
    assert!(matches!(outside.run(&mut drive), Err(Error::InvalidRange(_))));
}

#[test]
fn test_session_on_worker_thread() {
    let dir = TempDir::new().unwrap();
    let session = RipSession::new(RippingStrategy::default(), OutputConfig::new(dir.path()))
        .with_targets([RipTarget::new(SectorRange::new(10, 59))]);
    let progress = session.progress();

    let report = session.spawn(SimulatedDrive::new()).join().unwrap().unwrap();
    assert!(report.is_accurate());
    assert_eq!(progress.sectors_read(), 100);
}

// ============================================================================
// Paranoia ripping
// ============================================================================

#[test]
fn test_overlap_paranoia_session() {
    let dir = TempDir::new().unwrap();
    let mut drive = SimulatedDrive::new();
    let range = SectorRange::new(4000, 4039);

    let report = run_session(
        &mut drive,
        RippingStrategy::Paranoia(ParanoiaConfig::new()),
        dir.path(),
        vec![RipTarget::new(range)],
    );

    assert!(report.is_accurate());
    assert_eq!(report.strategy, "paranoia");
    let data = read_file(report.ranges[0].rip.as_deref().unwrap());
    let expected: Vec<u8> = range.iter().flat_map(true_sector).collect();
    assert_eq!(data, expected);
}

#[cfg(not(feature = "libcdio"))]
#[test]
fn test_libcdio_backend_requires_feature() {
    let dir = TempDir::new().unwrap();
    let mut drive = SimulatedDrive::new();
    let strategy = RippingStrategy::Paranoia(
        ParanoiaConfig::new().backend(cdrip_core::ParanoiaBackend::Libcdio),
    );
    let result = RipSession::new(strategy, OutputConfig::new(dir.path()))
        .with_targets([RipTarget::new(SectorRange::new(0, 9))])
        .run(&mut drive);
    assert!(matches!(result, Err(Error::InvalidConfig(_))));
}

mock! {
    Corrector {}

    impl JitterCorrector for Corrector {
        fn seek(&mut self, sector: u64) -> Result<()>;
        fn read_sector(&mut self) -> Result<SectorVerdict>;
    }
}

#[test]
fn test_paranoia_with_mock_corrector() {
    init_tracing();
    let range = SectorRange::new(100, 109);
    let file = NamedTempFile::new().unwrap();
    file.as_file().set_len(range.byte_size()).unwrap();
    let mut output = Rip::open(file.path(), range, true).unwrap();

    let mut position = 0u64;
    let mut corrector = MockCorrector::new();
    corrector.expect_seek().returning(|_| Ok(()));
    corrector.expect_read_sector().returning(move || {
        position += 1;
        // Sector 105 never verifies; everything else does on the first try
        Ok(if (6..=8).contains(&position) {
            SectorVerdict::Unverified(vec![position as u8; CDDA_SECTOR_SIZE])
        } else {
            SectorVerdict::Verified(vec![0x11; CDDA_SECTOR_SIZE])
        })
    });

    let config = ParanoiaConfig::new().maximum_retries(2);
    let outcome = ParanoiaRipper::new(&mut corrector, config, RipProgress::new())
        .rip_range(&range, &mut output)
        .unwrap();

    assert_eq!(outcome.status, RipStatus::Completed);
    assert_eq!(outcome.flagged_sectors, 1);
    assert_eq!(output.error_sectors(), vec![105]);
    // All copies were distinct, so the first one wins
    assert_eq!(output.data_for_sector(105).unwrap(), vec![6u8; CDDA_SECTOR_SIZE]);
    assert_eq!(output.data_for_sector(106).unwrap(), vec![0x11; CDDA_SECTOR_SIZE]);
    assert!(output.hash_for_sector(106).is_some());
}
