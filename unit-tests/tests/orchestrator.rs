//! Update cycles end to end against in-memory ports.

use embassy_futures::{
    block_on,
    select::{Either, select},
};
use embassy_time::{Duration, Timer};
use myrtio_ota::{
    BootError,
    BootRecord,
    BootSelector,
    CycleOutcome,
    FetchError,
    HttpArtifactClient,
    HttpVersionClient,
    ImageError,
    OrchestratorState,
    PartitionId,
    SessionError,
    UpdateConfig,
    UpdateError,
    UpdateOrchestrator,
    orchestrator::DEFAULT_POLL_INTERVAL,
};
use tests::{
    MemoryBootRecordStore,
    MockArtifact,
    MockArtifactSource,
    MockFirmwareStorage,
    MockFlash,
    MockVersionSource,
    RecordingRestart,
    SECTOR_SIZE,
    ScriptedConnector,
    ScriptedTransport,
    image_of_size,
    ok_response,
    version,
};

const PARTITION_SIZE: usize = 256 * SECTOR_SIZE;
const FIRMWARE_URL: &str = "http://updates.local/firmware.bin";

type Orchestrator = UpdateOrchestrator<
    'static,
    MockVersionSource,
    MockArtifactSource,
    MockFirmwareStorage,
    MemoryBootRecordStore,
    RecordingRestart,
>;

/// Handles that stay with the test after the ports move into the orchestrator.
struct Device {
    staging: MockFlash,
    active: MockFlash,
    opened: std::rc::Rc<std::cell::RefCell<Vec<PartitionId>>>,
    store: MemoryBootRecordStore,
    restarts: RecordingRestart,
}

impl Device {
    fn assert_untouched(&self) {
        assert_eq!(self.staging.erase_count(), 0);
        assert_eq!(self.staging.write_count(), 0);
        assert_eq!(self.active.erase_count(), 0);
        assert_eq!(self.active.write_count(), 0);
        assert_eq!(self.store.stores(), 0);
        assert_eq!(self.restarts.count.get(), 0);
    }
}

fn factory() -> BootRecord {
    BootRecord::new(PartitionId::Slot0, version("1.0.3"))
}

fn setup_with_storage(
    versions: MockVersionSource,
    artifacts: MockArtifactSource,
    storage: MockFirmwareStorage,
) -> (Orchestrator, Device) {
    let store = MemoryBootRecordStore::with_record(factory());
    let restarts = RecordingRestart::default();
    let device = Device {
        staging: storage.slot(PartitionId::Slot1),
        active: storage.slot(PartitionId::Slot0),
        opened: storage.opened.clone(),
        store: store.clone(),
        restarts: restarts.clone(),
    };

    let orchestrator = UpdateOrchestrator::new(
        versions,
        artifacts,
        storage,
        BootSelector::new(store, factory()),
        restarts,
        UpdateConfig::new(FIRMWARE_URL),
    );
    (orchestrator, device)
}

fn setup(versions: MockVersionSource, artifacts: MockArtifactSource) -> (Orchestrator, Device) {
    setup_with_storage(versions, artifacts, MockFirmwareStorage::new(PARTITION_SIZE))
}

fn serving(image: Vec<u8>) -> MockArtifactSource {
    MockArtifactSource::new(MockArtifact::new(image))
}

// -----------------------------------------------------------------------------
// Scenarios
// -----------------------------------------------------------------------------

#[test]
fn same_version_is_up_to_date() {
    let artifacts = serving(image_of_size(4096));
    let opens = artifacts.opens.clone();
    let (mut orchestrator, device) = setup(MockVersionSource::new().returning("1.0.3"), artifacts);

    assert_eq!(block_on(orchestrator.run_cycle()), CycleOutcome::UpToDate);
    assert_eq!(orchestrator.state(), OrchestratorState::Idle);
    assert_eq!(opens.get(), 0);
    assert!(device.opened.borrow().is_empty());
    device.assert_untouched();
}

#[test]
fn new_version_is_installed_to_staging_partition() {
    let image = image_of_size(900_000);
    let (mut orchestrator, device) =
        setup(MockVersionSource::new().returning("1.0.4"), serving(image.clone()));

    assert_eq!(block_on(orchestrator.run_cycle()), CycleOutcome::Updated);
    assert_eq!(orchestrator.state(), OrchestratorState::Rebooting);

    assert_eq!(device.opened.borrow().as_slice(), [PartitionId::Slot1]);
    assert_eq!(&device.staging.contents()[..image.len()], image.as_slice());
    assert_eq!(device.active.write_count(), 0);
    assert_eq!(device.active.erase_count(), 0);

    let expected = BootRecord {
        active: PartitionId::Slot1,
        version: version("1.0.4"),
        previous: Some((PartitionId::Slot0, version("1.0.3"))),
    };
    assert_eq!(device.store.record(), Some(expected));
    assert_eq!(orchestrator.boot().current(), PartitionId::Slot1);
    assert_eq!(device.restarts.count.get(), 1);
}

#[test]
fn truncated_download_is_discarded() {
    let mut artifact = MockArtifact::new(image_of_size(900_000));
    artifact.cut_at = Some(500_000);
    let (mut orchestrator, device) = setup(
        MockVersionSource::new().returning("1.0.4"),
        MockArtifactSource::new(artifact),
    );

    assert_eq!(
        block_on(orchestrator.run_cycle()),
        CycleOutcome::Failed(UpdateError::Session(SessionError::SizeMismatch))
    );
    assert_eq!(orchestrator.state(), OrchestratorState::Idle);
    assert!(device.staging.is_erased(0, SECTOR_SIZE));
    assert_eq!(device.store.record(), Some(factory()));
    assert_eq!(device.store.stores(), 0);
    assert_eq!(device.restarts.count.get(), 0);
    assert_eq!(orchestrator.boot().current(), PartitionId::Slot0);
}

#[test]
fn unreachable_server_retries_next_cycle() {
    let versions = MockVersionSource::new()
        .failing(FetchError::Transport)
        .returning("1.0.3");
    let calls = versions.calls.clone();
    let (mut orchestrator, device) = setup(versions, serving(image_of_size(4096)));

    assert_eq!(
        block_on(orchestrator.run_cycle()),
        CycleOutcome::Failed(UpdateError::Fetch(FetchError::Transport))
    );
    assert_eq!(orchestrator.state(), OrchestratorState::Idle);
    assert!(device.opened.borrow().is_empty());

    assert_eq!(block_on(orchestrator.run_cycle()), CycleOutcome::UpToDate);
    assert_eq!(calls.get(), 2);
    device.assert_untouched();
}

#[test]
fn oversized_image_never_touches_flash() {
    let mut artifact = MockArtifact::new(image_of_size(4096));
    artifact.declared = Some(2 * 1024 * 1024);
    let (mut orchestrator, device) = setup(
        MockVersionSource::new().returning("1.0.4"),
        MockArtifactSource::new(artifact),
    );

    assert_eq!(
        block_on(orchestrator.run_cycle()),
        CycleOutcome::Failed(UpdateError::Session(SessionError::InsufficientSpace))
    );
    device.assert_untouched();
}

// -----------------------------------------------------------------------------
// Failure paths
// -----------------------------------------------------------------------------

#[test]
fn unknown_length_is_refused() {
    for declared in [None, Some(0)] {
        let mut artifact = MockArtifact::new(image_of_size(4096));
        artifact.declared = declared;
        let (mut orchestrator, device) = setup(
            MockVersionSource::new().returning("1.0.4"),
            MockArtifactSource::new(artifact),
        );

        assert_eq!(
            block_on(orchestrator.run_cycle()),
            CycleOutcome::Failed(UpdateError::MissingLength)
        );
        assert!(device.opened.borrow().is_empty());
        device.assert_untouched();
    }
}

#[test]
fn missing_artifact_is_protocol_failure() {
    let (mut orchestrator, device) = setup(
        MockVersionSource::new().returning("1.0.4"),
        MockArtifactSource::failing(FetchError::Protocol(404)),
    );

    assert_eq!(
        block_on(orchestrator.run_cycle()),
        CycleOutcome::Failed(UpdateError::Fetch(FetchError::Protocol(404)))
    );
    device.assert_untouched();
}

#[test]
fn malformed_remote_version_is_not_an_update() {
    let versions = MockVersionSource::new().failing(FetchError::InvalidVersion(
        myrtio_ota::VersionError::InvalidCharacter,
    ));
    let (mut orchestrator, device) = setup(versions, serving(image_of_size(4096)));

    assert!(matches!(
        block_on(orchestrator.run_cycle()),
        CycleOutcome::Failed(UpdateError::Fetch(FetchError::InvalidVersion(_)))
    ));
    device.assert_untouched();
}

#[test]
fn stream_failure_aborts_session() {
    let mut artifact = MockArtifact::new(image_of_size(64 * 1024));
    artifact.fail_at = Some(20 * 1024);
    let (mut orchestrator, device) = setup(
        MockVersionSource::new().returning("1.0.4"),
        MockArtifactSource::new(artifact),
    );

    assert_eq!(
        block_on(orchestrator.run_cycle()),
        CycleOutcome::Failed(UpdateError::Fetch(FetchError::Transport))
    );
    assert!(device.staging.is_erased(0, SECTOR_SIZE));
    assert_eq!(device.store.stores(), 0);
    assert_eq!(device.restarts.count.get(), 0);
}

#[test]
fn corrupt_image_is_never_selected() {
    let mut image = image_of_size(64 * 1024);
    image[1000] ^= 0x01;
    let (mut orchestrator, device) =
        setup(MockVersionSource::new().returning("1.0.4"), serving(image));

    assert_eq!(
        block_on(orchestrator.run_cycle()),
        CycleOutcome::Failed(UpdateError::Session(SessionError::Validation(
            ImageError::Checksum
        )))
    );
    assert!(device.staging.is_erased(0, SECTOR_SIZE));
    assert_eq!(device.store.stores(), 0);
    assert_eq!(orchestrator.boot().current(), PartitionId::Slot0);
}

#[test]
fn flash_fault_aborts_update() {
    let storage = MockFirmwareStorage::new(PARTITION_SIZE);
    storage.slot(PartitionId::Slot1).fail_writes_from(32 * 1024);
    let (mut orchestrator, device) = setup_with_storage(
        MockVersionSource::new().returning("1.0.4"),
        serving(image_of_size(64 * 1024)),
        storage,
    );

    assert_eq!(
        block_on(orchestrator.run_cycle()),
        CycleOutcome::Failed(UpdateError::Session(SessionError::Write))
    );
    assert!(device.staging.is_erased(0, SECTOR_SIZE));
    assert_eq!(device.store.stores(), 0);
}

#[test]
fn unavailable_partition_fails_cycle() {
    let mut storage = MockFirmwareStorage::new(PARTITION_SIZE);
    storage.fail_open = true;
    let (mut orchestrator, device) = setup_with_storage(
        MockVersionSource::new().returning("1.0.4"),
        serving(image_of_size(4096)),
        storage,
    );

    assert_eq!(
        block_on(orchestrator.run_cycle()),
        CycleOutcome::Failed(UpdateError::Session(SessionError::Partition))
    );
    device.assert_untouched();
}

#[test]
fn persist_failure_keeps_running_image_selected() {
    let (mut orchestrator, device) = setup(
        MockVersionSource::new().returning("1.0.4"),
        serving(image_of_size(64 * 1024)),
    );
    device.store.set_failing(true);

    assert_eq!(
        block_on(orchestrator.run_cycle()),
        CycleOutcome::Failed(UpdateError::Boot(BootError::Persist))
    );
    assert_eq!(orchestrator.boot().current(), PartitionId::Slot0);
    assert_eq!(orchestrator.boot().version(), &version("1.0.3"));
    assert!(device.staging.is_erased(0, SECTOR_SIZE));
    assert_eq!(device.restarts.count.get(), 0);
}

// -----------------------------------------------------------------------------
// Properties
// -----------------------------------------------------------------------------

#[test]
fn fetched_version_is_the_one_recorded() {
    let versions = MockVersionSource::new().returning("1.0.4").returning("1.0.5");
    let calls = versions.calls.clone();
    let (mut orchestrator, device) = setup(versions, serving(image_of_size(4096)));

    assert_eq!(block_on(orchestrator.run_cycle()), CycleOutcome::Updated);
    assert_eq!(calls.get(), 1);
    assert_eq!(
        device.store.record().map(|record| record.version),
        Some(version("1.0.4"))
    );
}

#[test]
fn installed_version_is_up_to_date_afterwards() {
    let versions = MockVersionSource::new().returning("1.0.4").returning("1.0.4");
    let (mut orchestrator, device) = setup(versions, serving(image_of_size(4096)));

    assert_eq!(block_on(orchestrator.run_cycle()), CycleOutcome::Updated);
    let writes = device.staging.write_count();

    assert_eq!(block_on(orchestrator.run_cycle()), CycleOutcome::UpToDate);
    assert_eq!(device.staging.write_count(), writes);
    assert_eq!(device.store.stores(), 1);
}

#[test]
fn downgrade_is_installed_like_any_other_version() {
    let (mut orchestrator, device) = setup(
        MockVersionSource::new().returning("1.0.2"),
        serving(image_of_size(4096)),
    );

    assert_eq!(block_on(orchestrator.run_cycle()), CycleOutcome::Updated);
    assert_eq!(
        device.store.record().map(|record| record.version),
        Some(version("1.0.2"))
    );
}

#[test]
fn update_from_second_partition_targets_first() {
    let storage = MockFirmwareStorage::new(PARTITION_SIZE);
    let opened = storage.opened.clone();
    let slot0 = storage.slot(PartitionId::Slot0);
    let store = MemoryBootRecordStore::with_record(BootRecord::new(
        PartitionId::Slot1,
        version("1.0.4"),
    ));
    let image = image_of_size(8192);

    let mut orchestrator = UpdateOrchestrator::new(
        MockVersionSource::new().returning("1.0.5"),
        serving(image.clone()),
        storage,
        BootSelector::new(store.clone(), factory()),
        RecordingRestart::default(),
        UpdateConfig::new(FIRMWARE_URL),
    );

    assert_eq!(block_on(orchestrator.run_cycle()), CycleOutcome::Updated);
    assert_eq!(opened.borrow().as_slice(), [PartitionId::Slot0]);
    assert_eq!(&slot0.contents()[..image.len()], image.as_slice());
    assert_eq!(
        store.record().map(|record| record.active),
        Some(PartitionId::Slot0)
    );
}

#[test]
fn config_defaults_to_thirty_second_poll() {
    let config = UpdateConfig::new(FIRMWARE_URL);
    assert_eq!(config.poll_interval, DEFAULT_POLL_INTERVAL);
    assert_eq!(DEFAULT_POLL_INTERVAL, Duration::from_secs(30));
    assert_eq!(
        config.with_poll_interval(Duration::from_secs(5)).poll_interval,
        Duration::from_secs(5)
    );
}

// -----------------------------------------------------------------------------
// HTTP
// -----------------------------------------------------------------------------

#[test]
fn update_over_http() {
    let image = image_of_size(40_000);
    let version_server =
        ScriptedConnector::new().respond(ScriptedTransport::new(ok_response(b"1.0.4\n")));
    let firmware_server = ScriptedConnector::new()
        .respond(ScriptedTransport::new(ok_response(&image)).with_max_read(1460));
    let requests = firmware_server.requests.clone();
    let firmware_request = firmware_server.sent.clone();

    let storage = MockFirmwareStorage::new(PARTITION_SIZE);
    let staging = storage.slot(PartitionId::Slot1);
    let store = MemoryBootRecordStore::with_record(factory());
    let restarts = RecordingRestart::default();

    let mut orchestrator = UpdateOrchestrator::new(
        HttpVersionClient::new(version_server, "http://updates.local/version.txt"),
        HttpArtifactClient::new(firmware_server),
        storage,
        BootSelector::new(store.clone(), factory()),
        restarts.clone(),
        UpdateConfig::new(FIRMWARE_URL),
    );

    assert_eq!(block_on(orchestrator.run_cycle()), CycleOutcome::Updated);
    assert_eq!(&staging.contents()[..image.len()], image.as_slice());
    assert_eq!(
        store.record().map(|record| record.version),
        Some(version("1.0.4"))
    );
    assert_eq!(restarts.count.get(), 1);

    assert_eq!(requests.borrow().as_slice(), ["updates.local:80/firmware.bin"]);
    let sent = String::from_utf8(firmware_request.borrow().clone()).unwrap();
    assert!(sent.contains("Cache-Control: no-cache, no-store, must-revalidate\r\n"));
}

// -----------------------------------------------------------------------------
// Poll loop
// -----------------------------------------------------------------------------

#[test]
fn run_sleeps_for_the_poll_interval_between_cycles() {
    let versions = MockVersionSource::new()
        .returning("1.0.3")
        .failing(FetchError::Transport)
        .returning("1.0.3");
    let calls = versions.calls.clone();
    let store = MemoryBootRecordStore::with_record(factory());
    let mut orchestrator = UpdateOrchestrator::new(
        versions,
        serving(image_of_size(4096)),
        MockFirmwareStorage::new(PARTITION_SIZE),
        BootSelector::new(store, factory()),
        RecordingRestart::default(),
        UpdateConfig::new(FIRMWARE_URL).with_poll_interval(Duration::from_millis(300)),
    );

    let observed = block_on(async {
        let watch = async {
            Timer::after(Duration::from_millis(100)).await;
            let first = calls.get();
            Timer::after(Duration::from_millis(350)).await;
            (first, calls.get())
        };
        match select(orchestrator.run(), watch).await {
            Either::First(never) => match never {},
            Either::Second(counts) => counts,
        }
    });

    // One cycle right away, the next only once the interval has passed
    assert_eq!(observed, (1, 2));
}
