//! Update cycle state machine and its polling loop.

use embassy_time::{Duration, Timer};

use crate::{
    boot::{BootRecordStore, BootSelector},
    error::UpdateError,
    partition::FirmwareStorage,
    session::FlashWriteSession,
    source::{ArtifactSource, ArtifactStream, VersionSource},
};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

const PROGRESS_STEP: u8 = 10;

#[derive(Debug, Clone, Copy)]
pub struct UpdateConfig<'a> {
    pub artifact_url: &'a str,
    pub poll_interval: Duration,
}

impl<'a> UpdateConfig<'a> {
    pub const fn new(artifact_url: &'a str) -> Self {
        Self {
            artifact_url,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Device-wide restart.
pub trait Restart {
    fn restart(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Idle,
    CheckingVersion,
    UpToDate,
    NewVersionFound,
    Downloading,
    Writing,
    Finalizing,
    Success,
    Rebooting,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    UpToDate,
    /// New image selected for boot and restart requested
    Updated,
    Failed(UpdateError),
}

fn enter(state: &mut OrchestratorState, next: OrchestratorState) {
    log::debug!("ota: {:?} -> {:?}", *state, next);
    *state = next;
}

struct ProgressLog {
    next_step: u8,
}

impl ProgressLog {
    fn new() -> Self {
        Self {
            next_step: PROGRESS_STEP,
        }
    }

    fn report(&mut self, percent: u8, written: usize, total: usize) {
        if percent < self.next_step {
            return;
        }
        log::info!("ota: progress {}% ({}/{} bytes)", percent, written, total);
        self.next_step = (percent / PROGRESS_STEP + 1).saturating_mul(PROGRESS_STEP);
    }
}

/// Drives version checks, downloads and boot selection.
pub struct UpdateOrchestrator<'a, V, A, F, S, R>
where
    V: VersionSource,
    A: ArtifactSource,
    F: FirmwareStorage,
    S: BootRecordStore,
    R: Restart,
{
    versions: V,
    artifacts: A,
    storage: F,
    boot: BootSelector<S>,
    restart: R,
    config: UpdateConfig<'a>,
    state: OrchestratorState,
}

impl<'a, V, A, F, S, R> UpdateOrchestrator<'a, V, A, F, S, R>
where
    V: VersionSource,
    A: ArtifactSource,
    F: FirmwareStorage,
    S: BootRecordStore,
    R: Restart,
{
    pub fn new(
        versions: V,
        artifacts: A,
        storage: F,
        boot: BootSelector<S>,
        restart: R,
        config: UpdateConfig<'a>,
    ) -> Self {
        Self {
            versions,
            artifacts,
            storage,
            boot,
            restart,
            config,
            state: OrchestratorState::Idle,
        }
    }

    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    pub fn boot(&self) -> &BootSelector<S> {
        &self.boot
    }

    /// Poll forever, one cycle per interval.
    pub async fn run(&mut self) -> ! {
        log::info!(
            "ota: running {} from {:?}, polling every {}s",
            self.boot.version(),
            self.boot.current(),
            self.config.poll_interval.as_secs()
        );
        loop {
            self.run_cycle().await;
            Timer::after(self.config.poll_interval).await;
        }
    }

    /// Run one complete update cycle.
    pub async fn run_cycle(&mut self) -> CycleOutcome {
        match self.try_update().await {
            Ok(false) => {
                log::info!("ota: up to date ({})", self.boot.version());
                enter(&mut self.state, OrchestratorState::Idle);
                CycleOutcome::UpToDate
            }
            Ok(true) => {
                enter(&mut self.state, OrchestratorState::Rebooting);
                log::info!("ota: update successful, rebooting...");
                self.restart.restart();
                CycleOutcome::Updated
            }
            Err(e) => {
                enter(&mut self.state, OrchestratorState::Failed);
                match e {
                    UpdateError::Boot(_) => log::error!("ota: update abandoned: {:?}", e),
                    _ => log::warn!("ota: update cycle failed: {:?}", e),
                }
                enter(&mut self.state, OrchestratorState::Idle);
                CycleOutcome::Failed(e)
            }
        }
    }

    /// Returns `true` when a new image was selected for boot.
    async fn try_update(&mut self) -> Result<bool, UpdateError> {
        enter(&mut self.state, OrchestratorState::CheckingVersion);
        let remote = self.versions.fetch_version().await?;
        if remote == *self.boot.version() {
            enter(&mut self.state, OrchestratorState::UpToDate);
            return Ok(false);
        }

        enter(&mut self.state, OrchestratorState::NewVersionFound);
        log::info!(
            "ota: new version {} available, running {}",
            remote,
            self.boot.version()
        );

        enter(&mut self.state, OrchestratorState::Downloading);
        let mut stream = self.artifacts.open(self.config.artifact_url).await?;
        let total_size = match stream.declared_length() {
            Some(length) if length > 0 => length,
            _ => return Err(UpdateError::MissingLength),
        };

        let partition = self.boot.staging();
        let flash = self.storage.open_partition(partition)?;
        let mut session =
            FlashWriteSession::open(partition, flash, self.storage.validator(), total_size)?;
        log::info!(
            "ota: starting update, size={} bytes, target {:?}",
            total_size,
            partition
        );

        enter(&mut self.state, OrchestratorState::Writing);
        let mut progress = ProgressLog::new();
        loop {
            let chunk = match stream.next_chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => {
                    session.abort();
                    return Err(e.into());
                }
            };
            session.write(chunk)?;
            progress.report(
                session.progress_percent(),
                session.bytes_written(),
                session.total_size(),
            );
        }

        enter(&mut self.state, OrchestratorState::Finalizing);
        let image = session.finalize()?;

        enter(&mut self.state, OrchestratorState::Success);
        if let Err(e) = self.boot.mark_bootable(image, remote) {
            session.abort();
            return Err(e.into());
        }
        Ok(true)
    }
}
