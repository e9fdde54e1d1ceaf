//! Host test doubles for the OTA crates.
//!
//! Flash, network and restart are replaced by in-memory implementations
//! that record what happened to them and can be told to fail.

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    rc::Rc,
};

use embedded_io::ErrorKind;
use embedded_storage::nor_flash::{
    ErrorType,
    NorFlash,
    NorFlashError,
    NorFlashErrorKind,
    ReadNorFlash,
};
use myrtio_core::http::{Connector, HttpError, Url};
use myrtio_ota::{
    ArtifactSource,
    ArtifactStream,
    BootError,
    BootRecord,
    BootRecordStore,
    EspImageValidator,
    FetchError,
    FirmwareStorage,
    PartitionId,
    Restart,
    SessionError,
    VersionDescriptor,
    VersionSource,
};
use sha2::{Digest, Sha256};

pub fn version(token: &str) -> VersionDescriptor {
    VersionDescriptor::from_str_trimmed(token).unwrap()
}

// -----------------------------------------------------------------------------
// Flash
// -----------------------------------------------------------------------------

pub const SECTOR_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockFlashError(pub NorFlashErrorKind);

impl NorFlashError for MockFlashError {
    fn kind(&self) -> NorFlashErrorKind {
        self.0
    }
}

#[derive(Debug, Default)]
struct FlashState {
    data: Vec<u8>,
    fail_writes_from: Option<usize>,
    fail_erases: bool,
    writes: usize,
    erases: usize,
    bytes_programmed: usize,
}

/// RAM backed NOR flash.
///
/// Erase sets bytes to `0xFF`, writes can only clear bits. Clones share the
/// same memory, so a test can keep a handle while the code under test owns
/// another one.
#[derive(Debug, Clone)]
pub struct MockFlash {
    state: Rc<RefCell<FlashState>>,
}

impl MockFlash {
    pub fn new(capacity: usize) -> Self {
        assert_eq!(capacity % SECTOR_SIZE, 0);
        Self {
            state: Rc::new(RefCell::new(FlashState {
                data: vec![0xFF; capacity],
                ..FlashState::default()
            })),
        }
    }

    /// Snapshot of the whole flash.
    pub fn contents(&self) -> Vec<u8> {
        self.state.borrow().data.clone()
    }

    pub fn is_erased(&self, start: usize, end: usize) -> bool {
        self.state.borrow().data[start..end].iter().all(|b| *b == 0xFF)
    }

    /// Fail every write that touches `offset` or anything after it.
    pub fn fail_writes_from(&self, offset: usize) {
        self.state.borrow_mut().fail_writes_from = Some(offset);
    }

    pub fn fail_erases(&self) {
        self.state.borrow_mut().fail_erases = true;
    }

    pub fn heal(&self) {
        let mut state = self.state.borrow_mut();
        state.fail_writes_from = None;
        state.fail_erases = false;
    }

    /// Overwrite a byte, bypassing NOR semantics.
    pub fn corrupt(&self, offset: usize, value: u8) {
        self.state.borrow_mut().data[offset] = value;
    }

    pub fn write_count(&self) -> usize {
        self.state.borrow().writes
    }

    pub fn erase_count(&self) -> usize {
        self.state.borrow().erases
    }

    pub fn bytes_programmed(&self) -> usize {
        self.state.borrow().bytes_programmed
    }

    fn check(&self, offset: u32, len: usize, align: usize) -> Result<usize, MockFlashError> {
        let start = offset as usize;
        if start % align != 0 || len % align != 0 {
            return Err(MockFlashError(NorFlashErrorKind::NotAligned));
        }
        if start + len > self.state.borrow().data.len() {
            return Err(MockFlashError(NorFlashErrorKind::OutOfBounds));
        }
        Ok(start)
    }
}

impl ErrorType for MockFlash {
    type Error = MockFlashError;
}

impl ReadNorFlash for MockFlash {
    const READ_SIZE: usize = 4;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        let start = self.check(offset, bytes.len(), Self::READ_SIZE)?;
        bytes.copy_from_slice(&self.state.borrow().data[start..start + bytes.len()]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.state.borrow().data.len()
    }
}

impl NorFlash for MockFlash {
    const WRITE_SIZE: usize = 4;
    const ERASE_SIZE: usize = SECTOR_SIZE;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        if from > to {
            return Err(MockFlashError(NorFlashErrorKind::OutOfBounds));
        }
        let start = self.check(from, (to - from) as usize, Self::ERASE_SIZE)?;
        let mut state = self.state.borrow_mut();
        if state.fail_erases {
            return Err(MockFlashError(NorFlashErrorKind::Other));
        }
        state.erases += 1;
        state.data[start..to as usize].fill(0xFF);
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        let start = self.check(offset, bytes.len(), Self::WRITE_SIZE)?;
        let mut state = self.state.borrow_mut();
        if state
            .fail_writes_from
            .is_some_and(|limit| start + bytes.len() > limit)
        {
            return Err(MockFlashError(NorFlashErrorKind::Other));
        }
        state.writes += 1;
        state.bytes_programmed += bytes.len();
        for (cell, byte) in state.data[start..start + bytes.len()].iter_mut().zip(bytes) {
            *cell &= *byte;
        }
        Ok(())
    }
}

/// Two app partitions backed by [`MockFlash`].
pub struct MockFirmwareStorage {
    pub slots: [MockFlash; 2],
    pub opened: Rc<RefCell<Vec<PartitionId>>>,
    pub fail_open: bool,
}

impl MockFirmwareStorage {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: [MockFlash::new(capacity), MockFlash::new(capacity)],
            opened: Rc::default(),
            fail_open: false,
        }
    }

    pub fn slot(&self, id: PartitionId) -> MockFlash {
        self.slots[usize::from(id.as_u8())].clone()
    }
}

impl FirmwareStorage for MockFirmwareStorage {
    type Flash = MockFlash;
    type Validator = EspImageValidator;

    fn open_partition(&mut self, id: PartitionId) -> Result<MockFlash, SessionError> {
        if self.fail_open {
            return Err(SessionError::Partition);
        }
        self.opened.borrow_mut().push(id);
        Ok(self.slot(id))
    }

    fn validator(&self) -> EspImageValidator {
        EspImageValidator::new()
    }
}

// -----------------------------------------------------------------------------
// Images
// -----------------------------------------------------------------------------

/// Builds ESP application images.
#[derive(Debug, Clone, Default)]
pub struct EspImageBuilder {
    segments: Vec<Vec<u8>>,
    hash: bool,
}

impl EspImageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn segment(mut self, data: Vec<u8>) -> Self {
        self.segments.push(data);
        self
    }

    pub fn with_hash(mut self) -> Self {
        self.hash = true;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut image = vec![0u8; 24];
        image[0] = 0xE9;
        image[1] = u8::try_from(self.segments.len()).unwrap();
        image[2] = 0x02;
        image[3] = 0x20;
        image[4..8].copy_from_slice(&0x4008_0000u32.to_le_bytes());
        image[23] = u8::from(self.hash);

        let mut checksum = 0xEFu8;
        for (index, data) in self.segments.iter().enumerate() {
            let load = 0x3F40_0020u32 + u32::try_from(index).unwrap() * 0x1_0000;
            image.extend_from_slice(&load.to_le_bytes());
            image.extend_from_slice(&u32::try_from(data.len()).unwrap().to_le_bytes());
            image.extend_from_slice(data);
            checksum = data.iter().fold(checksum, |acc, b| acc ^ b);
        }

        while image.len() % 16 != 15 {
            image.push(0);
        }
        image.push(checksum);

        if self.hash {
            let digest = Sha256::digest(&image);
            image.extend_from_slice(&digest);
        }
        image
    }
}

pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

/// Single segment hashed image of exactly `total` bytes.
pub fn image_of_size(total: usize) -> Vec<u8> {
    assert!(total % 16 == 0 && total >= 96, "unsupported image size {total}");
    // header + segment header + checksum + digest
    let image = EspImageBuilder::new()
        .segment(pattern(total - 65, 7))
        .with_hash()
        .build();
    assert_eq!(image.len(), total);
    image
}

// -----------------------------------------------------------------------------
// Network
// -----------------------------------------------------------------------------

pub fn http_response(status: u16, headers: &[(&str, &str)], body: &[u8]) -> Vec<u8> {
    let mut response = format!("HTTP/1.1 {status} Status\r\n");
    for (name, value) in headers {
        response.push_str(&format!("{name}: {value}\r\n"));
    }
    response.push_str("\r\n");
    let mut bytes = response.into_bytes();
    bytes.extend_from_slice(body);
    bytes
}

pub fn ok_response(body: &[u8]) -> Vec<u8> {
    let length = body.len().to_string();
    http_response(200, &[("Content-Length", &length)], body)
}

/// `200` reply carrying the head a caching proxy typically adds.
pub fn cdn_response(body: &[u8]) -> Vec<u8> {
    let length = body.len().to_string();
    http_response(
        200,
        &[
            ("Connection", "close"),
            ("Content-Length", &length),
            ("Cache-Control", "max-age=300"),
            ("Content-Security-Policy", "default-src 'none'; style-src 'unsafe-inline'; sandbox"),
            ("Content-Type", "text/plain; charset=utf-8"),
            ("ETag", "\"5b1d3e4bb8c1f0e0f1a2ad05d3c0f1a2b7d36a4d0c3e1f2a9b8c7d6e5f4a3b2c\""),
            ("Strict-Transport-Security", "max-age=31536000"),
            ("X-Content-Type-Options", "nosniff"),
            ("X-Frame-Options", "deny"),
            ("X-XSS-Protection", "1; mode=block"),
            ("X-GitHub-Request-Id", "8A3C:2F1B4D:1E2F3A:2B3C4D:66F0A1B2"),
            ("Accept-Ranges", "bytes"),
            ("Date", "Fri, 16 Oct 2026 09:12:44 GMT"),
            ("Via", "1.1 varnish"),
            ("X-Served-By", "cache-fra-eddf8230072-FRA"),
            ("X-Cache", "HIT"),
            ("X-Cache-Hits", "1"),
            ("X-Timer", "S1760605964.218374,VS0,VE1"),
            ("Vary", "Authorization,Accept-Encoding,Origin"),
            ("Access-Control-Allow-Origin", "*"),
            ("Cross-Origin-Resource-Policy", "cross-origin"),
            ("X-Fastly-Request-ID", "4f0c2a9d1e3b5c7a9f8e6d4c2b0a1f3e5d7c9b8a"),
            ("Expires", "Fri, 16 Oct 2026 09:17:44 GMT"),
            ("Source-Age", "0"),
        ],
        body,
    )
}

/// Byte stream that plays back a canned response.
pub struct ScriptedTransport {
    response: Vec<u8>,
    position: usize,
    max_read: usize,
    fail_at: Option<usize>,
    sent: Rc<RefCell<Vec<u8>>>,
}

impl ScriptedTransport {
    pub fn new(response: Vec<u8>) -> Self {
        Self {
            response,
            position: 0,
            max_read: usize::MAX,
            fail_at: None,
            sent: Rc::default(),
        }
    }

    /// Hand out at most `max_read` bytes per read.
    pub fn with_max_read(mut self, max_read: usize) -> Self {
        self.max_read = max_read;
        self
    }

    /// Time out once `offset` bytes were delivered.
    pub fn timing_out_at(mut self, offset: usize) -> Self {
        self.fail_at = Some(offset);
        self
    }

    pub fn sent(&self) -> Rc<RefCell<Vec<u8>>> {
        self.sent.clone()
    }
}

impl embedded_io_async::ErrorType for ScriptedTransport {
    type Error = ErrorKind;
}

impl embedded_io_async::Read for ScriptedTransport {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        let end = self.fail_at.unwrap_or(usize::MAX).min(self.response.len());
        if self.position >= end {
            if self.fail_at.is_some_and(|at| self.position >= at) {
                return Err(ErrorKind::TimedOut);
            }
            return Ok(0);
        }
        let n = buf.len().min(self.max_read).min(end - self.position);
        buf[..n].copy_from_slice(&self.response[self.position..self.position + n]);
        self.position += n;
        Ok(n)
    }
}

impl embedded_io_async::Write for ScriptedTransport {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.sent.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

pub enum ScriptedReply {
    Respond(ScriptedTransport),
    Refuse,
}

/// Connector that answers each connection with the next scripted reply.
///
/// Runs out of replies by refusing connections.
#[derive(Default)]
pub struct ScriptedConnector {
    replies: VecDeque<ScriptedReply>,
    pub requests: Rc<RefCell<Vec<String>>>,
    pub sent: Rc<RefCell<Vec<u8>>>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(mut self, transport: ScriptedTransport) -> Self {
        self.replies.push_back(ScriptedReply::Respond(transport));
        self
    }

    pub fn refuse(mut self) -> Self {
        self.replies.push_back(ScriptedReply::Refuse);
        self
    }
}

impl Connector for ScriptedConnector {
    type Connection<'a>
        = ScriptedTransport
    where
        Self: 'a;

    async fn connect(&mut self, url: &Url<'_>) -> Result<ScriptedTransport, HttpError> {
        self.requests
            .borrow_mut()
            .push(format!("{}:{}{}", url.host, url.port, url.path));
        match self.replies.pop_front() {
            Some(ScriptedReply::Respond(mut transport)) => {
                transport.sent = self.sent.clone();
                Ok(transport)
            }
            Some(ScriptedReply::Refuse) | None => Err(HttpError::Connect),
        }
    }
}

// -----------------------------------------------------------------------------
// Update ports
// -----------------------------------------------------------------------------

/// Version source answering from a queue, timing out once it is empty.
#[derive(Default)]
pub struct MockVersionSource {
    replies: VecDeque<Result<VersionDescriptor, FetchError>>,
    pub calls: Rc<Cell<usize>>,
}

impl MockVersionSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn returning(mut self, token: &str) -> Self {
        self.replies.push_back(Ok(version(token)));
        self
    }

    pub fn failing(mut self, error: FetchError) -> Self {
        self.replies.push_back(Err(error));
        self
    }
}

impl VersionSource for MockVersionSource {
    async fn fetch_version(&mut self) -> Result<VersionDescriptor, FetchError> {
        self.calls.set(self.calls.get() + 1);
        self.replies
            .pop_front()
            .unwrap_or(Err(FetchError::Transport))
    }
}

#[derive(Debug, Clone)]
pub struct MockArtifact {
    pub data: Vec<u8>,
    pub declared: Option<usize>,
    /// Stream ends after this many bytes
    pub cut_at: Option<usize>,
    /// Stream fails after this many bytes
    pub fail_at: Option<usize>,
    pub chunk_size: usize,
}

impl MockArtifact {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            declared: Some(data.len()),
            data,
            cut_at: None,
            fail_at: None,
            chunk_size: 1024,
        }
    }
}

/// Artifact source serving the same artifact on every open.
pub struct MockArtifactSource {
    artifact: MockArtifact,
    open_error: Option<FetchError>,
    pub opens: Rc<Cell<usize>>,
    pub served: Rc<Cell<usize>>,
}

impl MockArtifactSource {
    pub fn new(artifact: MockArtifact) -> Self {
        Self {
            artifact,
            open_error: None,
            opens: Rc::default(),
            served: Rc::default(),
        }
    }

    pub fn failing(error: FetchError) -> Self {
        let mut source = Self::new(MockArtifact::new(Vec::new()));
        source.open_error = Some(error);
        source
    }
}

impl ArtifactSource for MockArtifactSource {
    type Stream<'a>
        = MockArtifactStream<'a>
    where
        Self: 'a;

    async fn open(&mut self, _url: &str) -> Result<MockArtifactStream<'_>, FetchError> {
        self.opens.set(self.opens.get() + 1);
        if let Some(error) = self.open_error {
            return Err(error);
        }
        Ok(MockArtifactStream {
            artifact: &self.artifact,
            position: 0,
            served: self.served.clone(),
        })
    }
}

pub struct MockArtifactStream<'a> {
    artifact: &'a MockArtifact,
    position: usize,
    served: Rc<Cell<usize>>,
}

impl ArtifactStream for MockArtifactStream<'_> {
    fn declared_length(&self) -> Option<usize> {
        self.artifact.declared
    }

    async fn next_chunk(&mut self) -> Result<Option<&[u8]>, FetchError> {
        if self.artifact.fail_at.is_some_and(|at| self.position >= at) {
            return Err(FetchError::Transport);
        }
        let end = self
            .artifact
            .cut_at
            .unwrap_or(usize::MAX)
            .min(self.artifact.fail_at.unwrap_or(usize::MAX))
            .min(self.artifact.data.len());
        if self.position >= end {
            return Ok(None);
        }

        let start = self.position;
        self.position = (start + self.artifact.chunk_size).min(end);
        self.served.set(self.position);
        Ok(Some(&self.artifact.data[start..self.position]))
    }
}

#[derive(Debug, Default)]
pub struct MemoryStoreState {
    pub record: Option<BootRecord>,
    pub stores: usize,
    pub fail: bool,
}

/// In-memory boot record store.
#[derive(Debug, Clone, Default)]
pub struct MemoryBootRecordStore {
    pub state: Rc<RefCell<MemoryStoreState>>,
}

impl MemoryBootRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(record: BootRecord) -> Self {
        let store = Self::default();
        store.state.borrow_mut().record = Some(record);
        store
    }

    pub fn record(&self) -> Option<BootRecord> {
        self.state.borrow().record.clone()
    }

    pub fn stores(&self) -> usize {
        self.state.borrow().stores
    }

    pub fn set_failing(&self, fail: bool) {
        self.state.borrow_mut().fail = fail;
    }
}

impl BootRecordStore for MemoryBootRecordStore {
    fn load(&mut self) -> Result<Option<BootRecord>, BootError> {
        Ok(self.state.borrow().record.clone())
    }

    fn store(&mut self, record: &BootRecord) -> Result<(), BootError> {
        let mut state = self.state.borrow_mut();
        if state.fail {
            return Err(BootError::Persist);
        }
        state.stores += 1;
        state.record = Some(record.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecordingRestart {
    pub count: Rc<Cell<usize>>,
}

impl Restart for RecordingRestart {
    fn restart(&mut self) {
        self.count.set(self.count.get() + 1);
    }
}
