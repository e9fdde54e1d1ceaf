//! Update task
//!
//! Builds the orchestrator from the hardware ports and polls forever. Only
//! started once the station has an address.

use embassy_net::Stack;
use esp_println::println;
use myrtio_core::net::TcpConnector;
use myrtio_ota::{
    BootRecord,
    BootSelector,
    HttpArtifactClient,
    HttpVersionClient,
    UpdateConfig,
    UpdateOrchestrator,
    VersionDescriptor,
};

use crate::infrastructure::{
    config,
    services::{EspRestart, OtaService},
};

const VERSION_RX_BUFFER_SIZE: usize = 1024;
const VERSION_TX_BUFFER_SIZE: usize = 512;
const DOWNLOAD_RX_BUFFER_SIZE: usize = 4096;
const DOWNLOAD_TX_BUFFER_SIZE: usize = 512;

#[embassy_executor::task]
pub(crate) async fn ota_task(stack: Stack<'static>, ota: OtaService) {
    let firmware = &config::FIRMWARE;
    let Ok(build_version) = VersionDescriptor::from_str_trimmed(firmware.version) else {
        println!("ota: build version {:?} is not a valid token", firmware.version);
        return;
    };

    let store = match ota.boot_record_store() {
        Ok(store) => store,
        Err(e) => {
            println!("ota: boot record unavailable: {:?}", e);
            return;
        }
    };
    let running = ota.running_partition();
    let mut boot = BootSelector::new(store, BootRecord::new(running, build_version.clone()));
    match boot.reconcile(running, build_version) {
        Ok(true) => println!("ota: boot record rewritten for {:?}", running),
        Ok(false) => {}
        Err(e) => println!("ota: failed to reconcile boot record: {:?}", e),
    }
    if let Some((partition, version)) = &boot.record().previous {
        println!("ota: previous image {} on {:?}", version, partition);
    }

    let versions = HttpVersionClient::new(
        TcpConnector::<VERSION_RX_BUFFER_SIZE, VERSION_TX_BUFFER_SIZE>::new(
            stack,
            firmware.version_timeout,
        ),
        firmware.version_url,
    );
    let artifacts = HttpArtifactClient::new(TcpConnector::<
        DOWNLOAD_RX_BUFFER_SIZE,
        DOWNLOAD_TX_BUFFER_SIZE,
    >::new(stack, firmware.download_timeout));
    let update_config =
        UpdateConfig::new(firmware.firmware_url).with_poll_interval(firmware.poll_interval);

    let mut orchestrator = UpdateOrchestrator::new(
        versions,
        artifacts,
        ota.firmware_storage(),
        boot,
        EspRestart,
        update_config,
    );
    orchestrator.run().await
}
